//! Credential expiry checks for cached seed kubeconfigs.
//!
//! A kubeconfig is reused only while its bearer token (JWT `exp`) or
//! client certificate (X.509 `NotAfter`) is valid beyond the window.
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

/// Credentials within a minute of expiry are treated as expired.
pub(crate) const EXPIRY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse kubeconfig: {}", source))]
    ParseKubeconfig { source: serde_yaml::Error },

    #[snafu(display("malformed JWT: no payload segment"))]
    MalformedJwt,

    #[snafu(display("failed to decode JWT payload: {}", source))]
    DecodeJwtPayload { source: base64::DecodeError },

    #[snafu(display("failed to parse JWT claims: {}", source))]
    ParseJwtClaims { source: serde_json::Error },

    #[snafu(display("JWT carries an invalid expiry timestamp"))]
    InvalidExpiry,

    #[snafu(display("failed to decode client certificate: {}", source))]
    DecodeCertificate { source: base64::DecodeError },

    #[snafu(display("failed to parse client certificate: {}", source))]
    ParseCertificate {
        source: openssl::error::ErrorStack,
    },

    #[snafu(display("failed to compare certificate validity: {}", source))]
    CompareValidity {
        source: openssl::error::ErrorStack,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// Whether the kubeconfig's first user credential expires within the
/// window. A kubeconfig without a recognizable credential counts as
/// expired so the caller fetches a fresh one.
pub fn expires_within(kubeconfig_yaml: &str, window: Duration) -> Result<bool> {
    let doc: serde_yaml::Value = serde_yaml::from_str(kubeconfig_yaml).context(ParseKubeconfig)?;
    let user = &doc["users"][0]["user"];
    let deadline = Utc::now()
        + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60));

    if let Some(token) = user.get("token").and_then(serde_yaml::Value::as_str) {
        return Ok(jwt_expiry(token)? <= deadline);
    }
    if let Some(cert) = user
        .get("client-certificate-data")
        .and_then(serde_yaml::Value::as_str)
    {
        return certificate_expires_by(cert, deadline);
    }
    Ok(true)
}

/// Decodes the `exp` claim from the middle JWT segment. The signature is
/// deliberately not verified: only the lifetime matters here.
pub(crate) fn jwt_expiry(token: &str) -> Result<DateTime<Utc>> {
    let payload = token.split('.').nth(1).context(MalformedJwt)?;
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .context(DecodeJwtPayload)?;
    let claims: Claims = serde_json::from_slice(&raw).context(ParseJwtClaims)?;
    DateTime::from_timestamp(claims.exp, 0).context(InvalidExpiry)
}

fn certificate_expires_by(cert_b64: &str, deadline: DateTime<Utc>) -> Result<bool> {
    let pem = STANDARD.decode(cert_b64).context(DecodeCertificate)?;
    let certificate = openssl::x509::X509::from_pem(&pem).context(ParseCertificate)?;
    let deadline =
        openssl::asn1::Asn1Time::from_unix(deadline.timestamp()).context(ParseCertificate)?;
    let ordering = certificate
        .not_after()
        .compare(&deadline)
        .context(CompareValidity)?;
    Ok(ordering != std::cmp::Ordering::Greater)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
        format!("{header}.{payload}.signature")
    }

    fn kubeconfig_with_token(token: &str) -> String {
        format!(
            "apiVersion: v1\nkind: Config\nusers:\n- name: viewer\n  user:\n    token: {token}\n"
        )
    }

    #[test]
    fn jwt_exp_is_decoded_from_the_middle_segment() {
        let expiry = jwt_expiry(&make_jwt(4_102_444_800)).unwrap();
        assert_eq!(expiry.timestamp(), 4_102_444_800);
    }

    #[test]
    fn malformed_jwt_is_an_error() {
        assert!(jwt_expiry("not-a-jwt").is_err());
        assert!(jwt_expiry("a.!!!.c").is_err());
    }

    #[test]
    fn fresh_token_is_not_expiring() {
        let yaml = kubeconfig_with_token(&make_jwt(4_102_444_800));
        assert!(!expires_within(&yaml, EXPIRY_WINDOW).unwrap());
    }

    #[test]
    fn stale_token_is_expiring() {
        let yaml = kubeconfig_with_token(&make_jwt(946_684_800));
        assert!(expires_within(&yaml, EXPIRY_WINDOW).unwrap());
    }

    #[test]
    fn token_inside_the_window_is_expiring() {
        let exp = (Utc::now() + chrono::Duration::seconds(30)).timestamp();
        let yaml = kubeconfig_with_token(&make_jwt(exp));
        assert!(expires_within(&yaml, EXPIRY_WINDOW).unwrap());
    }

    #[test]
    fn kubeconfig_without_credentials_counts_as_expired() {
        let yaml = "apiVersion: v1\nkind: Config\nusers:\n- name: viewer\n  user: {}\n";
        assert!(expires_within(yaml, EXPIRY_WINDOW).unwrap());
    }
}
