//! Vault client with background token-lifetime management.
//!
//! On start the client either looks up the pre-configured token or logs
//! in through the JWT auth method. Renewable tokens are renewed on a
//! ticker at 0.8 of their TTL; when renewal fails and an auth method is
//! configured, a full re-login is attempted. Non-renewable tokens with an
//! auth method are re-acquired on the same cadence; without one there is
//! no background activity.
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{VaultAuthConfig, VaultConfig, VaultTlsConfig};

pub const RENEW_FACTOR: f64 = 0.8;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid vault address {:?}: {}", address, source))]
    ParseAddress {
        address: String,
        source: url::ParseError,
    },

    #[snafu(display("failed to build vault http client: {}", source))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("failed to read CA certificate: {}", source))]
    ReadCaCert { source: std::io::Error },

    #[snafu(display("failed to read client certificate: {}", source))]
    ReadClientCert { source: std::io::Error },

    #[snafu(display("failed to read JWT: {}", source))]
    ReadJwt { source: std::io::Error },

    #[snafu(display("environment variable {} carries no JWT", var))]
    JwtEnvLookup { var: String },

    #[snafu(display("no token and no auth method configured"))]
    NoAuthMaterial,

    #[snafu(display("vault request failed: {}", source))]
    Request { source: reqwest::Error },

    #[snafu(display("failed to decode vault response: {}", source))]
    Decode { source: reqwest::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenStatus {
    pub ttl: Duration,
    pub renewable: bool,
}

/// Interval between renewals for a token with the given TTL.
#[must_use]
pub fn renewal_interval(ttl: Duration) -> Duration {
    ttl.mul_f64(RENEW_FACTOR)
}

pub struct Client {
    http: reqwest::Client,
    address: Url,
    auth: Option<VaultAuthConfig>,
    token: RwLock<String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: AuthData,
}

#[derive(Debug, Deserialize)]
struct AuthData {
    client_token: String,
    lease_duration: u64,
    renewable: bool,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    data: LookupData,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    ttl: u64,
    renewable: bool,
}

impl Client {
    pub fn new(cfg: &VaultConfig) -> Result<Self> {
        let address = Url::parse(&cfg.address).context(ParseAddress {
            address: cfg.address.clone(),
        })?;
        Ok(Self {
            http: build_http_client(&cfg.tls)?,
            address,
            auth: cfg.auth.clone(),
            token: RwLock::new(cfg.token.clone().unwrap_or_default()),
        })
    }

    /// The current token, for callers issuing their own Vault reads.
    pub async fn token(&self) -> String {
        self.token.read().await.clone()
    }

    /// Establishes the initial token status and spawns the maintenance
    /// loop when the token needs background care.
    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<TokenStatus> {
        let has_token = !self.token.read().await.is_empty();
        let status = if has_token {
            self.lookup_self().await?
        } else if self.auth.is_some() {
            self.login().await?
        } else {
            return NoAuthMaterial.fail();
        };
        info!(
            ttl_secs = status.ttl.as_secs(),
            renewable = status.renewable,
            "vault token established"
        );
        if status.renewable || self.auth.is_some() {
            let client = Arc::clone(&self);
            tokio::spawn(client.maintain(status, shutdown));
        }
        Ok(status)
    }

    async fn maintain(self: Arc<Self>, mut status: TokenStatus, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = renewal_interval(status.ttl);
            if interval.is_zero() {
                warn!("vault token has no usable ttl, stopping renewal");
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
            status = if status.renewable {
                match self.renew_self().await {
                    Ok(next) => {
                        debug!(ttl_secs = next.ttl.as_secs(), "vault token renewed");
                        next
                    }
                    Err(err) if self.auth.is_some() => {
                        warn!("vault renewal failed, attempting fresh login: {}", err);
                        match self.login().await {
                            Ok(next) => next,
                            Err(err) => {
                                warn!("vault login failed: {}", err);
                                status
                            }
                        }
                    }
                    Err(err) => {
                        warn!("vault renewal failed: {}", err);
                        status
                    }
                }
            } else {
                // Not renewable; maintain() only runs with an auth method.
                match self.login().await {
                    Ok(next) => next,
                    Err(err) => {
                        warn!("vault re-login failed: {}", err);
                        status
                    }
                }
            };
        }
    }

    async fn login(&self) -> Result<TokenStatus> {
        let auth = self.auth.as_ref().context(NoAuthMaterial)?;
        let jwt = read_jwt(auth)?;
        let url = self.endpoint(&format!("v1/auth/{}/login", auth.mount));
        let response: AuthResponse = self
            .http
            .post(url)
            .json(&serde_json::json!({ "role": auth.role, "jwt": jwt }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(Request)?
            .json()
            .await
            .context(Decode)?;
        *self.token.write().await = response.auth.client_token;
        Ok(TokenStatus {
            ttl: Duration::from_secs(response.auth.lease_duration),
            renewable: response.auth.renewable,
        })
    }

    async fn lookup_self(&self) -> Result<TokenStatus> {
        let url = self.endpoint("v1/auth/token/lookup-self");
        let token = self.token().await;
        let response: LookupResponse = self
            .http
            .get(url)
            .header("X-Vault-Token", token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(Request)?
            .json()
            .await
            .context(Decode)?;
        Ok(TokenStatus {
            ttl: Duration::from_secs(response.data.ttl),
            renewable: response.data.renewable,
        })
    }

    async fn renew_self(&self) -> Result<TokenStatus> {
        let url = self.endpoint("v1/auth/token/renew-self");
        let token = self.token().await;
        let response: AuthResponse = self
            .http
            .post(url)
            .header("X-Vault-Token", token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(Request)?
            .json()
            .await
            .context(Decode)?;
        *self.token.write().await = response.auth.client_token;
        Ok(TokenStatus {
            ttl: Duration::from_secs(response.auth.lease_duration),
            renewable: response.auth.renewable,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.address.clone();
        url.set_path(path);
        url
    }
}

fn build_http_client(tls: &VaultTlsConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(path) = &tls.ca_cert {
        let pem = std::fs::read(path).context(ReadCaCert)?;
        let cert = reqwest::Certificate::from_pem(&pem).context(BuildHttpClient)?;
        builder = builder.add_root_certificate(cert);
    }
    if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
        let mut pem = std::fs::read(cert).context(ReadClientCert)?;
        pem.extend(std::fs::read(key).context(ReadClientCert)?);
        let identity = reqwest::Identity::from_pem(&pem).context(BuildHttpClient)?;
        builder = builder.identity(identity);
    }
    if tls.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(name) = &tls.server_name {
        debug!(server_name = %name, "vault server name taken from the address host");
    }
    builder.build().context(BuildHttpClient)
}

fn read_jwt(auth: &VaultAuthConfig) -> Result<String> {
    if let Some(path) = &auth.jwt_file {
        let raw = std::fs::read_to_string(path).context(ReadJwt)?;
        return Ok(raw.trim().to_owned());
    }
    if let Some(var) = &auth.jwt_env {
        return std::env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .context(JwtEnvLookup { var: var.clone() });
    }
    NoAuthMaterial.fail()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_interval_is_eighty_percent_of_ttl() {
        assert_eq!(
            renewal_interval(Duration::from_secs(100)),
            Duration::from_secs(80)
        );
        assert_eq!(
            renewal_interval(Duration::from_secs(3600)),
            Duration::from_secs(2880)
        );
        assert!(renewal_interval(Duration::ZERO).is_zero());
    }

    #[test]
    fn auth_response_decodes() {
        let raw = r#"{
            "auth": {
                "client_token": "hvs.token",
                "lease_duration": 764,
                "renewable": true,
                "policies": ["default"]
            }
        }"#;
        let response: AuthResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.auth.client_token, "hvs.token");
        assert_eq!(response.auth.lease_duration, 764);
        assert!(response.auth.renewable);
    }

    #[test]
    fn lookup_response_decodes() {
        let raw = r#"{"data": {"ttl": 3600, "renewable": false, "display_name": "token"}}"#;
        let response: LookupResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.data.ttl, 3600);
        assert!(!response.data.renewable);
    }
}
