//! Managed-seed client broker.
//!
//! Seed access goes through short-lived viewerkubeconfigs issued by the
//! virtual garden. Fetched kubeconfigs are cached in a registry keyed by
//! seed name and reused until their credential is within
//! [`expiry::EXPIRY_WINDOW`] of expiry. An exclusion list short-circuits
//! before any fetch; the regional soil seed is resolved through the GKE
//! cluster recorded in the inventory instead.
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use kube::config::{KubeConfigOptions, Kubeconfig};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::PgPool;
use tracing::debug;

use super::{expiry, soil, GARDEN_NAMESPACE};
use crate::config::{GardenerConfig, SoilConfig};
use crate::gcp::api::TokenSource;
use crate::registry::Registry;

/// Requested viewerkubeconfig lifetime.
const VIEWER_KUBECONFIG_TTL_SECS: u64 = 3600;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("seed {} is excluded", seed))]
    SeedExcluded { seed: String },

    #[snafu(display("failed to build viewerkubeconfig request: {}", source))]
    BuildRequest { source: http::Error },

    #[snafu(display("failed to fetch viewerkubeconfig for seed {}: {}", seed, source))]
    FetchViewerKubeconfig { seed: String, source: kube::Error },

    #[snafu(display("viewerkubeconfig response for seed {} carries no kubeconfig", seed))]
    MissingKubeconfig { seed: String },

    #[snafu(display("failed to decode viewerkubeconfig: {}", source))]
    DecodeKubeconfig { source: base64::DecodeError },

    #[snafu(display("viewerkubeconfig is not valid UTF-8: {}", source))]
    InvalidUtf8 { source: std::string::FromUtf8Error },

    #[snafu(display("failed to check kubeconfig expiry: {}", source))]
    Expiry { source: expiry::Error },

    #[snafu(display("failed to parse kubeconfig: {}", source))]
    ParseKubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("failed to build seed client: {}", source))]
    BuildClient { source: kube::Error },

    #[snafu(display("failed to build soil client: {}", source))]
    Soil { source: soil::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct ClientBroker {
    garden: kube::Client,
    kubeconfigs: Registry<String, String>,
    excluded: Vec<String>,
    soil: Option<SoilConfig>,
    db: PgPool,
    token_source: Option<TokenSource>,
}

impl ClientBroker {
    #[must_use]
    pub fn new(
        garden: kube::Client,
        cfg: &GardenerConfig,
        db: PgPool,
        token_source: Option<TokenSource>,
    ) -> Self {
        Self {
            garden,
            kubeconfigs: Registry::new(),
            excluded: cfg.excluded_seeds.clone(),
            soil: cfg.soil.clone(),
            db,
            token_source,
        }
    }

    /// A client for the named managed seed. Cached kubeconfigs are
    /// reused while their credential stays out of the expiry window.
    pub async fn client_for_seed(&self, seed: &str) -> Result<kube::Client> {
        ensure!(
            !self.excluded.iter().any(|excluded| excluded == seed),
            SeedExcluded {
                seed: seed.to_owned()
            }
        );

        if let Some(soil) = &self.soil {
            if soil.seed_name == seed {
                return soil::client(&self.db, soil, self.token_source.as_ref())
                    .await
                    .context(Soil);
            }
        }

        if let Some(cached) = self.kubeconfigs.get(seed) {
            if !expiry::expires_within(&cached, expiry::EXPIRY_WINDOW).context(Expiry)? {
                debug!(seed, "reusing cached seed kubeconfig");
                return build_client(&cached).await;
            }
        }

        let fresh = self.fetch_viewer_kubeconfig(seed).await?;
        self.kubeconfigs.overwrite(seed.to_owned(), fresh.clone());
        build_client(&fresh).await
    }

    /// Requests a fresh short-lived viewerkubeconfig through the backing
    /// shoot's subresource in the garden namespace.
    async fn fetch_viewer_kubeconfig(&self, seed: &str) -> Result<String> {
        let body = serde_json::json!({
            "apiVersion": "authentication.gardener.cloud/v1alpha1",
            "kind": "ViewerKubeconfigRequest",
            "spec": {"expirationSeconds": VIEWER_KUBECONFIG_TTL_SECS},
        });
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(format!(
                "/apis/core.gardener.cloud/v1beta1/namespaces/{GARDEN_NAMESPACE}/shoots/{seed}/viewerkubeconfig"
            ))
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body.to_string().into_bytes())
            .context(BuildRequest)?;
        let response: serde_json::Value =
            self.garden
                .request(request)
                .await
                .context(FetchViewerKubeconfig {
                    seed: seed.to_owned(),
                })?;
        let encoded = response
            .pointer("/status/kubeconfig")
            .and_then(serde_json::Value::as_str)
            .context(MissingKubeconfig {
                seed: seed.to_owned(),
            })?;
        let raw = STANDARD.decode(encoded).context(DecodeKubeconfig)?;
        debug!(seed, "fetched fresh viewerkubeconfig");
        String::from_utf8(raw).context(InvalidUtf8)
    }
}

/// Parses a kubeconfig document and builds a client from it.
pub(crate) async fn build_client(kubeconfig_yaml: &str) -> Result<kube::Client> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml).context(ParseKubeconfig)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(ParseKubeconfig)?;
    kube::Client::try_from(config).context(BuildClient)
}
