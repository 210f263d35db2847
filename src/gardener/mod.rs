//! Gardener inventory: virtual-garden client, seed/shoot/node
//! collectors, and the managed-seed client broker.
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use once_cell::sync::OnceCell;
use snafu::{OptionExt, ResultExt, Snafu};
use sqlx::PgPool;

use crate::config::GardenerConfig;
use crate::gcp::api::TokenSource;

pub mod broker;
pub mod expiry;
pub mod links;
pub mod soil;
pub mod tasks;

/// Namespace in the virtual garden holding seeds and their backing
/// shoots.
pub const GARDEN_NAMESPACE: &str = "garden";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("gardener is not configured"))]
    NotConfigured,

    #[snafu(display("failed to read garden kubeconfig: {}", source))]
    ReadKubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("failed to build garden client config: {}", source))]
    BuildConfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("failed to build garden client: {}", source))]
    BuildClient { source: kube::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

static GARDEN: OnceCell<kube::Client> = OnceCell::new();
static BROKER: OnceCell<Arc<broker::ClientBroker>> = OnceCell::new();

/// Builds the virtual-garden client and the managed-seed broker.
pub async fn configure(
    cfg: &GardenerConfig,
    db: PgPool,
    token_source: Option<TokenSource>,
) -> Result<()> {
    let client = garden_client(cfg).await?;
    let _ = GARDEN.set(client.clone());
    let _ = BROKER.set(Arc::new(broker::ClientBroker::new(
        client,
        cfg,
        db,
        token_source,
    )));
    Ok(())
}

async fn garden_client(cfg: &GardenerConfig) -> Result<kube::Client> {
    let kubeconfig = Kubeconfig::read_from(&cfg.kubeconfig).context(ReadKubeconfig)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(BuildConfig)?;
    kube::Client::try_from(config).context(BuildClient)
}

pub(crate) fn garden() -> Result<kube::Client> {
    GARDEN.get().cloned().context(NotConfigured)
}

pub(crate) fn seed_broker() -> Result<Arc<broker::ClientBroker>> {
    BROKER.get().cloned().context(NotConfigured)
}

pub fn register_tasks() {
    tasks::register();
    links::register();
}

pub fn register_metrics() {
    tasks::register_metrics();
}

/// String at a JSON pointer, empty when absent or not a string.
#[must_use]
pub(crate) fn str_at(value: &serde_json::Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Bool at a JSON pointer, `false` when absent.
#[must_use]
pub(crate) fn bool_at(value: &serde_json::Value, pointer: &str) -> bool {
    value
        .pointer(pointer)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_helpers_default_on_missing_paths() {
        let value = serde_json::json!({
            "spec": {"provider": {"type": "gcp", "region": "europe-west3"}},
            "status": {"hibernated": true}
        });
        assert_eq!(str_at(&value, "/spec/provider/type"), "gcp");
        assert_eq!(str_at(&value, "/spec/provider/missing"), "");
        assert_eq!(str_at(&value, "/status/hibernated"), "");
        assert!(bool_at(&value, "/status/hibernated"));
        assert!(!bool_at(&value, "/status/missing"));
    }
}
