//! Regional soil access.
//!
//! The soil seed has no viewerkubeconfig; its client is assembled from
//! the GKE cluster endpoint and CA recorded by the GKE collector, plus
//! an OAuth2 bearer token from the GCP token source.
use snafu::{OptionExt, ResultExt, Snafu};
use sqlx::PgPool;

use super::broker;
use crate::config::SoilConfig;
use crate::gcp::api::TokenSource;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up soil cluster: {}", source))]
    Lookup { source: sqlx::Error },

    #[snafu(display("soil cluster {} not found in inventory", cluster))]
    ClusterNotFound { cluster: String },

    #[snafu(display("no GCP token source configured for soil access"))]
    NoTokenSource,

    #[snafu(display("failed to obtain soil token: {}", source))]
    Token { source: crate::gcp::api::Error },

    #[snafu(display("failed to build soil client: {}", source))]
    BuildClient { source: Box<broker::Error> },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) async fn client(
    db: &PgPool,
    soil: &SoilConfig,
    token_source: Option<&TokenSource>,
) -> Result<kube::Client> {
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT endpoint, ca_certificate FROM gcp_gke_clusters WHERE name = $1 ORDER BY id LIMIT 1",
    )
    .bind(&soil.cluster_name)
    .fetch_optional(db)
    .await
    .context(Lookup)?;
    let (endpoint, ca_certificate) = row.context(ClusterNotFound {
        cluster: soil.cluster_name.clone(),
    })?;
    let token = token_source
        .context(NoTokenSource)?
        .token()
        .context(Token)?;

    let kubeconfig = soil_kubeconfig(&soil.cluster_name, &endpoint, &ca_certificate, &token);
    broker::build_client(&kubeconfig)
        .await
        .map_err(|err| Error::BuildClient {
            source: Box::new(err),
        })
}

/// Renders a one-user kubeconfig for the soil cluster so client
/// construction shares the broker's kubeconfig path.
fn soil_kubeconfig(name: &str, endpoint: &str, ca_certificate: &str, token: &str) -> String {
    let document = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Config",
        "current-context": name,
        "clusters": [{
            "name": name,
            "cluster": {
                "server": format!("https://{endpoint}"),
                "certificate-authority-data": ca_certificate,
            },
        }],
        "users": [{
            "name": name,
            "user": {"token": token},
        }],
        "contexts": [{
            "name": name,
            "context": {"cluster": name, "user": name},
        }],
    });
    serde_yaml::to_string(&document).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soil_kubeconfig_parses_as_a_kubeconfig() {
        let yaml = soil_kubeconfig("regional-soil", "34.89.1.2", "Y2EtZGF0YQ==", "ya29.token");
        let kubeconfig = kube::config::Kubeconfig::from_yaml(&yaml).unwrap();
        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(
            kubeconfig.clusters[0].cluster.as_ref().unwrap().server,
            Some("https://34.89.1.2".to_owned())
        );
        assert_eq!(kubeconfig.current_context.as_deref(), Some("regional-soil"));
    }
}
