//! Thin typed client for the GCP REST surfaces the collectors use.
//!
//! Listing calls paginate with `pageToken`/`maxResults`; aggregated lists
//! additionally set `returnPartialSuccess` so one broken zone never fails
//! the whole call. Authentication is a bearer token from a pluggable
//! source refreshed out-of-band.
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use url::Url;

use crate::config::GcpConfig;

const DEFAULT_COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1/";
const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com/storage/v1/";
const DEFAULT_RESOURCEMANAGER_ENDPOINT: &str = "https://cloudresourcemanager.googleapis.com/v1/";
const DEFAULT_CONTAINER_ENDPOINT: &str = "https://container.googleapis.com/v1/";

pub(crate) const PAGE_SIZE: &str = "100";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to build GCP http client: {}", source))]
    BuildHttpClient { source: reqwest::Error },

    #[snafu(display("invalid GCP endpoint {:?}: {}", endpoint, source))]
    ParseEndpoint {
        endpoint: String,
        source: url::ParseError,
    },

    #[snafu(display("invalid GCP request path {:?}: {}", path, source))]
    BuildRequestUrl {
        path: String,
        source: url::ParseError,
    },

    #[snafu(display("no GCP token source configured"))]
    NoTokenSource,

    #[snafu(display("failed to read GCP token: {}", source))]
    ReadToken { source: std::io::Error },

    #[snafu(display("GCP request failed: {}", source))]
    Request { source: reqwest::Error },

    #[snafu(display("failed to decode GCP response: {}", source))]
    Decode { source: reqwest::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Authorization and quota faults will not go away on retry.
#[must_use]
pub(crate) fn is_permanent(err: &Error) -> bool {
    match err {
        Error::Request { source } => source.status().is_some_and(|status| {
            matches!(status.as_u16(), 400 | 401 | 403 | 404)
        }),
        Error::NoTokenSource => true,
        _ => false,
    }
}

/// Where bearer tokens come from. The file variant is re-read on every
/// call because the token is short-lived and rotated externally.
#[derive(Debug, Clone)]
pub enum TokenSource {
    Static(String),
    File(PathBuf),
}

impl TokenSource {
    #[must_use]
    pub fn from_config(cfg: &GcpConfig) -> Option<Self> {
        if let Some(token) = &cfg.token {
            return Some(Self::Static(token.clone()));
        }
        cfg.token_file.clone().map(Self::File)
    }

    pub fn token(&self) -> Result<String> {
        match self {
            Self::Static(token) => Ok(token.clone()),
            Self::File(path) => {
                let raw = std::fs::read_to_string(path).context(ReadToken)?;
                Ok(raw.trim().to_owned())
            }
        }
    }
}

pub struct Api {
    http: reqwest::Client,
    token: TokenSource,
    compute: Url,
    storage: Url,
    resourcemanager: Url,
    container: Url,
}

impl Api {
    pub fn new(cfg: &GcpConfig) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build().context(BuildHttpClient)?,
            token: TokenSource::from_config(cfg).context(NoTokenSource)?,
            compute: parse_endpoint(
                cfg.compute_endpoint.as_deref(),
                DEFAULT_COMPUTE_ENDPOINT,
            )?,
            storage: parse_endpoint(
                cfg.storage_endpoint.as_deref(),
                DEFAULT_STORAGE_ENDPOINT,
            )?,
            resourcemanager: parse_endpoint(
                cfg.resourcemanager_endpoint.as_deref(),
                DEFAULT_RESOURCEMANAGER_ENDPOINT,
            )?,
            container: parse_endpoint(
                cfg.container_endpoint.as_deref(),
                DEFAULT_CONTAINER_ENDPOINT,
            )?,
        })
    }

    #[must_use]
    pub fn token_source(&self) -> &TokenSource {
        &self.token
    }

    pub async fn list_projects(&self, page_token: Option<&str>) -> Result<ProjectList> {
        let mut url = join(&self.resourcemanager, "projects")?;
        url.query_pairs_mut().append_pair("pageSize", PAGE_SIZE);
        append_page_token(&mut url, page_token);
        self.get_json(url).await
    }

    pub async fn aggregated_instances(
        &self,
        project: &str,
        page_token: Option<&str>,
    ) -> Result<InstanceAggregatedList> {
        let mut url = join(
            &self.compute,
            &format!("projects/{project}/aggregated/instances"),
        )?;
        append_aggregated_params(&mut url, page_token);
        self.get_json(url).await
    }

    pub async fn aggregated_disks(
        &self,
        project: &str,
        page_token: Option<&str>,
    ) -> Result<DiskAggregatedList> {
        let mut url = join(
            &self.compute,
            &format!("projects/{project}/aggregated/disks"),
        )?;
        append_aggregated_params(&mut url, page_token);
        self.get_json(url).await
    }

    pub async fn list_networks(
        &self,
        project: &str,
        page_token: Option<&str>,
    ) -> Result<NetworkList> {
        let mut url = join(&self.compute, &format!("projects/{project}/global/networks"))?;
        url.query_pairs_mut().append_pair("maxResults", PAGE_SIZE);
        append_page_token(&mut url, page_token);
        self.get_json(url).await
    }

    pub async fn aggregated_subnetworks(
        &self,
        project: &str,
        page_token: Option<&str>,
    ) -> Result<SubnetworkAggregatedList> {
        let mut url = join(
            &self.compute,
            &format!("projects/{project}/aggregated/subnetworks"),
        )?;
        append_aggregated_params(&mut url, page_token);
        self.get_json(url).await
    }

    pub async fn list_buckets(
        &self,
        project: &str,
        page_token: Option<&str>,
    ) -> Result<BucketList> {
        let mut url = join(&self.storage, "b")?;
        url.query_pairs_mut()
            .append_pair("project", project)
            .append_pair("maxResults", PAGE_SIZE);
        append_page_token(&mut url, page_token);
        self.get_json(url).await
    }

    pub async fn list_clusters(&self, project: &str) -> Result<ClusterList> {
        let url = join(
            &self.container,
            &format!("projects/{project}/locations/-/clusters"),
        )?;
        self.get_json(url).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let token = self.token.token()?;
        self.http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(Request)?
            .json()
            .await
            .context(Decode)
    }
}

fn parse_endpoint(configured: Option<&str>, default: &str) -> Result<Url> {
    let raw = configured.unwrap_or(default);
    // A base without a trailing slash would swallow its last segment on
    // join.
    let normalized = if raw.ends_with('/') {
        raw.to_owned()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).context(ParseEndpoint {
        endpoint: raw.to_owned(),
    })
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path).context(BuildRequestUrl {
        path: path.to_owned(),
    })
}

fn append_page_token(url: &mut Url, page_token: Option<&str>) {
    if let Some(token) = page_token {
        url.query_pairs_mut().append_pair("pageToken", token);
    }
}

fn append_aggregated_params(url: &mut Url, page_token: Option<&str>) {
    url.query_pairs_mut()
        .append_pair("maxResults", PAGE_SIZE)
        .append_pair("returnPartialSuccess", "true");
    append_page_token(url, page_token);
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectList {
    pub projects: Vec<Project>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub status: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachedDisk {
    pub boot: bool,
    pub source: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceScope {
    pub instances: Vec<Instance>,
    pub warning: Option<Warning>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceAggregatedList {
    pub items: BTreeMap<String, InstanceScope>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Disk {
    pub name: String,
    pub zone: String,
    pub region: String,
    #[serde(rename = "type")]
    pub disk_type: String,
    pub status: String,
    pub size_gb: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskScope {
    pub disks: Vec<Disk>,
    pub warning: Option<Warning>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiskAggregatedList {
    pub items: BTreeMap<String, DiskScope>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Network {
    pub name: String,
    pub description: String,
    pub mtu: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkList {
    pub items: Vec<Network>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subnetwork {
    pub name: String,
    pub network: String,
    pub region: String,
    pub ip_cidr_range: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubnetworkScope {
    pub subnetworks: Vec<Subnetwork>,
    pub warning: Option<Warning>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubnetworkAggregatedList {
    pub items: BTreeMap<String, SubnetworkScope>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Bucket {
    pub name: String,
    pub location: String,
    pub storage_class: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BucketList {
    pub items: Vec<Bucket>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterAuth {
    pub cluster_ca_certificate: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cluster {
    pub name: String,
    pub location: String,
    pub endpoint: String,
    pub status: String,
    pub master_auth: Option<MasterAuth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterList {
    pub clusters: Vec<Cluster>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregated_instances_decode_with_partial_success_warnings() {
        let raw = r#"{
            "items": {
                "zones/europe-west3-a": {
                    "instances": [
                        {
                            "id": "5678",
                            "name": "worker-0",
                            "zone": "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west3-a",
                            "status": "RUNNING",
                            "machineType": "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west3-a/machineTypes/n1-standard-4",
                            "disks": [{"boot": true, "source": "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west3-a/disks/worker-0"}]
                        }
                    ]
                },
                "zones/europe-west3-b": {
                    "warning": {"code": "UNREACHABLE", "message": "zone unreachable"}
                }
            },
            "nextPageToken": "tok-1"
        }"#;
        let list: InstanceAggregatedList = serde_json::from_str(raw).unwrap();
        assert_eq!(list.next_page_token.as_deref(), Some("tok-1"));
        let reachable = &list.items["zones/europe-west3-a"];
        assert_eq!(reachable.instances.len(), 1);
        assert_eq!(reachable.instances[0].id, "5678");
        assert!(reachable.instances[0].disks[0].boot);
        assert!(list.items["zones/europe-west3-b"].warning.is_some());
    }

    #[test]
    fn disk_size_arrives_as_string() {
        let raw = r#"{"name": "data-0", "zone": "", "type": ".../pd-ssd", "sizeGb": "200"}"#;
        let disk: Disk = serde_json::from_str(raw).unwrap();
        assert_eq!(disk.size_gb, "200");
        assert_eq!(disk.disk_type, ".../pd-ssd");
    }

    #[test]
    fn endpoints_are_normalized_with_trailing_slash() {
        let base = parse_endpoint(Some("http://localhost:8080/compute/v1"), "").unwrap();
        let url = join(&base, "projects/p/global/networks").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/compute/v1/projects/p/global/networks"
        );
    }
}
