//! Process configuration, loaded once from a YAML file.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to read config: {}", source))]
    ReadConfig { source: std::io::Error },

    #[snafu(display("Failed to parse config: {}", source))]
    ParseConfig { source: serde_yaml::Error },

    #[snafu(display("failed to parse duration {:?}: {}", value, source))]
    ParseDuration {
        value: String,
        source: humantime::DurationError,
    },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub housekeeper: HousekeeperConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub gcp: GcpConfig,
    #[serde(default)]
    pub vault: Option<VaultConfig>,
    #[serde(default)]
    pub gardener: Option<GardenerConfig>,
}

impl Config {
    /// Reads the file named by `INVENTORY_CONFIG`, defaulting to
    /// `config.yaml` in the working directory.
    pub fn load() -> Result<Self> {
        let path = std::env::var("INVENTORY_CONFIG").unwrap_or_else(|_| "config.yaml".to_owned());
        let raw = std::fs::read(path).context(ReadConfig)?;
        serde_yaml::from_slice(&raw).context(ParseConfig)
    }
}

/// Parses a humantime duration string such as `30m` or `2h45m`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| ParseDuration {
        value: value.to_owned(),
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub dsn: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Default queue onto which tasks without an explicit queue land.
    pub name: String,
    /// Queues this worker drains, in priority order.
    pub queues: Vec<String>,
    pub concurrency: usize,
    /// Per-task deadline, humantime format.
    pub default_timeout: String,
    pub max_attempts: i32,
    /// How long an idle worker sleeps before polling again.
    pub poll_interval: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "inventory".to_owned(),
            queues: vec!["inventory".to_owned()],
            concurrency: 10,
            default_timeout: "30m".to_owned(),
            max_attempts: 10,
            poll_interval: "5s".to_owned(),
        }
    }
}

impl QueueConfig {
    pub fn default_timeout(&self) -> Result<Duration> {
        parse_duration(&self.default_timeout)
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Cron expression per task kind, overriding the registered default.
    pub schedules: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HousekeeperConfig {
    /// Retention per model name, humantime format. Models without an entry
    /// are not swept.
    pub retention: BTreeMap<String, String>,
}

impl HousekeeperConfig {
    #[must_use]
    pub fn ttl_for(&self, model_name: &str) -> Option<Result<Duration>> {
        self.retention.get(model_name).map(|v| parse_duration(v))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:6080".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AwsConfig {
    /// Region the SDK clients are constructed in. Region-scoped calls
    /// override it per request.
    pub default_region: Option<String>,
    pub accounts: Vec<AwsAccountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsAccountConfig {
    /// Display name for logs; identity comes from STS.
    pub name: String,
    /// Shared-config profile carrying the named credentials. Absent means
    /// the ambient credential chain.
    #[serde(default)]
    pub profile: Option<String>,
    /// Web-identity credentials minted through a cluster service
    /// account. Takes precedence over `profile`.
    #[serde(default)]
    pub web_identity: Option<AwsWebIdentityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsWebIdentityConfig {
    /// Role assumed with the minted token.
    pub role_arn: String,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// Kubeconfig of the cluster minting the token; absent means the
    /// ambient kubeconfig.
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    pub namespace: String,
    pub service_account: String,
    pub audiences: Vec<String>,
    #[serde(default = "default_web_identity_duration_secs")]
    pub duration_secs: i64,
}

fn default_session_name() -> String {
    "inventory".to_owned()
}

fn default_web_identity_duration_secs() -> i64 {
    3600
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GcpConfig {
    /// Static bearer token. Mostly for tests.
    pub token: Option<String>,
    /// File refreshed out-of-band with a short-lived access token.
    pub token_file: Option<PathBuf>,
    /// Restrict collection to these projects; empty means every project
    /// the credentials can list.
    pub projects: Vec<String>,
    /// Base URL overrides, used by tests.
    pub compute_endpoint: Option<String>,
    pub storage_endpoint: Option<String>,
    pub resourcemanager_endpoint: Option<String>,
    pub container_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    pub address: String,
    /// Pre-issued token; looked up on start.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub auth: Option<VaultAuthConfig>,
    #[serde(default)]
    pub tls: VaultTlsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultAuthConfig {
    /// Mount path of the JWT auth method, e.g. `jwt`.
    pub mount: String,
    pub role: String,
    #[serde(default)]
    pub jwt_file: Option<PathBuf>,
    /// Environment variable carrying the JWT when no file is given.
    #[serde(default)]
    pub jwt_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultTlsConfig {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub insecure: bool,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GardenerConfig {
    /// Kubeconfig for the virtual garden cluster.
    pub kubeconfig: PathBuf,
    /// Seeds for which no client is ever brokered.
    #[serde(default)]
    pub excluded_seeds: Vec<String>,
    #[serde(default)]
    pub soil: Option<SoilConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoilConfig {
    /// Seed name resolved via the GKE cluster instead of a
    /// viewerkubeconfig.
    pub seed_name: String,
    /// GKE cluster name looked up in the inventory itself.
    pub cluster_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: Config = serde_yaml::from_str(
            r"
            database:
              dsn: postgres://inventory@localhost/inventory
            ",
        )
        .unwrap();
        assert_eq!(cfg.queue.name, "inventory");
        assert_eq!(cfg.queue.concurrency, 10);
        assert_eq!(cfg.queue.max_attempts, 10);
        assert_eq!(
            cfg.queue.default_timeout().unwrap(),
            Duration::from_secs(30 * 60)
        );
        assert!(cfg.aws.accounts.is_empty());
        assert!(cfg.vault.is_none());
        assert!(cfg.gardener.is_none());
    }

    #[test]
    fn retention_is_model_indexed() {
        let cfg: Config = serde_yaml::from_str(
            r"
            database:
              dsn: postgres://inventory@localhost/inventory
            housekeeper:
              retention:
                aws:vpc: 24h
                gcp:instance: 2h30m
            ",
        )
        .unwrap();
        assert_eq!(
            cfg.housekeeper.ttl_for("aws:vpc").unwrap().unwrap(),
            Duration::from_secs(24 * 3600)
        );
        assert_eq!(
            cfg.housekeeper.ttl_for("gcp:instance").unwrap().unwrap(),
            Duration::from_secs(2 * 3600 + 30 * 60)
        );
        assert!(cfg.housekeeper.ttl_for("aws:region").is_none());
    }

    #[test]
    fn bad_duration_is_an_error() {
        let cfg = HousekeeperConfig {
            retention: [("aws:vpc".to_owned(), "not-a-duration".to_owned())]
                .into_iter()
                .collect(),
        };
        assert!(cfg.ttl_for("aws:vpc").unwrap().is_err());
    }

    #[test]
    fn full_config_round_trips() {
        let cfg: Config = serde_yaml::from_str(
            r"
            database:
              dsn: postgres://inventory@localhost/inventory
              max_connections: 4
            queue:
              name: collectors
              queues: [collectors, links]
              concurrency: 20
              default_timeout: 10m
              max_attempts: 5
              poll_interval: 1s
            scheduler:
              schedules:
                aws:collect-all: '0 0 */1 * * *'
            aws:
              default_region: eu-central-1
              accounts:
                - name: dev
                  profile: dev-readonly
                - name: live
                  web_identity:
                    role_arn: arn:aws:iam::123456789012:role/inventory-readonly
                    namespace: inventory
                    service_account: aws-collector
                    audiences: [sts.amazonaws.com]
            gcp:
              token_file: /var/run/gcp/token
              projects: [my-project]
            vault:
              address: https://vault.local:8200
              auth:
                mount: jwt
                role: inventory
                jwt_env: VAULT_JWT
              tls:
                insecure: true
            gardener:
              kubeconfig: /etc/inventory/garden.kubeconfig
              excluded_seeds: [soil-x]
              soil:
                seed_name: soil-gcp-eu1
                cluster_name: regional-soil
            ",
        )
        .unwrap();
        assert_eq!(cfg.queue.queues, vec!["collectors", "links"]);
        assert_eq!(cfg.aws.accounts.len(), 2);
        assert_eq!(cfg.aws.accounts[1].profile, None);
        let web_identity = cfg.aws.accounts[1].web_identity.as_ref().unwrap();
        assert_eq!(web_identity.session_name, "inventory");
        assert_eq!(web_identity.duration_secs, 3600);
        assert_eq!(web_identity.audiences, vec!["sts.amazonaws.com"]);
        assert_eq!(web_identity.kubeconfig, None);
        let gardener = cfg.gardener.unwrap();
        assert_eq!(gardener.excluded_seeds, vec!["soil-x"]);
        assert_eq!(gardener.soil.unwrap().cluster_name, "regional-soil");
    }
}
