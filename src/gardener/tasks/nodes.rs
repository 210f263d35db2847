//! Node collector: fans out per seed and lists nodes through the
//! managed-seed client broker.
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node as KubeNode;
use kube::api::{Api, ListParams};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::gardener::{self, broker};
use crate::metrics::{self, Descriptor};
use crate::models::gardener::Node;
use crate::queue::{ActiveTask, Context, Task, TaskError};

pub const TASK_KIND: &str = "g:collect-nodes";

const PAGE_SIZE: u32 = 100;

const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
const REGION_LABEL: &str = "topology.kubernetes.io/region";
const ZONE_LABEL: &str = "topology.kubernetes.io/zone";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "g_nodes",
    help: "Number of collected seed nodes.",
    labels: &["seed"],
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPayload {
    #[serde(default)]
    pub seed: String,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing seed name"))]
    NoSeedName,

    #[snafu(display("no seed broker: {}", source))]
    Broker { source: gardener::Error },

    #[snafu(display("failed to obtain seed client: {}", source))]
    SeedClient { source: broker::Error },

    #[snafu(display("failed to list nodes: {}", source))]
    ListNodes { source: kube::Error },

    #[snafu(display("failed to upsert nodes: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoSeedName | Error::Broker { .. } => true,
            Error::SeedClient { source } => matches!(source, broker::Error::SeedExcluded { .. }),
            Error::ListNodes { .. } | Error::Upsert { .. } => false,
        };
        if permanent {
            TaskError::skip_retry(err)
        } else {
            TaskError::failed(err)
        }
    }
}

pub(crate) async fn handle(ctx: Arc<Context>, task: ActiveTask) -> Result<(), TaskError> {
    match task.decode::<SeedPayload>().map_err(TaskError::skip_retry)? {
        None => fan_out(&ctx, &task).await,
        Some(payload) => collect(&ctx, &payload).await.map_err(Into::into),
    }
}

/// One child per collected seed. Failures per seed are logged and the
/// loop continues.
async fn fan_out(ctx: &Context, task: &ActiveTask) -> Result<(), TaskError> {
    let seeds = sqlx::query_scalar::<_, String>("SELECT name FROM g_seeds")
        .fetch_all(&ctx.db)
        .await
        .map_err(TaskError::failed)?;
    for seed in seeds {
        let payload = SeedPayload { seed: seed.clone() };
        let child = match Task::with_payload(TASK_KIND, &payload) {
            Ok(child) => child,
            Err(err) => {
                warn!(seed = %seed, "failed to encode child payload: {}", err);
                continue;
            }
        };
        if let Err(err) = ctx.broker.enqueue(&child, Some(&task.queue)).await {
            warn!(seed = %seed, "failed to enqueue child task: {}", err);
        }
    }
    Ok(())
}

async fn collect(ctx: &Context, payload: &SeedPayload) -> Result<(), Error> {
    ensure!(!payload.seed.is_empty(), NoSeedName);
    let seed_broker = gardener::seed_broker().context(Broker)?;
    let client = seed_broker
        .client_for_seed(&payload.seed)
        .await
        .context(SeedClient)?;

    let api: Api<KubeNode> = Api::all(client);
    let mut nodes = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut params = ListParams::default().limit(PAGE_SIZE);
        if let Some(token) = &token {
            params = params.continue_token(token);
        }
        let list = api.list(&params).await.context(ListNodes)?;
        nodes.extend(list.items);
        match list.metadata.continue_ {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }

    let rows: Vec<Node> = nodes
        .iter()
        .map(|node| map_node(node, &payload.seed))
        .collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.seed], count as f64);
    info!(seed = %payload.seed, count, "collected seed nodes");
    Ok(())
}

fn map_node(node: &KubeNode, seed: &str) -> Node {
    let label = |key: &str| {
        node.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .cloned()
            .unwrap_or_default()
    };
    Node {
        name: node.metadata.name.clone().unwrap_or_default(),
        seed_name: seed.to_owned(),
        provider_id: node
            .spec
            .as_ref()
            .and_then(|spec| spec.provider_id.clone())
            .unwrap_or_default(),
        instance_type: label(INSTANCE_TYPE_LABEL),
        region: label(REGION_LABEL),
        zone: label(ZONE_LABEL),
        kubelet_version: node
            .status
            .as_ref()
            .and_then(|status| status.node_info.as_ref())
            .map(|node_info| node_info.kubelet_version.clone())
            .unwrap_or_default(),
    }
}

async fn persist(db: &PgPool, rows: &[Node]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO g_nodes (name, seed_name, provider_id, instance_type, region, zone, \
         kubelet_version) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.seed_name)
            .push_bind(&row.provider_id)
            .push_bind(&row.instance_type)
            .push_bind(&row.region)
            .push_bind(&row.zone)
            .push_bind(&row.kubelet_version);
    });
    query.push(
        " ON CONFLICT (name, seed_name) DO UPDATE SET \
         provider_id = EXCLUDED.provider_id, \
         instance_type = EXCLUDED.instance_type, \
         region = EXCLUDED.region, \
         zone = EXCLUDED.zone, \
         kubelet_version = EXCLUDED.kubelet_version, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeSpec, NodeStatus, NodeSystemInfo};

    use super::*;

    #[test]
    fn mapping_reads_labels_spec_and_node_info() {
        let node = KubeNode {
            metadata: kube::api::ObjectMeta {
                name: Some("node-0".to_owned()),
                labels: Some(
                    [
                        (INSTANCE_TYPE_LABEL.to_owned(), "n1-standard-4".to_owned()),
                        (REGION_LABEL.to_owned(), "europe-west3".to_owned()),
                        (ZONE_LABEL.to_owned(), "europe-west3-a".to_owned()),
                    ]
                    .into_iter()
                    .collect(),
                ),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: Some("gce://p/europe-west3-a/node-0".to_owned()),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                node_info: Some(NodeSystemInfo {
                    kubelet_version: "v1.29.4".to_owned(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        };
        let row = map_node(&node, "seed-eu1");
        assert_eq!(row.name, "node-0");
        assert_eq!(row.seed_name, "seed-eu1");
        assert_eq!(row.provider_id, "gce://p/europe-west3-a/node-0");
        assert_eq!(row.instance_type, "n1-standard-4");
        assert_eq!(row.zone, "europe-west3-a");
        assert_eq!(row.kubelet_version, "v1.29.4");
    }

    #[test]
    fn bare_node_maps_to_zero_values() {
        let node = KubeNode::default();
        let row = map_node(&node, "seed-eu1");
        assert_eq!(row.name, "");
        assert_eq!(row.provider_id, "");
        assert_eq!(row.kubelet_version, "");
    }
}
