//! GKE cluster collector, fanned out per project. The endpoint and
//! cluster CA stored here are what the regional-soil client is built
//! from.
use std::sync::Arc;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::gcp::{self, api, clients, ProjectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::gcp::GkeCluster;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "gcp:collect-gke-clusters";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "gcp_gke_clusters",
    help: "Number of collected GKE clusters.",
    labels: &["project_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing project id"))]
    NoProjectId,

    #[snafu(display("no GCP client found for project {}", project_id))]
    ClientLookup { project_id: String },

    #[snafu(display("failed to list clusters: {}", source))]
    ListClusters { source: api::Error },

    #[snafu(display("failed to upsert clusters: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoProjectId | Error::ClientLookup { .. } => true,
            Error::ListClusters { source } => api::is_permanent(source),
            Error::Upsert { .. } => false,
        };
        if permanent {
            TaskError::skip_retry(err)
        } else {
            TaskError::failed(err)
        }
    }
}

pub(crate) async fn handle(ctx: Arc<Context>, task: ActiveTask) -> Result<(), TaskError> {
    match task.decode::<ProjectPayload>().map_err(TaskError::skip_retry)? {
        None => {
            let payloads = gcp::project_payloads();
            gcp::enqueue_children(&ctx, &task, TASK_KIND, &payloads).await;
            Ok(())
        }
        Some(payload) => collect(&ctx, &payload).await.map_err(Into::into),
    }
}

async fn collect(ctx: &Context, payload: &ProjectPayload) -> Result<(), Error> {
    ensure!(!payload.project_id.is_empty(), NoProjectId);
    let client = clients::PROJECTS
        .get(&payload.project_id)
        .context(ClientLookup {
            project_id: payload.project_id.clone(),
        })?;

    let list = client
        .api
        .list_clusters(&payload.project_id)
        .await
        .context(ListClusters)?;
    let rows: Vec<GkeCluster> = list
        .clusters
        .iter()
        .map(|cluster| map_cluster(cluster, &payload.project_id))
        .collect();

    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.project_id], count as f64);
    info!(project_id = %payload.project_id, count, "collected GKE clusters");
    Ok(())
}

fn map_cluster(cluster: &api::Cluster, project_id: &str) -> GkeCluster {
    GkeCluster {
        name: cluster.name.clone(),
        project_id: project_id.to_owned(),
        location: cluster.location.clone(),
        endpoint: cluster.endpoint.clone(),
        ca_certificate: cluster
            .master_auth
            .as_ref()
            .map(|auth| auth.cluster_ca_certificate.clone())
            .unwrap_or_default(),
        status: cluster.status.clone(),
    }
}

async fn persist(db: &PgPool, rows: &[GkeCluster]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO gcp_gke_clusters (name, project_id, location, endpoint, ca_certificate, \
         status) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.project_id)
            .push_bind(&row.location)
            .push_bind(&row.endpoint)
            .push_bind(&row.ca_certificate)
            .push_bind(&row.status);
    });
    query.push(
        " ON CONFLICT (name, project_id, location) DO UPDATE SET \
         endpoint = EXCLUDED.endpoint, \
         ca_certificate = EXCLUDED.ca_certificate, \
         status = EXCLUDED.status, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_reads_endpoint_and_ca() {
        let cluster = api::Cluster {
            name: "regional-soil".to_owned(),
            location: "europe-west3".to_owned(),
            endpoint: "34.89.1.2".to_owned(),
            status: "RUNNING".to_owned(),
            master_auth: Some(api::MasterAuth {
                cluster_ca_certificate: "Y2EtZGF0YQ==".to_owned(),
            }),
        };
        let row = map_cluster(&cluster, "p");
        assert_eq!(row.endpoint, "34.89.1.2");
        assert_eq!(row.ca_certificate, "Y2EtZGF0YQ==");
    }

    #[test]
    fn missing_master_auth_leaves_ca_empty() {
        let cluster = api::Cluster::default();
        assert_eq!(map_cluster(&cluster, "p").ca_certificate, "");
    }
}
