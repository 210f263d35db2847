//! Subnetwork collector, fanned out per project.
use std::sync::Arc;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::gcp::{self, api, clients, ProjectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::gcp::Subnet;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "gcp:collect-subnets";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "gcp_subnets",
    help: "Number of collected GCP subnetworks.",
    labels: &["project_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing project id"))]
    NoProjectId,

    #[snafu(display("no GCP client found for project {}", project_id))]
    ClientLookup { project_id: String },

    #[snafu(display("failed to list subnetworks: {}", source))]
    ListSubnetworks { source: api::Error },

    #[snafu(display("failed to upsert subnetworks: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoProjectId | Error::ClientLookup { .. } => true,
            Error::ListSubnetworks { source } => api::is_permanent(source),
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

    let mut subnetworks = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = client
            .api
            .aggregated_subnetworks(&payload.project_id, token.as_deref())
            .await
            .context(ListSubnetworks)?;
        for (scope, scoped) in page.items {
            if let Some(warning) = scoped.warning {
                warn!(
                    project_id = %payload.project_id,
                    scope = %scope,
                    code = %warning.code,
                    "partial subnetwork listing: {}", warning.message
                );
            }
            subnetworks.extend(scoped.subnetworks);
        }
        match page.next_page_token {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }

    let rows: Vec<Subnet> = subnetworks
        .iter()
        .map(|subnetwork| map_subnetwork(subnetwork, &payload.project_id))
        .collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.project_id], count as f64);
    info!(project_id = %payload.project_id, count, "collected GCP subnetworks");
    Ok(())
}

fn map_subnetwork(subnetwork: &api::Subnetwork, project_id: &str) -> Subnet {
    Subnet {
        name: subnetwork.name.clone(),
        project_id: project_id.to_owned(),
        network_name: gcp::last_path_segment(&subnetwork.network).to_owned(),
        region: gcp::last_path_segment(&subnetwork.region).to_owned(),
        ipv4_cidr: subnetwork.ip_cidr_range.clone(),
        purpose: subnetwork.purpose.clone(),
    }
}

async fn persist(db: &PgPool, rows: &[Subnet]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO gcp_subnets (name, project_id, network_name, region, ipv4_cidr, purpose) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.project_id)
            .push_bind(&row.network_name)
            .push_bind(&row.region)
            .push_bind(&row.ipv4_cidr)
            .push_bind(&row.purpose);
    });
    query.push(
        " ON CONFLICT (name, project_id, region) DO UPDATE SET \
         network_name = EXCLUDED.network_name, \
         ipv4_cidr = EXCLUDED.ipv4_cidr, \
         purpose = EXCLUDED.purpose, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_extracts_network_and_region_names() {
        let subnetwork = api::Subnetwork {
            name: "nodes".to_owned(),
            network: ".../global/networks/default".to_owned(),
            region: ".../regions/europe-west3".to_owned(),
            ip_cidr_range: "10.10.0.0/20".to_owned(),
            purpose: "PRIVATE".to_owned(),
        };
        let row = map_subnetwork(&subnetwork, "p");
        assert_eq!(row.network_name, "default");
        assert_eq!(row.region, "europe-west3");
        assert_eq!(row.ipv4_cidr, "10.10.0.0/20");
    }
}
