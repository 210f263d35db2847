//! VPC network collector, fanned out per project. The fan-out
//! enumerates every registered project; a failing enqueue is logged and
//! skipped, it never short-circuits the remaining projects.
use std::sync::Arc;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::gcp::{self, api, clients, ProjectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::gcp::Network;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "gcp:collect-networks";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "gcp_networks",
    help: "Number of collected GCP VPC networks.",
    labels: &["project_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing project id"))]
    NoProjectId,

    #[snafu(display("no GCP client found for project {}", project_id))]
    ClientLookup { project_id: String },

    #[snafu(display("failed to list networks: {}", source))]
    ListNetworks { source: api::Error },

    #[snafu(display("failed to upsert networks: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoProjectId | Error::ClientLookup { .. } => true,
            Error::ListNetworks { source } => api::is_permanent(source),
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

    let mut networks = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = client
            .api
            .list_networks(&payload.project_id, token.as_deref())
            .await
            .context(ListNetworks)?;
        networks.extend(page.items);
        match page.next_page_token {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }

    let rows: Vec<Network> = networks
        .iter()
        .map(|network| map_network(network, &payload.project_id))
        .collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.project_id], count as f64);
    info!(project_id = %payload.project_id, count, "collected GCP networks");
    Ok(())
}

fn map_network(network: &api::Network, project_id: &str) -> Network {
    Network {
        name: network.name.clone(),
        project_id: project_id.to_owned(),
        description: network.description.clone(),
        mtu: network.mtu,
    }
}

async fn persist(db: &PgPool, rows: &[Network]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO gcp_networks (name, project_id, description, mtu) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.project_id)
            .push_bind(&row.description)
            .push_bind(row.mtu);
    });
    query.push(
        " ON CONFLICT (name, project_id) DO UPDATE SET \
         description = EXCLUDED.description, \
         mtu = EXCLUDED.mtu, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_copies_network_attributes() {
        let network = api::Network {
            name: "default".to_owned(),
            description: "Default network".to_owned(),
            mtu: 1460,
        };
        let row = map_network(&network, "p");
        assert_eq!(row.name, "default");
        assert_eq!(row.mtu, 1460);
    }
}
