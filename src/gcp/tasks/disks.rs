//! GCE disk collector, fanned out per project.
use std::sync::Arc;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::gcp::{self, api, clients, ProjectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::gcp::Disk;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "gcp:collect-disks";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "gcp_disks",
    help: "Number of collected GCE disks.",
    labels: &["project_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing project id"))]
    NoProjectId,

    #[snafu(display("no GCP client found for project {}", project_id))]
    ClientLookup { project_id: String },

    #[snafu(display("failed to list disks: {}", source))]
    ListDisks { source: api::Error },

    #[snafu(display("failed to upsert disks: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoProjectId | Error::ClientLookup { .. } => true,
            Error::ListDisks { source } => api::is_permanent(source),
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

    let mut disks = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = client
            .api
            .aggregated_disks(&payload.project_id, token.as_deref())
            .await
            .context(ListDisks)?;
        for (scope, scoped) in page.items {
            if let Some(warning) = scoped.warning {
                warn!(
                    project_id = %payload.project_id,
                    scope = %scope,
                    code = %warning.code,
                    "partial disk listing: {}", warning.message
                );
            }
            disks.extend(scoped.disks);
        }
        match page.next_page_token {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }

    let rows: Vec<Disk> = disks
        .iter()
        .map(|disk| map_disk(disk, &payload.project_id))
        .collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.project_id], count as f64);
    info!(project_id = %payload.project_id, count, "collected GCE disks");
    Ok(())
}

/// A disk without a zone is regional: its region is taken directly,
/// otherwise the region is derived from the zone.
fn map_disk(disk: &api::Disk, project_id: &str) -> Disk {
    let is_regional = disk.zone.is_empty();
    let region = if is_regional {
        gcp::last_path_segment(&disk.region).to_owned()
    } else {
        gcp::region_from_zone(&disk.zone)
    };
    Disk {
        name: disk.name.clone(),
        project_id: project_id.to_owned(),
        zone: gcp::last_path_segment(&disk.zone).to_owned(),
        region,
        disk_type: gcp::last_path_segment(&disk.disk_type).to_owned(),
        status: disk.status.clone(),
        size_gb: disk.size_gb.parse().unwrap_or_default(),
        is_regional,
    }
}

async fn persist(db: &PgPool, rows: &[Disk]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO gcp_disks (name, project_id, zone, region, disk_type, status, size_gb, \
         is_regional) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.project_id)
            .push_bind(&row.zone)
            .push_bind(&row.region)
            .push_bind(&row.disk_type)
            .push_bind(&row.status)
            .push_bind(row.size_gb)
            .push_bind(row.is_regional);
    });
    query.push(
        " ON CONFLICT (name, project_id, region, zone) DO UPDATE SET \
         disk_type = EXCLUDED.disk_type, \
         status = EXCLUDED.status, \
         size_gb = EXCLUDED.size_gb, \
         is_regional = EXCLUDED.is_regional, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zonal_disk_derives_region_from_zone() {
        let disk = api::Disk {
            name: "worker-0".to_owned(),
            zone: ".../zones/europe-west3-a".to_owned(),
            region: String::new(),
            disk_type: ".../diskTypes/pd-ssd".to_owned(),
            status: "READY".to_owned(),
            size_gb: "200".to_owned(),
        };
        let row = map_disk(&disk, "p");
        assert!(!row.is_regional);
        assert_eq!(row.zone, "europe-west3-a");
        assert_eq!(row.region, "europe-west3");
        assert_eq!(row.disk_type, "pd-ssd");
        assert_eq!(row.size_gb, 200);
    }

    #[test]
    fn disk_without_zone_is_regional() {
        let disk = api::Disk {
            name: "shared-0".to_owned(),
            zone: String::new(),
            region: ".../regions/europe-west3".to_owned(),
            disk_type: ".../diskTypes/pd-balanced".to_owned(),
            status: "READY".to_owned(),
            size_gb: "not-a-number".to_owned(),
        };
        let row = map_disk(&disk, "p");
        assert!(row.is_regional);
        assert_eq!(row.zone, "");
        assert_eq!(row.region, "europe-west3");
        assert_eq!(row.size_gb, 0);
    }
}
