//! GCE instance collector, fanned out per project. Uses the aggregated
//! list so a single unreachable zone degrades to a warning.
use std::sync::Arc;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::gcp::{self, api, clients, ProjectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::gcp::Instance;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "gcp:collect-instances";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "gcp_instances",
    help: "Number of collected GCE instances.",
    labels: &["project_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing project id"))]
    NoProjectId,

    #[snafu(display("no GCP client found for project {}", project_id))]
    ClientLookup { project_id: String },

    #[snafu(display("failed to list instances: {}", source))]
    ListInstances { source: api::Error },

    #[snafu(display("failed to upsert instances: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoProjectId | Error::ClientLookup { .. } => true,
            Error::ListInstances { source } => api::is_permanent(source),
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

    let mut instances = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = client
            .api
            .aggregated_instances(&payload.project_id, token.as_deref())
            .await
            .context(ListInstances)?;
        for (scope, scoped) in page.items {
            if let Some(warning) = scoped.warning {
                warn!(
                    project_id = %payload.project_id,
                    scope = %scope,
                    code = %warning.code,
                    "partial instance listing: {}", warning.message
                );
            }
            instances.extend(scoped.instances);
        }
        match page.next_page_token {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }

    let rows: Vec<Instance> = instances
        .iter()
        .map(|instance| map_instance(instance, &payload.project_id))
        .collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.project_id], count as f64);
    info!(project_id = %payload.project_id, count, "collected GCE instances");
    Ok(())
}

fn map_instance(instance: &api::Instance, project_id: &str) -> Instance {
    Instance {
        instance_id: instance.id.clone(),
        name: instance.name.clone(),
        project_id: project_id.to_owned(),
        zone: gcp::last_path_segment(&instance.zone).to_owned(),
        region: gcp::region_from_zone(&instance.zone),
        status: instance.status.clone(),
        machine_type: gcp::last_path_segment(&instance.machine_type).to_owned(),
        source_machine_image: boot_disk_image(instance),
    }
}

/// Follows the first boot-disk reference; an instance without a boot
/// disk keeps the attribute empty.
fn boot_disk_image(instance: &api::Instance) -> String {
    instance
        .disks
        .iter()
        .find(|disk| disk.boot)
        .map(|disk| gcp::last_path_segment(&disk.source).to_owned())
        .unwrap_or_default()
}

async fn persist(db: &PgPool, rows: &[Instance]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO gcp_instances (instance_id, name, project_id, zone, region, status, \
         machine_type, source_machine_image) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.instance_id)
            .push_bind(&row.name)
            .push_bind(&row.project_id)
            .push_bind(&row.zone)
            .push_bind(&row.region)
            .push_bind(&row.status)
            .push_bind(&row.machine_type)
            .push_bind(&row.source_machine_image);
    });
    query.push(
        " ON CONFLICT (instance_id, project_id) DO UPDATE SET \
         name = EXCLUDED.name, \
         zone = EXCLUDED.zone, \
         region = EXCLUDED.region, \
         status = EXCLUDED.status, \
         machine_type = EXCLUDED.machine_type, \
         source_machine_image = EXCLUDED.source_machine_image, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_derives_zone_region_and_boot_image() {
        let instance = api::Instance {
            id: "5678".to_owned(),
            name: "worker-0".to_owned(),
            zone: "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west3-a"
                .to_owned(),
            status: "RUNNING".to_owned(),
            machine_type:
                "https://www.googleapis.com/compute/v1/projects/p/zones/europe-west3-a/machineTypes/n1-standard-4"
                    .to_owned(),
            disks: vec![
                api::AttachedDisk {
                    boot: false,
                    source: ".../disks/data-0".to_owned(),
                },
                api::AttachedDisk {
                    boot: true,
                    source: ".../disks/worker-0".to_owned(),
                },
            ],
        };
        let row = map_instance(&instance, "p");
        assert_eq!(row.zone, "europe-west3-a");
        assert_eq!(row.region, "europe-west3");
        assert_eq!(row.machine_type, "n1-standard-4");
        assert_eq!(row.source_machine_image, "worker-0");
    }

    #[test]
    fn instance_without_boot_disk_has_empty_image() {
        let instance = api::Instance::default();
        assert_eq!(boot_disk_image(&instance), "");
    }
}
