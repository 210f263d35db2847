//! Shoot collector: lists shoots across all project namespaces.
use std::sync::Arc;

use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use snafu::{ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use super::seeds;
use crate::gardener::{self, bool_at, str_at};
use crate::metrics::{self, Descriptor};
use crate::models::gardener::Shoot;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "g:collect-shoots";

const PROJECT_NAMESPACE_PREFIX: &str = "garden-";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "g_shoots",
    help: "Number of collected Gardener shoots.",
    labels: &["garden"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no garden client: {}", source))]
    Garden { source: gardener::Error },

    #[snafu(display("failed to list shoots: {}", source))]
    ListShoots { source: kube::Error },

    #[snafu(display("failed to upsert shoots: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Garden { .. } => TaskError::skip_retry(err),
            Error::ListShoots { .. } | Error::Upsert { .. } => TaskError::failed(err),
        }
    }
}

pub(crate) async fn handle(ctx: Arc<Context>, _task: ActiveTask) -> Result<(), TaskError> {
    collect(&ctx).await.map_err(Into::into)
}

async fn collect(ctx: &Context) -> Result<(), Error> {
    let client = gardener::garden().context(Garden)?;
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
        "core.gardener.cloud",
        "v1beta1",
        "Shoot",
    ));
    let api: Api<DynamicObject> = Api::all_with(client, &resource);

    let objects = seeds::list_all(&api).await.context(ListShoots)?;
    let rows: Vec<Shoot> = objects.iter().map(map_shoot).collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &["virtual-garden"], count as f64);
    info!(count, "collected Gardener shoots");
    Ok(())
}

/// The project owning a shoot is its namespace minus the `garden-`
/// prefix.
fn project_name(namespace: &str) -> &str {
    namespace
        .strip_prefix(PROJECT_NAMESPACE_PREFIX)
        .unwrap_or(namespace)
}

fn map_shoot(object: &DynamicObject) -> Shoot {
    let namespace = object.metadata.namespace.clone().unwrap_or_default();
    Shoot {
        name: object.metadata.name.clone().unwrap_or_default(),
        project_name: project_name(&namespace).to_owned(),
        namespace,
        technical_id: str_at(&object.data, "/status/technicalID"),
        cloud_profile: str_at(&object.data, "/spec/cloudProfileName"),
        purpose: str_at(&object.data, "/spec/purpose"),
        seed_name: str_at(&object.data, "/spec/seedName"),
        status: str_at(&object.data, "/status/lastOperation/state"),
        is_hibernated: bool_at(&object.data, "/status/hibernated"),
    }
}

async fn persist(db: &PgPool, rows: &[Shoot]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO g_shoots (name, namespace, technical_id, project_name, cloud_profile, \
         purpose, seed_name, status, is_hibernated) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.namespace)
            .push_bind(&row.technical_id)
            .push_bind(&row.project_name)
            .push_bind(&row.cloud_profile)
            .push_bind(&row.purpose)
            .push_bind(&row.seed_name)
            .push_bind(&row.status)
            .push_bind(row.is_hibernated);
    });
    query.push(
        " ON CONFLICT (name, namespace) DO UPDATE SET \
         technical_id = EXCLUDED.technical_id, \
         project_name = EXCLUDED.project_name, \
         cloud_profile = EXCLUDED.cloud_profile, \
         purpose = EXCLUDED.purpose, \
         seed_name = EXCLUDED.seed_name, \
         status = EXCLUDED.status, \
         is_hibernated = EXCLUDED.is_hibernated, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_strips_the_garden_prefix() {
        assert_eq!(project_name("garden-dev"), "dev");
        assert_eq!(project_name("garden"), "garden");
        assert_eq!(project_name("other"), "other");
    }

    #[test]
    fn mapping_reads_spec_and_status() {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "core.gardener.cloud",
            "v1beta1",
            "Shoot",
        ));
        let mut object = DynamicObject::new("my-shoot", &resource);
        object.metadata.namespace = Some("garden-dev".to_owned());
        object.data = serde_json::json!({
            "spec": {
                "cloudProfileName": "gcp",
                "purpose": "production",
                "seedName": "seed-eu1",
            },
            "status": {
                "technicalID": "shoot--dev--my-shoot",
                "hibernated": false,
                "lastOperation": {"state": "Succeeded"},
            },
        });
        let row = map_shoot(&object);
        assert_eq!(row.name, "my-shoot");
        assert_eq!(row.namespace, "garden-dev");
        assert_eq!(row.project_name, "dev");
        assert_eq!(row.technical_id, "shoot--dev--my-shoot");
        assert_eq!(row.seed_name, "seed-eu1");
        assert_eq!(row.status, "Succeeded");
        assert!(!row.is_hibernated);
    }
}
