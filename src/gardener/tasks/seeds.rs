//! Seed collector: lists seeds from the virtual garden.
use std::sync::Arc;

use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use snafu::{ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::gardener::{self, str_at};
use crate::metrics::{self, Descriptor};
use crate::models::gardener::Seed;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "g:collect-seeds";

const PAGE_SIZE: u32 = 100;

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "g_seeds",
    help: "Number of collected Gardener seeds.",
    labels: &["garden"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no garden client: {}", source))]
    Garden { source: gardener::Error },

    #[snafu(display("failed to list seeds: {}", source))]
    ListSeeds { source: kube::Error },

    #[snafu(display("failed to upsert seeds: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        match &err {
            Error::Garden { .. } => TaskError::skip_retry(err),
            Error::ListSeeds { .. } | Error::Upsert { .. } => TaskError::failed(err),
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
        "Seed",
    ));
    let api: Api<DynamicObject> = Api::all_with(client, &resource);

    let objects = list_all(&api).await.context(ListSeeds)?;
    let rows: Vec<Seed> = objects.iter().map(map_seed).collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &["virtual-garden"], count as f64);
    info!(count, "collected Gardener seeds");
    Ok(())
}

/// Pages a full cluster-scoped listing with the standard limit and a
/// repeated-continue-token guard.
pub(crate) async fn list_all(api: &Api<DynamicObject>) -> Result<Vec<DynamicObject>, kube::Error> {
    let mut items = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut params = ListParams::default().limit(PAGE_SIZE);
        if let Some(token) = &token {
            params = params.continue_token(token);
        }
        let list = api.list(&params).await?;
        items.extend(list.items);
        match list.metadata.continue_ {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }
    Ok(items)
}

fn map_seed(object: &DynamicObject) -> Seed {
    Seed {
        name: object.metadata.name.clone().unwrap_or_default(),
        provider_type: str_at(&object.data, "/spec/provider/type"),
        region: str_at(&object.data, "/spec/provider/region"),
        kubernetes_version: str_at(&object.data, "/status/kubernetesVersion"),
    }
}

async fn persist(db: &PgPool, rows: &[Seed]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO g_seeds (name, provider_type, region, kubernetes_version) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.provider_type)
            .push_bind(&row.region)
            .push_bind(&row.kubernetes_version);
    });
    query.push(
        " ON CONFLICT (name) DO UPDATE SET \
         provider_type = EXCLUDED.provider_type, \
         region = EXCLUDED.region, \
         kubernetes_version = EXCLUDED.kubernetes_version, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_reads_spec_and_status() {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
            "core.gardener.cloud",
            "v1beta1",
            "Seed",
        ));
        let mut object = DynamicObject::new("seed-eu1", &resource);
        object.data = serde_json::json!({
            "spec": {"provider": {"type": "gcp", "region": "europe-west3"}},
            "status": {"kubernetesVersion": "1.29.4"},
        });
        let row = map_seed(&object);
        assert_eq!(row.name, "seed-eu1");
        assert_eq!(row.provider_type, "gcp");
        assert_eq!(row.region, "europe-west3");
        assert_eq!(row.kubernetes_version, "1.29.4");
    }
}
