//! GCS bucket collector, fanned out per project.
use std::sync::Arc;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::gcp::{self, api, clients, ProjectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::gcp::Bucket;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "gcp:collect-buckets";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "gcp_buckets",
    help: "Number of collected GCS buckets.",
    labels: &["project_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing project id"))]
    NoProjectId,

    #[snafu(display("no GCP client found for project {}", project_id))]
    ClientLookup { project_id: String },

    #[snafu(display("failed to list buckets: {}", source))]
    ListBuckets { source: api::Error },

    #[snafu(display("failed to upsert buckets: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoProjectId | Error::ClientLookup { .. } => true,
            Error::ListBuckets { source } => api::is_permanent(source),
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

    let mut buckets = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = client
            .api
            .list_buckets(&payload.project_id, token.as_deref())
            .await
            .context(ListBuckets)?;
        buckets.extend(page.items);
        match page.next_page_token {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }

    let rows: Vec<Bucket> = buckets
        .iter()
        .map(|bucket| map_bucket(bucket, &payload.project_id))
        .collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.project_id], count as f64);
    info!(project_id = %payload.project_id, count, "collected GCS buckets");
    Ok(())
}

fn map_bucket(bucket: &api::Bucket, project_id: &str) -> Bucket {
    Bucket {
        name: bucket.name.clone(),
        project_id: project_id.to_owned(),
        location: bucket.location.clone(),
        storage_class: bucket.storage_class.clone(),
    }
}

async fn persist(db: &PgPool, rows: &[Bucket]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO gcp_buckets (name, project_id, location, storage_class) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.project_id)
            .push_bind(&row.location)
            .push_bind(&row.storage_class);
    });
    query.push(
        " ON CONFLICT (name, project_id) DO UPDATE SET \
         location = EXCLUDED.location, \
         storage_class = EXCLUDED.storage_class, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_copies_bucket_attributes() {
        let bucket = api::Bucket {
            name: "inventory-artifacts".to_owned(),
            location: "EU".to_owned(),
            storage_class: "STANDARD".to_owned(),
        };
        let row = map_bucket(&bucket, "p");
        assert_eq!(row.name, "inventory-artifacts");
        assert_eq!(row.location, "EU");
        assert_eq!(row.storage_class, "STANDARD");
        assert_eq!(row.project_id, "p");
    }
}
