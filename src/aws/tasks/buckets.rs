//! S3 bucket collector, fanned out per account. Buckets are a global
//! listing; the region comes from a per-bucket location lookup.
use std::sync::Arc;

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::list_buckets::ListBucketsError;
use aws_sdk_s3::types;
use chrono::{DateTime, Utc};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::aws::{self, clients, CollectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::aws::Bucket;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::string_value;

pub const TASK_KIND: &str = "aws:collect-buckets";

/// S3 reports an empty location constraint for buckets in us-east-1.
const DEFAULT_BUCKET_REGION: &str = "us-east-1";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_buckets",
    help: "Number of collected AWS S3 buckets.",
    labels: &["account_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no S3 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to list buckets: {}", source))]
    ListBuckets { source: SdkError<ListBucketsError> },

    #[snafu(display("failed to upsert buckets: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::ListBuckets { source } => aws::is_permanent(source),
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
    match task.decode::<CollectPayload>().map_err(TaskError::skip_retry)? {
        None => {
            let payloads = aws::account_payloads(&clients::S3);
            aws::enqueue_children(&ctx, &task, TASK_KIND, &payloads).await;
            Ok(())
        }
        Some(payload) => collect(&ctx, &payload).await.map_err(Into::into),
    }
}

async fn collect(ctx: &Context, payload: &CollectPayload) -> Result<(), Error> {
    ensure!(!payload.account_id.is_empty(), NoAccountId);
    let client = clients::S3.get(&payload.account_id).context(ClientLookup {
        account_id: payload.account_id.clone(),
    })?;

    let out = client
        .inner
        .list_buckets()
        .send()
        .await
        .context(ListBuckets)?;
    let mut rows = Vec::new();
    for bucket in out.buckets() {
        let name = string_value(bucket.name());
        if name.is_empty() {
            continue;
        }
        // A single bucket with an unreadable location does not break the
        // rest of the listing.
        let region = match client.inner.get_bucket_location().bucket(&name).send().await {
            Ok(location) => bucket_region(
                location
                    .location_constraint()
                    .map(types::BucketLocationConstraint::as_str),
            ),
            Err(err) => {
                warn!(bucket = %name, "failed to get bucket location: {}", err);
                continue;
            }
        };
        rows.push(map_bucket(bucket, &name, &region, &payload.account_id));
    }

    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.account_id], count as f64);
    info!(account_id = %payload.account_id, count, "collected AWS buckets");
    Ok(())
}

/// Translates a location constraint into a region name; the empty
/// constraint is the us-east-1 protocol quirk.
fn bucket_region(constraint: Option<&str>) -> String {
    match constraint {
        None | Some("") => DEFAULT_BUCKET_REGION.to_owned(),
        Some(region) => region.to_owned(),
    }
}

fn map_bucket(bucket: &types::Bucket, name: &str, region: &str, account_id: &str) -> Bucket {
    Bucket {
        name: name.to_owned(),
        account_id: account_id.to_owned(),
        region_name: region.to_owned(),
        creation_date: bucket
            .creation_date()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
    }
}

async fn persist(db: &PgPool, rows: &[Bucket]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_buckets (name, account_id, region_name, creation_date) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.account_id)
            .push_bind(&row.region_name)
            .push_bind(row.creation_date);
    });
    query.push(
        " ON CONFLICT (name, account_id) DO UPDATE SET \
         region_name = EXCLUDED.region_name, \
         creation_date = EXCLUDED.creation_date, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_location_constraint_is_us_east_1() {
        assert_eq!(bucket_region(None), "us-east-1");
        assert_eq!(bucket_region(Some("")), "us-east-1");
        assert_eq!(bucket_region(Some("eu-west-1")), "eu-west-1");
    }

    #[test]
    fn mapping_carries_creation_date() {
        let bucket = types::Bucket::builder()
            .name("inventory-artifacts")
            .creation_date(aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000))
            .build();
        let row = map_bucket(&bucket, "inventory-artifacts", "eu-west-1", "A");
        assert_eq!(row.name, "inventory-artifacts");
        assert_eq!(row.region_name, "eu-west-1");
        assert_eq!(
            row.creation_date.unwrap().timestamp(),
            1_700_000_000
        );
    }
}
