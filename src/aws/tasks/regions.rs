//! Region collector. Regions are collected first: every region-scoped
//! fan-out joins against this table.
use std::sync::Arc;

use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::describe_regions::DescribeRegionsError;
use aws_sdk_ec2::types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::aws::{self, clients, CollectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::aws::Region;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::string_value;

pub const TASK_KIND: &str = "aws:collect-regions";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_regions",
    help: "Number of collected AWS regions.",
    labels: &["account_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no EC2 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe regions: {}", source))]
    DescribeRegions {
        source: SdkError<DescribeRegionsError>,
    },

    #[snafu(display("failed to upsert regions: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeRegions { source } => aws::is_permanent(source),
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
            let payloads = aws::account_payloads(&clients::EC2);
            aws::enqueue_children(&ctx, &task, TASK_KIND, &payloads).await;
            Ok(())
        }
        Some(payload) => collect(&ctx, &payload).await.map_err(Into::into),
    }
}

async fn collect(ctx: &Context, payload: &CollectPayload) -> Result<(), Error> {
    ensure!(!payload.account_id.is_empty(), NoAccountId);
    let client = clients::EC2.get(&payload.account_id).context(ClientLookup {
        account_id: payload.account_id.clone(),
    })?;

    let out = client
        .inner
        .describe_regions()
        .all_regions(true)
        .send()
        .await
        .context(DescribeRegions)?;
    let rows: Vec<Region> = out
        .regions()
        .iter()
        .map(|region| map_region(region, &payload.account_id))
        .collect();

    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.account_id], count as f64);
    info!(account_id = %payload.account_id, count, "collected AWS regions");
    Ok(())
}

fn map_region(region: &types::Region, account_id: &str) -> Region {
    Region {
        name: string_value(region.region_name()),
        endpoint: string_value(region.endpoint()),
        opt_in_status: string_value(region.opt_in_status()),
        account_id: account_id.to_owned(),
    }
}

async fn persist(db: &PgPool, rows: &[Region]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query =
        QueryBuilder::<sqlx::Postgres>::new("INSERT INTO aws_regions (name, endpoint, opt_in_status, account_id) ");
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.endpoint)
            .push_bind(&row.opt_in_status)
            .push_bind(&row.account_id);
    });
    query.push(
        " ON CONFLICT (name, account_id) DO UPDATE SET \
         endpoint = EXCLUDED.endpoint, \
         opt_in_status = EXCLUDED.opt_in_status, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_unwraps_optional_fields() {
        let region = types::Region::builder()
            .region_name("eu-central-1")
            .endpoint("ec2.eu-central-1.amazonaws.com")
            .opt_in_status("opt-in-not-required")
            .build();
        let row = map_region(&region, "123456789012");
        assert_eq!(row.name, "eu-central-1");
        assert_eq!(row.endpoint, "ec2.eu-central-1.amazonaws.com");
        assert_eq!(row.opt_in_status, "opt-in-not-required");
        assert_eq!(row.account_id, "123456789012");
    }

    #[test]
    fn mapping_defaults_missing_fields_to_empty() {
        let region = types::Region::builder().build();
        let row = map_region(&region, "123456789012");
        assert_eq!(row.name, "");
        assert_eq!(row.endpoint, "");
        assert_eq!(row.opt_in_status, "");
    }
}
