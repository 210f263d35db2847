//! Availability-zone collector, fanned out per `(account, region)`.
use std::sync::Arc;

use aws_sdk_ec2::config::Region as SdkRegion;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::describe_availability_zones::DescribeAvailabilityZonesError;
use aws_sdk_ec2::types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::aws::{self, clients, CollectPayload};
use crate::metrics::{self, Descriptor};
use crate::models::aws::AvailabilityZone;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::string_value;

pub const TASK_KIND: &str = "aws:collect-azs";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_azs",
    help: "Number of collected AWS availability zones.",
    labels: &["account_id", "region"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no EC2 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe availability zones: {}", source))]
    DescribeAzs {
        source: SdkError<DescribeAvailabilityZonesError>,
    },

    #[snafu(display("failed to upsert availability zones: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeAzs { source } => aws::is_permanent(source),
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
        None => fan_out(&ctx, &task).await,
        Some(payload) if payload.region.is_empty() => fan_out(&ctx, &task).await,
        Some(payload) => collect(&ctx, &payload).await.map_err(Into::into),
    }
}

async fn fan_out(ctx: &Context, task: &ActiveTask) -> Result<(), TaskError> {
    let payloads = aws::account_region_payloads(&ctx.db, &clients::EC2).await;
    aws::enqueue_children(ctx, task, TASK_KIND, &payloads).await;
    Ok(())
}

async fn collect(ctx: &Context, payload: &CollectPayload) -> Result<(), Error> {
    ensure!(!payload.account_id.is_empty(), NoAccountId);
    let client = clients::EC2.get(&payload.account_id).context(ClientLookup {
        account_id: payload.account_id.clone(),
    })?;

    let out = client
        .inner
        .describe_availability_zones()
        .customize()
        .config_override(
            aws_sdk_ec2::config::Config::builder()
                .region(SdkRegion::new(payload.region.clone())),
        )
        .send()
        .await
        .context(DescribeAzs)?;
    let rows: Vec<AvailabilityZone> = out
        .availability_zones()
        .iter()
        .map(|zone| map_zone(zone, &payload.account_id))
        .collect();

    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(
        TASK_KIND,
        &[&payload.account_id, &payload.region],
        count as f64,
    );
    info!(
        account_id = %payload.account_id,
        region = %payload.region,
        count,
        "collected AWS availability zones"
    );
    Ok(())
}

fn map_zone(zone: &types::AvailabilityZone, account_id: &str) -> AvailabilityZone {
    AvailabilityZone {
        zone_name: string_value(zone.zone_name()),
        zone_id: string_value(zone.zone_id()),
        opt_in_status: string_value(zone.opt_in_status().map(types::AvailabilityZoneOptInStatus::as_str)),
        state: string_value(zone.state().map(types::AvailabilityZoneState::as_str)),
        group_name: string_value(zone.group_name()),
        network_border_group: string_value(zone.network_border_group()),
        region_name: string_value(zone.region_name()),
        account_id: account_id.to_owned(),
    }
}

async fn persist(db: &PgPool, rows: &[AvailabilityZone]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_azs (zone_name, zone_id, opt_in_status, state, group_name, \
         network_border_group, region_name, account_id) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.zone_name)
            .push_bind(&row.zone_id)
            .push_bind(&row.opt_in_status)
            .push_bind(&row.state)
            .push_bind(&row.group_name)
            .push_bind(&row.network_border_group)
            .push_bind(&row.region_name)
            .push_bind(&row.account_id);
    });
    query.push(
        " ON CONFLICT (zone_id, account_id) DO UPDATE SET \
         zone_name = EXCLUDED.zone_name, \
         opt_in_status = EXCLUDED.opt_in_status, \
         state = EXCLUDED.state, \
         group_name = EXCLUDED.group_name, \
         network_border_group = EXCLUDED.network_border_group, \
         region_name = EXCLUDED.region_name, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_resolves_enums_and_strings() {
        let zone = types::AvailabilityZone::builder()
            .zone_name("eu-central-1a")
            .zone_id("euc1-az2")
            .opt_in_status(types::AvailabilityZoneOptInStatus::OptInNotRequired)
            .state(types::AvailabilityZoneState::Available)
            .region_name("eu-central-1")
            .network_border_group("eu-central-1")
            .build();
        let row = map_zone(&zone, "A");
        assert_eq!(row.zone_name, "eu-central-1a");
        assert_eq!(row.zone_id, "euc1-az2");
        assert_eq!(row.opt_in_status, "opt-in-not-required");
        assert_eq!(row.state, "available");
        assert_eq!(row.region_name, "eu-central-1");
        assert_eq!(row.account_id, "A");
        assert_eq!(row.group_name, "");
    }
}
