//! VPC collector, fanned out per `(account, region)`.
use std::sync::Arc;

use aws_sdk_ec2::config::Region as SdkRegion;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::describe_vpcs::DescribeVpcsError;
use aws_sdk_ec2::types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::aws::{self, clients, CollectPayload, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::Vpc;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::{none_if_empty, string_value, value_or_default};

pub const TASK_KIND: &str = "aws:collect-vpcs";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_vpcs",
    help: "Number of collected AWS VPCs.",
    labels: &["account_id", "region"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no EC2 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe VPCs: {}", source))]
    DescribeVpcs { source: SdkError<DescribeVpcsError> },

    #[snafu(display("failed to upsert VPCs: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeVpcs { source } => aws::is_permanent(source),
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

    let vpcs = fetch(&client.inner, &payload.region).await?;
    let rows: Vec<Vpc> = vpcs
        .iter()
        .map(|vpc| map_vpc(vpc, &payload.account_id, &payload.region))
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
        "collected AWS VPCs"
    );
    Ok(())
}

async fn fetch(client: &aws_sdk_ec2::Client, region: &str) -> Result<Vec<types::Vpc>, Error> {
    let mut items = Vec::new();
    let mut next: Option<String> = None;
    loop {
        let out = client
            .describe_vpcs()
            .max_results(PAGE_SIZE)
            .set_next_token(next.clone())
            .customize()
            .config_override(
                aws_sdk_ec2::config::Config::builder().region(SdkRegion::new(region.to_owned())),
            )
            .send()
            .await
            .context(DescribeVpcs)?;
        items.extend(out.vpcs().iter().cloned());
        let token = out.next_token().map(ToOwned::to_owned);
        match token {
            None => break,
            // A repeated token would page forever.
            Some(token) if next.as_ref() == Some(&token) => break,
            token => next = token,
        }
    }
    Ok(items)
}

fn map_vpc(vpc: &types::Vpc, account_id: &str, region: &str) -> Vpc {
    let vpc_id = string_value(vpc.vpc_id());
    let dhcp_options_id = string_value(vpc.dhcp_options_id());
    if dhcp_options_id.is_empty() {
        warn!(vpc_id = %vpc_id, "VPC reports no DHCP option set id");
    }
    Vpc {
        vpc_id,
        account_id: account_id.to_owned(),
        state: string_value(vpc.state().map(types::VpcState::as_str)),
        ipv4_cidr: string_value(vpc.cidr_block()),
        is_default: value_or_default(vpc.is_default()),
        owner_id: string_value(vpc.owner_id()),
        region_name: region.to_owned(),
        dhcp_options_id,
    }
}

async fn persist(db: &PgPool, rows: &[Vpc]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_vpcs (vpc_id, account_id, state, ipv4_cidr, is_default, owner_id, \
         region_name, dhcp_options_id) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.vpc_id)
            .push_bind(&row.account_id)
            .push_bind(&row.state)
            .push_bind(&row.ipv4_cidr)
            .push_bind(row.is_default)
            .push_bind(&row.owner_id)
            .push_bind(&row.region_name)
            .push_bind(none_if_empty(&row.dhcp_options_id));
    });
    query.push(
        " ON CONFLICT (vpc_id, account_id) DO UPDATE SET \
         state = EXCLUDED.state, \
         ipv4_cidr = EXCLUDED.ipv4_cidr, \
         is_default = EXCLUDED.is_default, \
         owner_id = EXCLUDED.owner_id, \
         region_name = EXCLUDED.region_name, \
         dhcp_options_id = EXCLUDED.dhcp_options_id, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_fills_row_from_sdk_shape() {
        let vpc = types::Vpc::builder()
            .vpc_id("vpc-0a1b2c")
            .state(types::VpcState::Available)
            .cidr_block("10.0.0.0/16")
            .is_default(false)
            .owner_id("123456789012")
            .dhcp_options_id("dopt-1234")
            .build();
        let row = map_vpc(&vpc, "123456789012", "eu-central-1");
        assert_eq!(row.vpc_id, "vpc-0a1b2c");
        assert_eq!(row.state, "available");
        assert_eq!(row.ipv4_cidr, "10.0.0.0/16");
        assert!(!row.is_default);
        assert_eq!(row.region_name, "eu-central-1");
        assert_eq!(row.dhcp_options_id, "dopt-1234");
    }

    #[test]
    fn mapping_tolerates_missing_dhcp_options() {
        let vpc = types::Vpc::builder().vpc_id("vpc-1").build();
        let row = map_vpc(&vpc, "A", "eu-central-1");
        assert_eq!(row.dhcp_options_id, "");
        assert!(!row.is_default);
    }
}
