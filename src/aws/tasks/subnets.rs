//! Subnet collector, fanned out per `(account, region)`.
use std::sync::Arc;

use aws_sdk_ec2::config::Region as SdkRegion;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::describe_subnets::DescribeSubnetsError;
use aws_sdk_ec2::types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::aws::{self, clients, CollectPayload, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::Subnet;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::{string_value, value_or_default};

pub const TASK_KIND: &str = "aws:collect-subnets";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_subnets",
    help: "Number of collected AWS subnets.",
    labels: &["account_id", "region"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no EC2 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe subnets: {}", source))]
    DescribeSubnets {
        source: SdkError<DescribeSubnetsError>,
    },

    #[snafu(display("failed to upsert subnets: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeSubnets { source } => aws::is_permanent(source),
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

    let subnets = fetch(&client.inner, &payload.region).await?;
    let rows: Vec<Subnet> = subnets
        .iter()
        .map(|subnet| map_subnet(subnet, &payload.account_id, &payload.region))
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
        "collected AWS subnets"
    );
    Ok(())
}

async fn fetch(client: &aws_sdk_ec2::Client, region: &str) -> Result<Vec<types::Subnet>, Error> {
    let mut items = Vec::new();
    let mut next: Option<String> = None;
    loop {
        let out = client
            .describe_subnets()
            .max_results(PAGE_SIZE)
            .set_next_token(next.clone())
            .customize()
            .config_override(
                aws_sdk_ec2::config::Config::builder().region(SdkRegion::new(region.to_owned())),
            )
            .send()
            .await
            .context(DescribeSubnets)?;
        items.extend(out.subnets().iter().cloned());
        let token = out.next_token().map(ToOwned::to_owned);
        match token {
            None => break,
            Some(token) if next.as_ref() == Some(&token) => break,
            token => next = token,
        }
    }
    Ok(items)
}

fn map_subnet(subnet: &types::Subnet, account_id: &str, region: &str) -> Subnet {
    Subnet {
        subnet_id: string_value(subnet.subnet_id()),
        subnet_arn: string_value(subnet.subnet_arn()),
        account_id: account_id.to_owned(),
        vpc_id: string_value(subnet.vpc_id()),
        state: string_value(subnet.state().map(types::SubnetState::as_str)),
        az: string_value(subnet.availability_zone()),
        az_id: string_value(subnet.availability_zone_id()),
        available_ipv4_addresses: value_or_default(subnet.available_ip_address_count()),
        ipv4_cidr: string_value(subnet.cidr_block()),
        region_name: region.to_owned(),
    }
}

async fn persist(db: &PgPool, rows: &[Subnet]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_subnets (subnet_id, subnet_arn, account_id, vpc_id, state, az, az_id, \
         available_ipv4_addresses, ipv4_cidr, region_name) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.subnet_id)
            .push_bind(&row.subnet_arn)
            .push_bind(&row.account_id)
            .push_bind(&row.vpc_id)
            .push_bind(&row.state)
            .push_bind(&row.az)
            .push_bind(&row.az_id)
            .push_bind(row.available_ipv4_addresses)
            .push_bind(&row.ipv4_cidr)
            .push_bind(&row.region_name);
    });
    query.push(
        " ON CONFLICT (subnet_id, account_id) DO UPDATE SET \
         subnet_arn = EXCLUDED.subnet_arn, \
         vpc_id = EXCLUDED.vpc_id, \
         state = EXCLUDED.state, \
         az = EXCLUDED.az, \
         az_id = EXCLUDED.az_id, \
         available_ipv4_addresses = EXCLUDED.available_ipv4_addresses, \
         ipv4_cidr = EXCLUDED.ipv4_cidr, \
         region_name = EXCLUDED.region_name, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_fills_row_from_sdk_shape() {
        let subnet = types::Subnet::builder()
            .subnet_id("subnet-1")
            .subnet_arn("arn:aws:ec2:eu-central-1:123456789012:subnet/subnet-1")
            .vpc_id("vpc-1")
            .state(types::SubnetState::Available)
            .availability_zone("eu-central-1a")
            .availability_zone_id("euc1-az2")
            .available_ip_address_count(200)
            .cidr_block("10.0.1.0/24")
            .build();
        let row = map_subnet(&subnet, "123456789012", "eu-central-1");
        assert_eq!(row.subnet_id, "subnet-1");
        assert_eq!(row.vpc_id, "vpc-1");
        assert_eq!(row.state, "available");
        assert_eq!(row.az, "eu-central-1a");
        assert_eq!(row.available_ipv4_addresses, 200);
        assert_eq!(row.region_name, "eu-central-1");
    }

    #[test]
    fn mapping_defaults_counters_to_zero() {
        let subnet = types::Subnet::builder().subnet_id("subnet-1").build();
        let row = map_subnet(&subnet, "A", "eu-central-1");
        assert_eq!(row.available_ipv4_addresses, 0);
    }
}
