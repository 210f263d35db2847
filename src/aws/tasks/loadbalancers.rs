//! Load-balancer collector, fanned out per `(account, region)`.
//!
//! Merges the classic (v1) listing with the v2 listing into one table.
//! Classic load balancers carry no ARN and no state; they get the fixed
//! type `classic` and the `N/A` state sentinel.
use std::sync::Arc;

use aws_sdk_elasticloadbalancing::operation::describe_load_balancers::DescribeLoadBalancersError as DescribeClassicError;
use aws_sdk_elasticloadbalancing::types as v1types;
use aws_sdk_elasticloadbalancingv2::config::Region as SdkRegion;
use aws_sdk_elasticloadbalancingv2::error::SdkError;
use aws_sdk_elasticloadbalancingv2::operation::describe_load_balancers::DescribeLoadBalancersError;
use aws_sdk_elasticloadbalancingv2::types as v2types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::aws::{self, clients, CollectPayload, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::LoadBalancer;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::string_value;

pub const TASK_KIND: &str = "aws:collect-loadbalancers";

const CLASSIC_TYPE: &str = "classic";
const CLASSIC_STATE: &str = "N/A";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_loadbalancers",
    help: "Number of collected AWS load balancers.",
    labels: &["account_id", "region"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no ELB client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe classic load balancers: {}", source))]
    DescribeClassic {
        source: SdkError<DescribeClassicError>,
    },

    #[snafu(display("failed to describe load balancers: {}", source))]
    DescribeV2 {
        source: SdkError<DescribeLoadBalancersError>,
    },

    #[snafu(display("failed to upsert load balancers: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeClassic { source } => aws::is_permanent(source),
            Error::DescribeV2 { source } => aws::is_permanent(source),
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
    let payloads = aws::account_region_payloads(&ctx.db, &clients::ELBV2).await;
    aws::enqueue_children(ctx, task, TASK_KIND, &payloads).await;
    Ok(())
}

async fn collect(ctx: &Context, payload: &CollectPayload) -> Result<(), Error> {
    ensure!(!payload.account_id.is_empty(), NoAccountId);
    let classic = clients::ELB.get(&payload.account_id).context(ClientLookup {
        account_id: payload.account_id.clone(),
    })?;
    let v2 = clients::ELBV2
        .get(&payload.account_id)
        .context(ClientLookup {
            account_id: payload.account_id.clone(),
        })?;

    let mut rows = Vec::new();
    for lb in fetch_classic(&classic.inner, &payload.region).await? {
        rows.push(map_classic(&lb, &payload.account_id, &payload.region));
    }
    for lb in fetch_v2(&v2.inner, &payload.region).await? {
        rows.push(map_v2(&lb, &payload.account_id, &payload.region));
    }

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
        "collected AWS load balancers"
    );
    Ok(())
}

async fn fetch_classic(
    client: &aws_sdk_elasticloadbalancing::Client,
    region: &str,
) -> Result<Vec<v1types::LoadBalancerDescription>, Error> {
    let mut items = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let out = client
            .describe_load_balancers()
            .page_size(PAGE_SIZE)
            .set_marker(marker.clone())
            .customize()
            .config_override(
                aws_sdk_elasticloadbalancing::config::Config::builder()
                    .region(aws_sdk_elasticloadbalancing::config::Region::new(
                        region.to_owned(),
                    )),
            )
            .send()
            .await
            .context(DescribeClassic)?;
        items.extend(out.load_balancer_descriptions().iter().cloned());
        let token = out.next_marker().map(ToOwned::to_owned);
        match token {
            None => break,
            Some(token) if marker.as_ref() == Some(&token) => break,
            token => marker = token,
        }
    }
    Ok(items)
}

async fn fetch_v2(
    client: &aws_sdk_elasticloadbalancingv2::Client,
    region: &str,
) -> Result<Vec<v2types::LoadBalancer>, Error> {
    let mut items = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let out = client
            .describe_load_balancers()
            .page_size(PAGE_SIZE)
            .set_marker(marker.clone())
            .customize()
            .config_override(
                aws_sdk_elasticloadbalancingv2::config::Config::builder()
                    .region(SdkRegion::new(region.to_owned())),
            )
            .send()
            .await
            .context(DescribeV2)?;
        items.extend(out.load_balancers().iter().cloned());
        let token = out.next_marker().map(ToOwned::to_owned);
        match token {
            None => break,
            Some(token) if marker.as_ref() == Some(&token) => break,
            token => marker = token,
        }
    }
    Ok(items)
}

fn map_classic(
    lb: &v1types::LoadBalancerDescription,
    account_id: &str,
    region: &str,
) -> LoadBalancer {
    LoadBalancer {
        name: string_value(lb.load_balancer_name()),
        dns_name: string_value(lb.dns_name()),
        arn: String::new(),
        state: CLASSIC_STATE.to_owned(),
        lb_type: CLASSIC_TYPE.to_owned(),
        scheme: string_value(lb.scheme()),
        vpc_id: string_value(lb.vpc_id()),
        account_id: account_id.to_owned(),
        region_name: region.to_owned(),
    }
}

fn map_v2(lb: &v2types::LoadBalancer, account_id: &str, region: &str) -> LoadBalancer {
    LoadBalancer {
        name: string_value(lb.load_balancer_name()),
        dns_name: string_value(lb.dns_name()),
        arn: string_value(lb.load_balancer_arn()),
        state: string_value(
            lb.state()
                .and_then(v2types::LoadBalancerState::code)
                .map(v2types::LoadBalancerStateEnum::as_str),
        ),
        lb_type: string_value(lb.r#type().map(v2types::LoadBalancerTypeEnum::as_str)),
        scheme: string_value(lb.scheme().map(v2types::LoadBalancerSchemeEnum::as_str)),
        vpc_id: string_value(lb.vpc_id()),
        account_id: account_id.to_owned(),
        region_name: region.to_owned(),
    }
}

async fn persist(db: &PgPool, rows: &[LoadBalancer]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_loadbalancers (name, dns_name, arn, state, lb_type, scheme, vpc_id, \
         account_id, region_name) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.name)
            .push_bind(&row.dns_name)
            .push_bind(&row.arn)
            .push_bind(&row.state)
            .push_bind(&row.lb_type)
            .push_bind(&row.scheme)
            .push_bind(&row.vpc_id)
            .push_bind(&row.account_id)
            .push_bind(&row.region_name);
    });
    query.push(
        " ON CONFLICT (dns_name, account_id) DO UPDATE SET \
         name = EXCLUDED.name, \
         arn = EXCLUDED.arn, \
         state = EXCLUDED.state, \
         lb_type = EXCLUDED.lb_type, \
         scheme = EXCLUDED.scheme, \
         vpc_id = EXCLUDED.vpc_id, \
         region_name = EXCLUDED.region_name, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_gets_sentinel_type_and_state() {
        let lb = v1types::LoadBalancerDescription::builder()
            .load_balancer_name("legacy")
            .dns_name("legacy-1234.eu-central-1.elb.amazonaws.com")
            .scheme("internet-facing")
            .vpc_id("vpc-1")
            .build();
        let row = map_classic(&lb, "A", "eu-central-1");
        assert_eq!(row.lb_type, "classic");
        assert_eq!(row.state, "N/A");
        assert_eq!(row.arn, "");
        assert_eq!(row.scheme, "internet-facing");
    }

    #[test]
    fn v2_carries_arn_and_real_state() {
        let lb = v2types::LoadBalancer::builder()
            .load_balancer_name("edge")
            .load_balancer_arn("arn:aws:elasticloadbalancing:eu-central-1:123:loadbalancer/app/edge/1")
            .dns_name("edge-1234.eu-central-1.elb.amazonaws.com")
            .state(
                v2types::LoadBalancerState::builder()
                    .code(v2types::LoadBalancerStateEnum::Active)
                    .build(),
            )
            .r#type(v2types::LoadBalancerTypeEnum::Application)
            .scheme(v2types::LoadBalancerSchemeEnum::InternetFacing)
            .vpc_id("vpc-1")
            .build();
        let row = map_v2(&lb, "A", "eu-central-1");
        assert_eq!(row.lb_type, "application");
        assert_eq!(row.state, "active");
        assert!(row.arn.starts_with("arn:aws:elasticloadbalancing"));
    }
}
