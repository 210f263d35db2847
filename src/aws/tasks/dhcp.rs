//! DHCP option set collector, fanned out per `(account, region)`.
use std::sync::Arc;

use aws_sdk_ec2::config::Region as SdkRegion;
use aws_sdk_ec2::error::SdkError;
use aws_sdk_ec2::operation::describe_dhcp_options::DescribeDhcpOptionsError;
use aws_sdk_ec2::types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::aws::{self, clients, CollectPayload, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::DhcpOptions;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::string_value;

pub const TASK_KIND: &str = "aws:collect-dhcp-options";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_dhcp_options",
    help: "Number of collected AWS DHCP option sets.",
    labels: &["account_id", "region"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no EC2 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to describe DHCP options: {}", source))]
    DescribeDhcpOptions {
        source: SdkError<DescribeDhcpOptionsError>,
    },

    #[snafu(display("failed to upsert DHCP options: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::DescribeDhcpOptions { source } => aws::is_permanent(source),
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

    let sets = fetch(&client.inner, &payload.region).await?;
    let rows: Vec<DhcpOptions> = sets
        .iter()
        .filter_map(|set| map_options(set, &payload.account_id, &payload.region))
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
        "collected AWS DHCP option sets"
    );
    Ok(())
}

async fn fetch(
    client: &aws_sdk_ec2::Client,
    region: &str,
) -> Result<Vec<types::DhcpOptions>, Error> {
    let mut items = Vec::new();
    let mut next: Option<String> = None;
    loop {
        let out = client
            .describe_dhcp_options()
            .max_results(PAGE_SIZE)
            .set_next_token(next.clone())
            .customize()
            .config_override(
                aws_sdk_ec2::config::Config::builder().region(SdkRegion::new(region.to_owned())),
            )
            .send()
            .await
            .context(DescribeDhcpOptions)?;
        items.extend(out.dhcp_options().iter().cloned());
        let token = out.next_token().map(ToOwned::to_owned);
        match token {
            None => break,
            Some(token) if next.as_ref() == Some(&token) => break,
            token => next = token,
        }
    }
    Ok(items)
}

/// A set without an id cannot be keyed; it is logged and dropped, the
/// rest of the page survives.
fn map_options(set: &types::DhcpOptions, account_id: &str, region: &str) -> Option<DhcpOptions> {
    let set_id = string_value(set.dhcp_options_id());
    if set_id.is_empty() {
        warn!(account_id, region, "DHCP option set without id, skipping");
        return None;
    }
    Some(DhcpOptions {
        set_id,
        account_id: account_id.to_owned(),
        region_name: region.to_owned(),
        domain_name: configuration_value(set, "domain-name"),
    })
}

fn configuration_value(set: &types::DhcpOptions, key: &str) -> String {
    set.dhcp_configurations()
        .iter()
        .find(|configuration| configuration.key() == Some(key))
        .and_then(|configuration| configuration.values().first())
        .and_then(types::AttributeValue::value)
        .unwrap_or_default()
        .to_owned()
}

async fn persist(db: &PgPool, rows: &[DhcpOptions]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_dhcp_options (set_id, account_id, region_name, domain_name) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.set_id)
            .push_bind(&row.account_id)
            .push_bind(&row.region_name)
            .push_bind(&row.domain_name);
    });
    query.push(
        " ON CONFLICT (set_id, account_id) DO UPDATE SET \
         region_name = EXCLUDED.region_name, \
         domain_name = EXCLUDED.domain_name, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_extracts_domain_name() {
        let set = types::DhcpOptions::builder()
            .dhcp_options_id("dopt-1")
            .dhcp_configurations(
                types::DhcpConfiguration::builder()
                    .key("domain-name")
                    .values(types::AttributeValue::builder().value("internal.example").build())
                    .build(),
            )
            .build();
        let row = map_options(&set, "A", "eu-central-1").unwrap();
        assert_eq!(row.set_id, "dopt-1");
        assert_eq!(row.domain_name, "internal.example");
    }

    #[test]
    fn missing_set_id_drops_the_item() {
        let set = types::DhcpOptions::builder().build();
        assert!(map_options(&set, "A", "eu-central-1").is_none());
    }
}
