//! Route53 hosted-zone collector, fanned out per account.
use std::sync::Arc;

use aws_sdk_route53::error::SdkError;
use aws_sdk_route53::operation::list_hosted_zones::ListHostedZonesError;
use aws_sdk_route53::types;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::aws::{self, clients, CollectPayload, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::HostedZone;
use crate::queue::{ActiveTask, Context, TaskError};
use crate::utils::value_or_default;

pub const TASK_KIND: &str = "aws:collect-hosted-zones";

const ZONE_ID_PREFIX: &str = "/hostedzone/";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_hosted_zones",
    help: "Number of collected AWS Route53 hosted zones.",
    labels: &["account_id"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("no Route53 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to list hosted zones: {}", source))]
    ListHostedZones {
        source: SdkError<ListHostedZonesError>,
    },

    #[snafu(display("failed to upsert hosted zones: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::ClientLookup { .. } => true,
            Error::ListHostedZones { source } => aws::is_permanent(source),
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
            let payloads = aws::account_payloads(&clients::ROUTE53);
            aws::enqueue_children(&ctx, &task, TASK_KIND, &payloads).await;
            Ok(())
        }
        Some(payload) => collect(&ctx, &payload).await.map_err(Into::into),
    }
}

async fn collect(ctx: &Context, payload: &CollectPayload) -> Result<(), Error> {
    ensure!(!payload.account_id.is_empty(), NoAccountId);
    let client = clients::ROUTE53
        .get(&payload.account_id)
        .context(ClientLookup {
            account_id: payload.account_id.clone(),
        })?;

    let zones = fetch(&client.inner).await?;
    let rows: Vec<HostedZone> = zones
        .iter()
        .map(|zone| map_zone(zone, &payload.account_id))
        .collect();

    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &[&payload.account_id], count as f64);
    info!(account_id = %payload.account_id, count, "collected AWS hosted zones");
    Ok(())
}

async fn fetch(client: &aws_sdk_route53::Client) -> Result<Vec<types::HostedZone>, Error> {
    let mut items = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let out = client
            .list_hosted_zones()
            .max_items(PAGE_SIZE)
            .set_marker(marker.clone())
            .send()
            .await
            .context(ListHostedZones)?;
        items.extend(out.hosted_zones().iter().cloned());
        if !out.is_truncated() {
            break;
        }
        let token = out.next_marker().map(ToOwned::to_owned);
        match token {
            None => break,
            Some(token) if marker.as_ref() == Some(&token) => break,
            token => marker = token,
        }
    }
    Ok(items)
}

/// The API reports ids as `/hostedzone/Z...`; only the bare id is stored.
fn trim_zone_id(id: &str) -> &str {
    id.strip_prefix(ZONE_ID_PREFIX).unwrap_or(id)
}

fn map_zone(zone: &types::HostedZone, account_id: &str) -> HostedZone {
    HostedZone {
        zone_id: trim_zone_id(zone.id()).to_owned(),
        account_id: account_id.to_owned(),
        name: zone.name().to_owned(),
        is_private: zone
            .config()
            .and_then(|config| config.private_zone())
            .unwrap_or_default(),
        record_count: value_or_default(zone.resource_record_set_count()),
        caller_reference: zone.caller_reference().to_owned(),
    }
}

async fn persist(db: &PgPool, rows: &[HostedZone]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_hosted_zones (zone_id, account_id, name, is_private, record_count, \
         caller_reference) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.zone_id)
            .push_bind(&row.account_id)
            .push_bind(&row.name)
            .push_bind(row.is_private)
            .push_bind(row.record_count)
            .push_bind(&row.caller_reference);
    });
    query.push(
        " ON CONFLICT (zone_id, account_id) DO UPDATE SET \
         name = EXCLUDED.name, \
         is_private = EXCLUDED.is_private, \
         record_count = EXCLUDED.record_count, \
         caller_reference = EXCLUDED.caller_reference, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_id_prefix_is_trimmed() {
        assert_eq!(trim_zone_id("/hostedzone/Z0123456789"), "Z0123456789");
        assert_eq!(trim_zone_id("Z0123456789"), "Z0123456789");
    }

    #[test]
    fn mapping_fills_row_from_sdk_shape() {
        let zone = types::HostedZone::builder()
            .id("/hostedzone/Z0123456789")
            .name("example.com.")
            .caller_reference("ref-1")
            .config(types::HostedZoneConfig::builder().private_zone(false).build())
            .resource_record_set_count(12)
            .build()
            .unwrap();
        let row = map_zone(&zone, "A");
        assert_eq!(row.zone_id, "Z0123456789");
        assert_eq!(row.name, "example.com.");
        assert!(!row.is_private);
        assert_eq!(row.record_count, 12);
    }
}
