//! Route53 record-set collector, fanned out per `(account, hosted zone)`.
use std::sync::Arc;

use aws_sdk_route53::error::SdkError;
use aws_sdk_route53::operation::list_resource_record_sets::ListResourceRecordSetsError;
use aws_sdk_route53::types;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::aws::{self, clients, PAGE_SIZE};
use crate::metrics::{self, Descriptor};
use crate::models::aws::ResourceRecordSet;
use crate::queue::{ActiveTask, Context, Task, TaskError};
use crate::utils::value_or_default;

pub const TASK_KIND: &str = "aws:collect-resource-record-sets";

/// The API octal-escapes a leading asterisk in wildcard names.
const ESCAPED_ASTERISK: &str = "\\052";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "aws_resource_record_sets",
    help: "Number of collected AWS Route53 resource record sets.",
    labels: &["account_id", "hosted_zone_id"],
};

/// Unlike region-scoped collectors this one fans out per hosted zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordsPayload {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub hosted_zone_id: String,
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("missing account id"))]
    NoAccountId,

    #[snafu(display("missing hosted zone id"))]
    NoHostedZoneId,

    #[snafu(display("no Route53 client found for account {}", account_id))]
    ClientLookup { account_id: String },

    #[snafu(display("failed to list resource record sets: {}", source))]
    ListRecordSets {
        source: SdkError<ListResourceRecordSetsError>,
    },

    #[snafu(display("failed to upsert resource record sets: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoAccountId | Error::NoHostedZoneId | Error::ClientLookup { .. } => true,
            Error::ListRecordSets { source } => aws::is_permanent(source),
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
    match task.decode::<RecordsPayload>().map_err(TaskError::skip_retry)? {
        None => fan_out(&ctx, &task).await,
        Some(payload) => collect(&ctx, &payload).await.map_err(Into::into),
    }
}

/// One child per previously collected hosted zone of each account. A
/// failing account is logged and skipped, the rest still fan out.
async fn fan_out(ctx: &Context, task: &ActiveTask) -> Result<(), TaskError> {
    for (account_id, _) in clients::ROUTE53.entries() {
        let zones = sqlx::query_scalar::<_, String>(
            "SELECT zone_id FROM aws_hosted_zones WHERE account_id = $1",
        )
        .bind(&account_id)
        .fetch_all(&ctx.db)
        .await;
        let zones = match zones {
            Ok(zones) => zones,
            Err(err) => {
                warn!(account_id = %account_id, "failed to list hosted zones for fan-out: {}", err);
                continue;
            }
        };
        for hosted_zone_id in zones {
            let payload = RecordsPayload {
                account_id: account_id.clone(),
                hosted_zone_id,
            };
            let child = match Task::with_payload(TASK_KIND, &payload) {
                Ok(child) => child,
                Err(err) => {
                    warn!(account_id = %account_id, "failed to encode child payload: {}", err);
                    continue;
                }
            };
            if let Err(err) = ctx.broker.enqueue(&child, Some(&task.queue)).await {
                warn!(
                    account_id = %account_id,
                    hosted_zone_id = %payload.hosted_zone_id,
                    "failed to enqueue child task: {}", err
                );
            }
        }
    }
    Ok(())
}

async fn collect(ctx: &Context, payload: &RecordsPayload) -> Result<(), Error> {
    ensure!(!payload.account_id.is_empty(), NoAccountId);
    ensure!(!payload.hosted_zone_id.is_empty(), NoHostedZoneId);
    let client = clients::ROUTE53
        .get(&payload.account_id)
        .context(ClientLookup {
            account_id: payload.account_id.clone(),
        })?;

    let record_sets = fetch(&client.inner, &payload.hosted_zone_id).await?;
    let mut rows = Vec::new();
    for record_set in &record_sets {
        rows.extend(map_record_set(
            record_set,
            &payload.hosted_zone_id,
            &payload.account_id,
        ));
    }

    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(
        TASK_KIND,
        &[&payload.account_id, &payload.hosted_zone_id],
        count as f64,
    );
    info!(
        account_id = %payload.account_id,
        hosted_zone_id = %payload.hosted_zone_id,
        count,
        "collected AWS resource record sets"
    );
    Ok(())
}

async fn fetch(
    client: &aws_sdk_route53::Client,
    hosted_zone_id: &str,
) -> Result<Vec<types::ResourceRecordSet>, Error> {
    let mut items = Vec::new();
    let mut start: Option<(String, types::RrType)> = None;
    loop {
        let mut request = client
            .list_resource_record_sets()
            .hosted_zone_id(hosted_zone_id)
            .max_items(PAGE_SIZE);
        if let Some((name, record_type)) = &start {
            request = request
                .start_record_name(name)
                .start_record_type(record_type.clone());
        }
        let out = request.send().await.context(ListRecordSets)?;
        items.extend(out.resource_record_sets().iter().cloned());
        if !out.is_truncated() {
            break;
        }
        let next = match (out.next_record_name(), out.next_record_type()) {
            (Some(name), Some(record_type)) => Some((name.to_owned(), record_type.clone())),
            _ => None,
        };
        match next {
            None => break,
            Some(next) if start.as_ref() == Some(&next) => break,
            next => start = next,
        }
    }
    Ok(items)
}

/// One row per record value, or exactly one alias row. A set that is
/// both an alias target and carries explicit records is ambiguous: it is
/// logged and treated as an alias, the records are discarded.
fn map_record_set(
    record_set: &types::ResourceRecordSet,
    hosted_zone_id: &str,
    account_id: &str,
) -> Vec<ResourceRecordSet> {
    let record_name = unescape_record_name(record_set.name());
    let record_type = record_set.r#type().as_str().to_owned();
    let ttl = value_or_default(record_set.ttl());
    let base = ResourceRecordSet {
        record_name,
        record_type,
        hosted_zone_id: hosted_zone_id.to_owned(),
        account_id: account_id.to_owned(),
        ttl,
        is_alias: false,
        value: String::new(),
    };

    if let Some(alias) = record_set.alias_target() {
        if !record_set.resource_records().is_empty() {
            warn!(
                record_name = %base.record_name,
                record_type = %base.record_type,
                "record set carries both an alias target and resource records, keeping the alias"
            );
        }
        return vec![ResourceRecordSet {
            is_alias: true,
            value: alias.dns_name().to_owned(),
            ..base
        }];
    }

    record_set
        .resource_records()
        .iter()
        .map(|record| ResourceRecordSet {
            value: record.value().to_owned(),
            ..base.clone()
        })
        .collect()
}

/// Restores the leading `*` the API escapes as `\052`.
fn unescape_record_name(name: &str) -> String {
    name.replace(ESCAPED_ASTERISK, "*")
}

async fn persist(db: &PgPool, rows: &[ResourceRecordSet]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query = QueryBuilder::<sqlx::Postgres>::new(
        "INSERT INTO aws_resource_record_sets (record_name, record_type, hosted_zone_id, \
         account_id, ttl, is_alias, value) ",
    );
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.record_name)
            .push_bind(&row.record_type)
            .push_bind(&row.hosted_zone_id)
            .push_bind(&row.account_id)
            .push_bind(row.ttl)
            .push_bind(row.is_alias)
            .push_bind(&row.value);
    });
    query.push(
        " ON CONFLICT (record_name, record_type, value, hosted_zone_id, account_id) DO UPDATE SET \
         ttl = EXCLUDED.ttl, \
         is_alias = EXCLUDED.is_alias, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_set() -> types::builders::ResourceRecordSetBuilder {
        types::ResourceRecordSet::builder()
            .name("www.example.com.")
            .r#type(types::RrType::A)
    }

    #[test]
    fn plain_records_produce_one_row_per_value() {
        let set = record_set()
            .ttl(300)
            .resource_records(types::ResourceRecord::builder().value("192.0.2.1").build().unwrap())
            .resource_records(types::ResourceRecord::builder().value("192.0.2.2").build().unwrap())
            .build()
            .unwrap();
        let rows = map_record_set(&set, "Z1", "A");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| !row.is_alias && row.ttl == 300));
        assert_eq!(rows[0].value, "192.0.2.1");
        assert_eq!(rows[1].value, "192.0.2.2");
    }

    #[test]
    fn ambiguous_alias_with_records_keeps_the_alias() {
        let set = record_set()
            .alias_target(
                types::AliasTarget::builder()
                    .hosted_zone_id("Z2")
                    .dns_name("edge-1234.eu-central-1.elb.amazonaws.com.")
                    .evaluate_target_health(false)
                    .build()
                    .unwrap(),
            )
            .resource_records(types::ResourceRecord::builder().value("192.0.2.1").build().unwrap())
            .build()
            .unwrap();
        let rows = map_record_set(&set, "Z1", "A");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_alias);
        assert_eq!(rows[0].value, "edge-1234.eu-central-1.elb.amazonaws.com.");
    }

    #[test]
    fn escaped_asterisk_is_restored() {
        assert_eq!(unescape_record_name("\\052.example.com."), "*.example.com.");
        assert_eq!(unescape_record_name("www.example.com."), "www.example.com.");
    }
}
