//! AWS inventory: client sets, collectors, link functions.
//!
//! Every collector follows the same protocol: a task without a payload
//! fans out into per-account (or per account/region) children; a task
//! with a payload validates its identity fields, pages the service API,
//! maps items into rows, upserts on the natural key and emits a gauge
//! with the row count.
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;

use crate::queue::{ActiveTask, Context, Task};

pub mod clients;
pub mod links;
pub mod tasks;

/// Fixed page size for every paginated Describe/List call.
pub(crate) const PAGE_SIZE: i32 = 100;

pub fn register_tasks() {
    tasks::register();
    links::register();
}

pub fn register_metrics() {
    tasks::register_metrics();
}

/// Child-task payload. An all-empty payload never occurs: fan-out tasks
/// carry no payload at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectPayload {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub region: String,
}

/// SDK error codes that retrying will never fix.
const PERMANENT_ERROR_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AuthFailure",
    "UnauthorizedOperation",
    "InvalidParameterValue",
    "ValidationError",
    "OptInRequired",
];

/// Classifies a service error: throttling and transient faults stay
/// retryable, authorization and validation faults do not.
pub(crate) fn is_permanent<E>(err: &E) -> bool
where
    E: aws_sdk_ec2::error::ProvideErrorMetadata,
{
    err.code()
        .is_some_and(|code| PERMANENT_ERROR_CODES.contains(&code))
}

/// One child payload per registered account.
pub(crate) fn account_payloads<T: Clone>(clients: &clients::ClientSet<T>) -> Vec<CollectPayload> {
    clients
        .entries()
        .into_iter()
        .map(|(account_id, _)| CollectPayload {
            account_id,
            region: String::new(),
        })
        .collect()
}

/// One child payload per collected region of one account.
pub(crate) fn region_payloads(account_id: &str, regions: Vec<String>) -> Vec<CollectPayload> {
    regions
        .into_iter()
        .map(|region| CollectPayload {
            account_id: account_id.to_owned(),
            region,
        })
        .collect()
}

/// One child payload per `(account, region)` pair, joining each account
/// against its previously collected regions. An account whose region list
/// cannot be read is logged and skipped; the others still fan out.
pub(crate) async fn account_region_payloads<T: Clone>(
    db: &PgPool,
    clients: &clients::ClientSet<T>,
) -> Vec<CollectPayload> {
    let mut payloads = Vec::new();
    for (account_id, _) in clients.entries() {
        let regions =
            sqlx::query_scalar::<_, String>("SELECT name FROM aws_regions WHERE account_id = $1")
                .bind(&account_id)
                .fetch_all(db)
                .await;
        match regions {
            Ok(regions) => payloads.extend(region_payloads(&account_id, regions)),
            Err(err) => {
                warn!(account_id = %account_id, "failed to list regions for fan-out: {}", err);
            }
        }
    }
    payloads
}

/// Enqueues one child per payload onto the parent's queue. A failed
/// enqueue is logged and the loop continues; one broken account never
/// prevents the others. Returns the number actually enqueued.
pub(crate) async fn enqueue_children(
    ctx: &Context,
    parent: &ActiveTask,
    kind: &str,
    payloads: &[CollectPayload],
) -> usize {
    let mut enqueued = 0;
    for payload in payloads {
        let child = match Task::with_payload(kind, payload) {
            Ok(child) => child,
            Err(err) => {
                warn!(account_id = %payload.account_id, "failed to encode child payload: {}", err);
                continue;
            }
        };
        match ctx.broker.enqueue(&child, Some(&parent.queue)).await {
            Ok(_) => enqueued += 1,
            Err(err) => {
                warn!(
                    account_id = %payload.account_id,
                    region = %payload.region,
                    "failed to enqueue child task: {}", err
                );
            }
        }
    }
    enqueued
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn payload_serializes_with_wire_field_names() {
        let payload = CollectPayload {
            account_id: "A".to_owned(),
            region: "eu-central-1".to_owned(),
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({"account_id": "A", "region": "eu-central-1"})
        );
    }

    #[test]
    fn account_fan_out_covers_every_registered_account() {
        let set: clients::ClientSet<u8> = Registry::new();
        for account in ["111111111111", "222222222222", "333333333333"] {
            set.overwrite(
                account.to_owned(),
                clients::Client {
                    account_id: account.to_owned(),
                    arn: String::new(),
                    user_id: String::new(),
                    inner: 0,
                },
            );
        }
        let payloads = account_payloads(&set);
        assert_eq!(payloads.len(), 3);
        assert!(payloads.iter().all(|p| p.region.is_empty()));
    }

    #[test]
    fn region_fan_out_pairs_account_with_each_region() {
        let payloads = region_payloads(
            "A",
            vec!["eu-central-1".to_owned(), "us-east-1".to_owned()],
        );
        assert_eq!(
            payloads,
            vec![
                CollectPayload {
                    account_id: "A".to_owned(),
                    region: "eu-central-1".to_owned(),
                },
                CollectPayload {
                    account_id: "A".to_owned(),
                    region: "us-east-1".to_owned(),
                },
            ]
        );
    }
}
