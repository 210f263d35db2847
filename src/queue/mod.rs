//! Task queue runtime.
//!
//! Tasks are typed messages `(kind, payload)` on durable named queues.
//! The broker accepts enqueues, workers claim and execute them under a
//! per-task deadline, failures retry with exponential backoff unless the
//! handler signalled [`TaskError::SkipRetry`], and the scheduler turns the
//! scheduled-task registry into periodic enqueues.
//!
//! State machine per task:
//! `pending → active → (completed | pending(retry) | dead | skipped)`.
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use sqlx::PgPool;

use crate::config::Config;
use crate::registry::Registry;

mod broker;
pub mod scheduler;
pub mod worker;

pub use broker::{Broker, TaskInfo};
pub use worker::Worker;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to encode task payload: {}", source))]
    EncodePayload { source: serde_json::Error },

    #[snafu(display("failed to decode task payload: {}", source))]
    DecodePayload { source: serde_json::Error },

    #[snafu(display("queue database error: {}", source))]
    Database { source: sqlx::Error },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A typed message. The payload is conventionally JSON; an absent payload
/// is what turns a collector task into a fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub kind: String,
    pub payload: Option<serde_json::Value>,
}

impl Task {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
        }
    }

    pub fn with_payload<T: Serialize>(kind: impl Into<String>, payload: &T) -> Result<Self> {
        let value = serde_json::to_value(payload).context(EncodePayload)?;
        Ok(Self {
            kind: kind.into(),
            payload: Some(value),
        })
    }
}

/// A claimed task as handed to a handler.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActiveTask {
    pub id: String,
    pub kind: String,
    pub queue: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub timeout_secs: i64,
    pub payload: Option<serde_json::Value>,
}

impl ActiveTask {
    /// Decodes the payload, `None` when the task carries none.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match &self.payload {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .context(DecodePayload),
        }
    }
}

/// Terminal handler outcome. `SkipRetry` tells the broker the task must
/// not be retried regardless of the backoff policy: validation errors and
/// client-not-found conditions take this path.
#[derive(Debug)]
pub enum TaskError {
    SkipRetry(BoxError),
    Failed(BoxError),
}

impl TaskError {
    pub fn skip_retry<E: Into<BoxError>>(err: E) -> Self {
        Self::SkipRetry(err.into())
    }

    pub fn failed<E: Into<BoxError>>(err: E) -> Self {
        Self::Failed(err.into())
    }

    #[must_use]
    pub fn is_skip_retry(&self) -> bool {
        matches!(self, Self::SkipRetry(_))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SkipRetry(err) => write!(f, "skip retry: {err}"),
            Self::Failed(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SkipRetry(err) | Self::Failed(err) => {
                Some(&**err as &(dyn std::error::Error + 'static))
            }
        }
    }
}

/// Shared state handed to every handler alongside the claimed task.
pub struct Context {
    pub db: PgPool,
    pub broker: Broker,
    pub config: Arc<Config>,
}

impl Context {
    #[must_use]
    pub fn new(db: PgPool, broker: Broker, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self { db, broker, config })
    }
}

pub type HandlerFuture = BoxFuture<'static, std::result::Result<(), TaskError>>;
pub type Handler = Arc<dyn Fn(Arc<Context>, ActiveTask) -> HandlerFuture + Send + Sync>;

/// Boxes an async fn into a registrable [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Context>, ActiveTask) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
{
    Arc::new(move |ctx, task| Box::pin(f(ctx, task)))
}

pub static HANDLERS: Lazy<Registry<&'static str, Handler>> = Lazy::new(Registry::new);

/// A `(cron expression, task template)` pair. The registry only carries
/// the pairs; the broker's scheduler owns the timer.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub spec: String,
    pub task: Task,
}

pub static SCHEDULED: Lazy<Registry<&'static str, ScheduledTask>> = Lazy::new(Registry::new);

/// Registers a payload-less task to run on the default cron expression.
/// Configuration overrides the expression per kind at scheduler start.
pub fn register_scheduled(kind: &'static str, default_spec: &str) {
    SCHEDULED.must_register(
        kind,
        ScheduledTask {
            spec: default_spec.to_owned(),
            task: Task::new(kind),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        account_id: String,
        region: String,
    }

    #[test]
    fn payload_round_trip() {
        let task = Task::with_payload(
            "aws:collect-vpcs",
            &Payload {
                account_id: "123456789012".to_owned(),
                region: "eu-central-1".to_owned(),
            },
        )
        .unwrap();
        let active = ActiveTask {
            id: "t1".to_owned(),
            kind: task.kind.clone(),
            queue: "inventory".to_owned(),
            attempt: 1,
            max_attempts: 10,
            timeout_secs: 1800,
            payload: task.payload,
        };
        let decoded: Payload = active.decode().unwrap().unwrap();
        assert_eq!(decoded.account_id, "123456789012");
        assert_eq!(decoded.region, "eu-central-1");
    }

    #[test]
    fn absent_payload_decodes_to_none() {
        let active = ActiveTask {
            id: "t1".to_owned(),
            kind: "aws:collect-vpcs".to_owned(),
            queue: "inventory".to_owned(),
            attempt: 1,
            max_attempts: 10,
            timeout_secs: 1800,
            payload: None,
        };
        assert_eq!(active.decode::<Payload>().unwrap(), None);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let active = ActiveTask {
            id: "t1".to_owned(),
            kind: "aws:collect-vpcs".to_owned(),
            queue: "inventory".to_owned(),
            attempt: 1,
            max_attempts: 10,
            timeout_secs: 1800,
            payload: Some(serde_json::json!({"account_id": 42})),
        };
        assert!(active.decode::<Payload>().is_err());
    }

    #[test]
    fn skip_retry_is_sticky() {
        let err = TaskError::skip_retry("missing account id".to_owned());
        assert!(err.is_skip_retry());
        assert_eq!(err.to_string(), "skip retry: missing account id");
        let err = TaskError::failed("transient".to_owned());
        assert!(!err.is_skip_retry());
    }

    #[test]
    fn handlers_register_and_resolve() {
        let registry: Registry<&'static str, Handler> = Registry::new();
        registry.must_register(
            "test:noop",
            handler(|_ctx, _task| async { Ok(()) }),
        );
        assert!(registry.exists("test:noop"));
        assert!(registry.get("test:noop").is_some());
        assert!(registry.get("test:missing").is_none());
    }
}
