//! Durable broker over the `tasks` table.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never hand
//! out the same row twice; delivery is at-least-once via the lease reaper.
use std::time::Duration;

use snafu::ResultExt;
use sqlx::PgPool;
use tracing::debug;

use super::{ActiveTask, Database, Result, Task, TaskError};
use crate::config::{self, QueueConfig};

/// Backoff before retry attempt `attempt + 1`: 30 s doubling per attempt,
/// capped at one hour.
#[must_use]
pub(crate) fn retry_delay(attempt: i32) -> Duration {
    let attempt = u32::try_from(attempt.max(0)).unwrap_or(0).min(20);
    Duration::from_secs((30u64 << attempt).min(3600))
}

/// Identity of a durably accepted task and the queue it landed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
}

#[derive(Clone)]
pub struct Broker {
    pool: PgPool,
    default_queue: String,
    default_timeout_secs: i64,
    max_attempts: i32,
}

impl Broker {
    pub fn new(pool: PgPool, cfg: &QueueConfig) -> config::Result<Self> {
        let timeout = cfg.default_timeout()?;
        Ok(Self {
            pool,
            default_queue: cfg.name.clone(),
            default_timeout_secs: i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX),
            max_attempts: cfg.max_attempts,
        })
    }

    /// Durably accepts a task. Returns its id and the queue actually
    /// selected (the default queue when none is named).
    pub async fn enqueue(&self, task: &Task, queue: Option<&str>) -> Result<TaskInfo> {
        self.enqueue_in(task, queue, Duration::ZERO).await
    }

    /// Like [`Broker::enqueue`] with delayed delivery.
    pub async fn enqueue_in(
        &self,
        task: &Task,
        queue: Option<&str>,
        delay: Duration,
    ) -> Result<TaskInfo> {
        let id = xid::new().to_string();
        let queue = queue.unwrap_or(&self.default_queue).to_owned();
        sqlx::query(
            r"
            INSERT INTO tasks (id, kind, queue, payload, status, run_at, timeout_secs, max_attempts)
            VALUES ($1, $2, $3, $4, 'pending', now() + make_interval(secs => $5), $6, $7)
            ",
        )
        .bind(&id)
        .bind(&task.kind)
        .bind(&queue)
        .bind(&task.payload)
        .bind(delay.as_secs_f64())
        .bind(self.default_timeout_secs)
        .bind(self.max_attempts)
        .execute(&self.pool)
        .await
        .context(Database)?;
        debug!(task_id = %id, task_kind = %task.kind, queue = %queue, "enqueued task");
        Ok(TaskInfo { id, queue })
    }

    /// Claims the oldest runnable task on any of the given queues,
    /// marking it active and starting its lease.
    pub(crate) async fn claim(&self, queues: &[String]) -> Result<Option<ActiveTask>> {
        sqlx::query_as::<_, ActiveTask>(
            r"
            UPDATE tasks
            SET status = 'active',
                attempt = attempt + 1,
                lease_expires_at = now() + make_interval(secs => timeout_secs),
                updated_at = now()
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending' AND queue = ANY($1) AND run_at <= now()
                ORDER BY run_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, queue, attempt, max_attempts, timeout_secs, payload
            ",
        )
        .bind(queues)
        .fetch_optional(&self.pool)
        .await
        .context(Database)
    }

    pub(crate) async fn complete(&self, task: &ActiveTask) -> Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(&task.id)
            .execute(&self.pool)
            .await
            .context(Database)?;
        Ok(())
    }

    /// Terminal state for [`TaskError::SkipRetry`]; the row is kept for
    /// inspection with the error recorded.
    pub(crate) async fn skip(&self, task: &ActiveTask, err: &TaskError) -> Result<()> {
        sqlx::query(
            r"
            UPDATE tasks
            SET status = 'skipped', lease_expires_at = NULL, last_error = $2, updated_at = now()
            WHERE id = $1
            ",
        )
        .bind(&task.id)
        .bind(err.to_string())
        .execute(&self.pool)
        .await
        .context(Database)?;
        Ok(())
    }

    /// Retryable failure: back onto the queue with backoff, or `dead`
    /// once the attempt budget is spent.
    pub(crate) async fn fail(&self, task: &ActiveTask, reason: &str) -> Result<()> {
        if task.attempt >= task.max_attempts {
            sqlx::query(
                r"
                UPDATE tasks
                SET status = 'dead', lease_expires_at = NULL, last_error = $2, updated_at = now()
                WHERE id = $1
                ",
            )
            .bind(&task.id)
            .bind(reason)
            .execute(&self.pool)
            .await
            .context(Database)?;
        } else {
            sqlx::query(
                r"
                UPDATE tasks
                SET status = 'pending',
                    run_at = now() + make_interval(secs => $2),
                    lease_expires_at = NULL,
                    last_error = $3,
                    updated_at = now()
                WHERE id = $1
                ",
            )
            .bind(&task.id)
            .bind(retry_delay(task.attempt).as_secs_f64())
            .bind(reason)
            .execute(&self.pool)
            .await
            .context(Database)?;
        }
        Ok(())
    }

    /// Requeues active tasks whose lease expired (worker death or
    /// deadline overrun noticed late). Exhausted tasks go to `dead`.
    pub(crate) async fn reap_expired(&self) -> Result<u64> {
        let dead = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'dead', lease_expires_at = NULL,
                last_error = 'lease expired', updated_at = now()
            WHERE status = 'active' AND lease_expires_at < now() AND attempt >= max_attempts
            ",
        )
        .execute(&self.pool)
        .await
        .context(Database)?
        .rows_affected();
        let requeued = sqlx::query(
            r"
            UPDATE tasks
            SET status = 'pending', run_at = now(), lease_expires_at = NULL,
                last_error = 'lease expired', updated_at = now()
            WHERE status = 'active' AND lease_expires_at < now()
            ",
        )
        .execute(&self.pool)
        .await
        .context(Database)?
        .rows_affected();
        Ok(dead + requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_secs(30));
        assert_eq!(retry_delay(1), Duration::from_secs(60));
        assert_eq!(retry_delay(2), Duration::from_secs(120));
        assert_eq!(retry_delay(6), Duration::from_secs(1920));
        assert_eq!(retry_delay(7), Duration::from_secs(3600));
        assert_eq!(retry_delay(100), Duration::from_secs(3600));
        assert_eq!(retry_delay(-1), Duration::from_secs(30));
    }
}
