//! TTL-based row reaper.
//!
//! Runs as a scheduled task. Each registered model with a configured
//! retention gets one DELETE by `updated_at` age and one run record; a
//! failing model is recorded with `is_ok = false` and never stops the
//! remaining sweeps. Link rows age out here too, which is also what
//! cleans up links orphaned by earlier resource deletions.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::queue::{handler, register_scheduled, ActiveTask, Context, TaskError, HANDLERS};

pub const TASK_KIND: &str = "common:housekeeper";
const DEFAULT_SCHEDULE: &str = "0 0 3 * * *";

pub fn register_tasks() {
    HANDLERS.must_register(TASK_KIND, handler(handle));
    register_scheduled(TASK_KIND, DEFAULT_SCHEDULE);
}

async fn handle(ctx: Arc<Context>, _task: ActiveTask) -> Result<(), TaskError> {
    for (name, model) in crate::models::MODELS.entries() {
        let Some(ttl) = ctx.config.housekeeper.ttl_for(name) else {
            continue;
        };
        let started_at = Utc::now();
        let result = match ttl {
            Ok(ttl) => sweep(&ctx.db, model.table, ttl).await,
            Err(err) => {
                warn!(model = name, "invalid retention: {}", err);
                Err(sqlx::Error::Configuration(Box::new(err)))
            }
        };
        let (count, is_ok) = match result {
            Ok(count) => {
                info!(model = name, count, "housekeeper swept model");
                (count, true)
            }
            Err(err) => {
                warn!(model = name, "housekeeper sweep failed: {}", err);
                (0, false)
            }
        };
        if let Err(err) = record_run(&ctx.db, name, started_at, count, is_ok).await {
            warn!(model = name, "failed to record housekeeper run: {}", err);
        }
    }
    Ok(())
}

async fn sweep(db: &PgPool, table: &str, ttl: Duration) -> Result<u64, sqlx::Error> {
    // Table names come from the static model catalog, never from input.
    let sql = format!("DELETE FROM {table} WHERE updated_at < now() - make_interval(secs => $1)");
    let result = sqlx::query(&sql).bind(ttl.as_secs_f64()).execute(db).await?;
    Ok(result.rows_affected())
}

async fn record_run(
    db: &PgPool,
    model_name: &str,
    started_at: DateTime<Utc>,
    count: u64,
    is_ok: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO housekeeper_runs (model_name, started_at, completed_at, count, is_ok)
        VALUES ($1, $2, now(), $3, $4)
        ",
    )
    .bind(model_name)
    .bind(started_at)
    .bind(i64::try_from(count).unwrap_or(i64::MAX))
    .bind(is_ok)
    .execute(db)
    .await?;
    Ok(())
}
