//! The broker's timer: turns the scheduled-task registry into periodic
//! enqueues. The registry only carries `(cron expression, task)` pairs;
//! configuration overrides the expression per task kind.
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{Context, Task, SCHEDULED};
use crate::config::Config;
use crate::registry::Flow;

const MAX_SLEEP: Duration = Duration::from_secs(60);

struct Entry {
    kind: String,
    schedule: Schedule,
    task: Task,
}

/// Resolves each registered scheduled task against configuration. A pair
/// with an unparseable expression is logged and skipped; the others keep
/// running.
fn plan(config: &Config) -> Vec<Entry> {
    let mut entries = Vec::new();
    let result: Result<(), cron::error::Error> = SCHEDULED.range(|kind, scheduled| {
        let spec = config
            .scheduler
            .schedules
            .get(*kind)
            .unwrap_or(&scheduled.spec);
        match Schedule::from_str(spec) {
            Ok(schedule) => entries.push(Entry {
                kind: (*kind).to_owned(),
                schedule,
                task: scheduled.task.clone(),
            }),
            Err(err) => {
                warn!(task_kind = %kind, "invalid cron expression {:?}: {}", spec, err);
            }
        }
        Ok(Flow::Continue)
    });
    if let Err(err) = result {
        warn!("failed to read scheduled tasks: {}", err);
    }
    entries
}

pub async fn run(ctx: Arc<Context>, mut shutdown: watch::Receiver<bool>) {
    let entries = plan(&ctx.config);
    if entries.is_empty() {
        warn!("no scheduled tasks registered");
        return;
    }
    let mut next_fires: Vec<Option<DateTime<Utc>>> = entries
        .iter()
        .map(|entry| entry.schedule.upcoming(Utc).next())
        .collect();
    for (entry, next) in entries.iter().zip(&next_fires) {
        debug!(task_kind = %entry.kind, next = ?next, "scheduled task planned");
    }

    loop {
        if *shutdown.borrow() {
            return;
        }
        let now = Utc::now();
        for (i, entry) in entries.iter().enumerate() {
            let Some(at) = next_fires[i] else { continue };
            if at > now {
                continue;
            }
            match ctx.broker.enqueue(&entry.task, None).await {
                Ok(info) => {
                    debug!(task_kind = %entry.kind, task_id = %info.id, queue = %info.queue, "scheduled task enqueued");
                }
                Err(err) => {
                    warn!(task_kind = %entry.kind, "failed to enqueue scheduled task: {}", err);
                }
            }
            next_fires[i] = entry.schedule.after(&now).next();
        }

        let sleep_for = next_fires
            .iter()
            .flatten()
            .map(|at| (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .min()
            .unwrap_or(MAX_SLEEP)
            .min(MAX_SLEEP);
        tokio::select! {
            () = tokio::time::sleep(sleep_for) => {}
            _ = shutdown.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_expressions_fire_in_order() {
        // Six-field cron: every hour on the hour.
        let schedule = Schedule::from_str("0 0 * * * *").unwrap();
        let after = DateTime::parse_from_rfc3339("2024-05-01T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = schedule.after(&after).next().unwrap();
        assert_eq!(next.to_rfc3339(), "2024-05-01T11:00:00+00:00");
    }

    #[test]
    fn invalid_expression_fails_to_parse() {
        assert!(Schedule::from_str("not a cron").is_err());
    }
}
