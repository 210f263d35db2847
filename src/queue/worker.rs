//! Worker pool: claim loops, per-task deadline, lease reaping.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn, Instrument};

use super::{ActiveTask, Context, TaskError, HANDLERS};
use crate::config;

const REAP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Worker {
    ctx: Arc<Context>,
    queues: Vec<String>,
    concurrency: usize,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(ctx: Arc<Context>) -> config::Result<Self> {
        let cfg = &ctx.config.queue;
        let poll_interval = cfg.poll_interval()?;
        Ok(Self {
            queues: cfg.queues.clone(),
            concurrency: cfg.concurrency.max(1),
            poll_interval,
            ctx,
        })
    }

    /// Runs `concurrency` claim loops plus the lease reaper until
    /// shutdown is signalled. Resolves once every loop has drained.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::with_capacity(self.concurrency + 1);
        handles.push(tokio::spawn(reaper_loop(
            Arc::clone(&self.ctx),
            shutdown.clone(),
        )));
        for _ in 0..self.concurrency {
            handles.push(tokio::spawn(claim_loop(
                Arc::clone(&self.ctx),
                self.queues.clone(),
                self.poll_interval,
                shutdown.clone(),
            )));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("worker loop panicked: {}", err);
            }
        }
    }
}

async fn claim_loop(
    ctx: Arc<Context>,
    queues: Vec<String>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match ctx.broker.claim(&queues).await {
            Ok(Some(task)) => execute(&ctx, task).await,
            Ok(None) => {
                tokio::select! {
                    () = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(err) => {
                warn!("failed to claim task: {}", err);
                tokio::select! {
                    () = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Runs one claimed task to a terminal state. Every handler executes
/// inside a span carrying the task identity, so all of its logs do too.
async fn execute(ctx: &Arc<Context>, task: ActiveTask) {
    let span = tracing::info_span!(
        "task",
        task_id = %task.id,
        task_kind = %task.kind,
        queue = %task.queue,
        attempt = task.attempt,
    );
    let Some(handler) = HANDLERS.get(task.kind.as_str()) else {
        warn!(task_kind = %task.kind, "no handler registered for task");
        let err = TaskError::skip_retry(format!("no handler for task kind {:?}", task.kind));
        if let Err(err) = ctx.broker.skip(&task, &err).await {
            warn!("failed to mark task skipped: {}", err);
        }
        return;
    };
    let deadline = Duration::from_secs(u64::try_from(task.timeout_secs).unwrap_or(u64::MAX));
    let result = tokio::time::timeout(deadline, handler(Arc::clone(ctx), task.clone()))
        .instrument(span)
        .await;
    let outcome = match result {
        Ok(Ok(())) => {
            debug!(task_id = %task.id, task_kind = %task.kind, "task completed");
            ctx.broker.complete(&task).await
        }
        Ok(Err(err)) if err.is_skip_retry() => {
            warn!(task_id = %task.id, task_kind = %task.kind, "task skipped: {}", err);
            ctx.broker.skip(&task, &err).await
        }
        Ok(Err(err)) => {
            warn!(task_id = %task.id, task_kind = %task.kind, "task failed: {}", err);
            ctx.broker.fail(&task, &err.to_string()).await
        }
        Err(_elapsed) => {
            warn!(task_id = %task.id, task_kind = %task.kind, "task deadline exceeded");
            ctx.broker.fail(&task, "deadline exceeded").await
        }
    };
    if let Err(err) = outcome {
        warn!(task_id = %task.id, "failed to record task outcome: {}", err);
    }
}

async fn reaper_loop(ctx: Arc<Context>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match ctx.broker.reap_expired().await {
            Ok(0) => {}
            Ok(count) => warn!(count, "requeued tasks with expired leases"),
            Err(err) => warn!("lease reaper failed: {}", err),
        }
        tokio::select! {
            () = tokio::time::sleep(REAP_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }
}
