//! The GCP `collect-all` meta task. Projects come first so the
//! per-project fan-outs that follow have a populated client set and
//! table.
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tracing::info;

use super::{buckets, disks, gke, instances, networks, projects, subnets};
use crate::queue::{self, ActiveTask, Context, Task, TaskError};

pub const TASK_KIND: &str = "gcp:collect-all";

const COLLECTORS: &[&str] = &[
    projects::TASK_KIND,
    instances::TASK_KIND,
    disks::TASK_KIND,
    buckets::TASK_KIND,
    networks::TASK_KIND,
    subnets::TASK_KIND,
    gke::TASK_KIND,
];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to enqueue {}: {}", kind, source))]
    Enqueue {
        kind: String,
        source: queue::Error,
    },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        TaskError::failed(err)
    }
}

pub(crate) async fn handle(ctx: Arc<Context>, task: ActiveTask) -> Result<(), TaskError> {
    for kind in COLLECTORS {
        ctx.broker
            .enqueue(&Task::new(*kind), Some(&task.queue))
            .await
            .with_context(|| Enqueue {
                kind: (*kind).to_owned(),
            })
            .map_err(Error::into)?;
    }
    info!(count = COLLECTORS.len(), "enqueued GCP collection tasks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_come_first() {
        assert_eq!(COLLECTORS[0], projects::TASK_KIND);
    }
}
