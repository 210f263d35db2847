//! The Gardener `collect-all` meta task. Seeds come first: the node
//! fan-out joins against the seed table.
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tracing::info;

use super::{nodes, seeds, shoots};
use crate::queue::{self, ActiveTask, Context, Task, TaskError};

pub const TASK_KIND: &str = "g:collect-all";

const COLLECTORS: &[&str] = &[seeds::TASK_KIND, shoots::TASK_KIND, nodes::TASK_KIND];

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
    info!(
        count = COLLECTORS.len(),
        "enqueued Gardener collection tasks"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_come_first() {
        assert_eq!(COLLECTORS[0], seeds::TASK_KIND);
    }
}
