//! Client-set refresh: re-resolves credentials and overwrites the
//! per-service registries without a restart. Handlers already holding a
//! client keep it for the duration of their current call.
use std::sync::Arc;

use crate::aws::clients;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "aws:refresh-clients";

pub(crate) async fn handle(ctx: Arc<Context>, _task: ActiveTask) -> Result<(), TaskError> {
    let configured = clients::configure(&ctx.config.aws).await;
    if configured == 0 && !ctx.config.aws.accounts.is_empty() {
        return Err(TaskError::failed(
            "no AWS account could be refreshed".to_owned(),
        ));
    }
    Ok(())
}
