//! The `collect-all` meta task.
//!
//! The order is load-bearing: regions come first so that the
//! region-scoped fan-outs that follow have a populated region table, and
//! hosted zones precede record sets for the same reason.
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tracing::info;

use super::{
    azs, buckets, dhcp, images, instances, loadbalancers, net_interfaces, regions,
    route53_records, route53_zones, subnets, vpcs,
};
use crate::queue::{self, ActiveTask, Context, Task, TaskError};

pub const TASK_KIND: &str = "aws:collect-all";

const COLLECTORS: &[&str] = &[
    regions::TASK_KIND,
    azs::TASK_KIND,
    vpcs::TASK_KIND,
    subnets::TASK_KIND,
    instances::TASK_KIND,
    images::TASK_KIND,
    net_interfaces::TASK_KIND,
    buckets::TASK_KIND,
    loadbalancers::TASK_KIND,
    dhcp::TASK_KIND,
    route53_zones::TASK_KIND,
    route53_records::TASK_KIND,
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
    info!(count = COLLECTORS.len(), "enqueued AWS collection tasks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_come_first_and_records_after_zones() {
        assert_eq!(COLLECTORS[0], regions::TASK_KIND);
        let zones = COLLECTORS
            .iter()
            .position(|k| *k == route53_zones::TASK_KIND)
            .unwrap();
        let records = COLLECTORS
            .iter()
            .position(|k| *k == route53_records::TASK_KIND)
            .unwrap();
        assert!(zones < records);
    }
}
