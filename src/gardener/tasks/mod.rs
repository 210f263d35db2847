//! Gardener collector tasks.
use crate::metrics;
use crate::queue::{handler, register_scheduled, HANDLERS};

pub mod collect_all;
pub mod nodes;
pub mod seeds;
pub mod shoots;

const DEFAULT_COLLECT_SCHEDULE: &str = "0 20 * * * *";
const DEFAULT_LINK_SCHEDULE: &str = "0 50 * * * *";

pub fn register() {
    HANDLERS.must_register(seeds::TASK_KIND, handler(seeds::handle));
    HANDLERS.must_register(shoots::TASK_KIND, handler(shoots::handle));
    HANDLERS.must_register(nodes::TASK_KIND, handler(nodes::handle));
    HANDLERS.must_register(collect_all::TASK_KIND, handler(collect_all::handle));

    register_scheduled(collect_all::TASK_KIND, DEFAULT_COLLECT_SCHEDULE);
    register_scheduled(super::links::TASK_KIND, DEFAULT_LINK_SCHEDULE);
}

pub fn register_metrics() {
    metrics::must_register(&seeds::METRIC);
    metrics::must_register(&shoots::METRIC);
    metrics::must_register(&nodes::METRIC);
}
