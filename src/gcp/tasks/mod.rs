//! GCP collector tasks.
use crate::metrics;
use crate::queue::{handler, register_scheduled, HANDLERS};

pub mod buckets;
pub mod collect_all;
pub mod disks;
pub mod gke;
pub mod instances;
pub mod networks;
pub mod projects;
pub mod subnets;

const DEFAULT_COLLECT_SCHEDULE: &str = "0 10 * * * *";
const DEFAULT_LINK_SCHEDULE: &str = "0 40 * * * *";

pub fn register() {
    HANDLERS.must_register(projects::TASK_KIND, handler(projects::handle));
    HANDLERS.must_register(instances::TASK_KIND, handler(instances::handle));
    HANDLERS.must_register(disks::TASK_KIND, handler(disks::handle));
    HANDLERS.must_register(buckets::TASK_KIND, handler(buckets::handle));
    HANDLERS.must_register(networks::TASK_KIND, handler(networks::handle));
    HANDLERS.must_register(subnets::TASK_KIND, handler(subnets::handle));
    HANDLERS.must_register(gke::TASK_KIND, handler(gke::handle));
    HANDLERS.must_register(collect_all::TASK_KIND, handler(collect_all::handle));

    register_scheduled(collect_all::TASK_KIND, DEFAULT_COLLECT_SCHEDULE);
    register_scheduled(super::links::TASK_KIND, DEFAULT_LINK_SCHEDULE);
}

pub fn register_metrics() {
    metrics::must_register(&projects::METRIC);
    metrics::must_register(&instances::METRIC);
    metrics::must_register(&disks::METRIC);
    metrics::must_register(&buckets::METRIC);
    metrics::must_register(&networks::METRIC);
    metrics::must_register(&subnets::METRIC);
    metrics::must_register(&gke::METRIC);
}
