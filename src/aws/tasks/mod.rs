//! AWS collector tasks.
use crate::metrics;
use crate::queue::{handler, register_scheduled, HANDLERS};

pub mod azs;
pub mod buckets;
pub mod collect_all;
pub mod dhcp;
pub mod images;
pub mod instances;
pub mod loadbalancers;
pub mod net_interfaces;
pub mod refresh;
pub mod regions;
pub mod route53_records;
pub mod route53_zones;
pub mod subnets;
pub mod vpcs;

const DEFAULT_COLLECT_SCHEDULE: &str = "0 0 * * * *";
const DEFAULT_LINK_SCHEDULE: &str = "0 30 * * * *";
const DEFAULT_REFRESH_SCHEDULE: &str = "0 15 */6 * * *";

pub fn register() {
    HANDLERS.must_register(regions::TASK_KIND, handler(regions::handle));
    HANDLERS.must_register(azs::TASK_KIND, handler(azs::handle));
    HANDLERS.must_register(vpcs::TASK_KIND, handler(vpcs::handle));
    HANDLERS.must_register(subnets::TASK_KIND, handler(subnets::handle));
    HANDLERS.must_register(instances::TASK_KIND, handler(instances::handle));
    HANDLERS.must_register(images::TASK_KIND, handler(images::handle));
    HANDLERS.must_register(net_interfaces::TASK_KIND, handler(net_interfaces::handle));
    HANDLERS.must_register(buckets::TASK_KIND, handler(buckets::handle));
    HANDLERS.must_register(loadbalancers::TASK_KIND, handler(loadbalancers::handle));
    HANDLERS.must_register(dhcp::TASK_KIND, handler(dhcp::handle));
    HANDLERS.must_register(route53_zones::TASK_KIND, handler(route53_zones::handle));
    HANDLERS.must_register(route53_records::TASK_KIND, handler(route53_records::handle));
    HANDLERS.must_register(collect_all::TASK_KIND, handler(collect_all::handle));
    HANDLERS.must_register(refresh::TASK_KIND, handler(refresh::handle));

    register_scheduled(collect_all::TASK_KIND, DEFAULT_COLLECT_SCHEDULE);
    register_scheduled(super::links::TASK_KIND, DEFAULT_LINK_SCHEDULE);
    register_scheduled(refresh::TASK_KIND, DEFAULT_REFRESH_SCHEDULE);
}

pub fn register_metrics() {
    metrics::must_register(&regions::METRIC);
    metrics::must_register(&azs::METRIC);
    metrics::must_register(&vpcs::METRIC);
    metrics::must_register(&subnets::METRIC);
    metrics::must_register(&instances::METRIC);
    metrics::must_register(&images::METRIC);
    metrics::must_register(&net_interfaces::METRIC);
    metrics::must_register(&buckets::METRIC);
    metrics::must_register(&loadbalancers::METRIC);
    metrics::must_register(&dhcp::METRIC);
    metrics::must_register(&route53_zones::METRIC);
    metrics::must_register(&route53_records::METRIC);
}
