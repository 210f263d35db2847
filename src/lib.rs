#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
pub mod aws;
pub mod config;
pub mod db;
pub mod gardener;
pub mod gcp;
pub mod housekeeper;
pub mod links;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod registry;
pub mod utils;
pub mod vault;

pub use config::Config;
pub use queue::{Context, Task, TaskError};
pub use registry::{Flow, Registry};

/// Populates every process registry: models, task handlers, scheduled
/// tasks, and metric descriptors.
///
/// This is the assembly phase. After it returns, the run phase (worker
/// pool, scheduler) only reads from the registries; the sole exception is
/// client-set refresh, which goes through `Registry::overwrite`. Client
/// sets are populated separately by the provider `configure` functions
/// since they perform I/O.
pub fn assemble() {
    models::register_models();
    housekeeper::register_tasks();
    aws::register_tasks();
    aws::register_metrics();
    gcp::register_tasks();
    gcp::register_metrics();
    gardener::register_tasks();
    gardener::register_metrics();
}
