//! Model catalog.
//!
//! Every inventory table has a row struct here and a [`Model`] descriptor
//! registered at assembly. The descriptors are what the housekeeper
//! ranges over; the row structs are what the collectors' mapping steps
//! produce. The schema itself is declared in `migrations/` and
//! materialized by an external migration step.
//!
//! Every row carries `id` (locally assigned), `created_at` and
//! `updated_at`; both timestamps default to insertion time and
//! `updated_at` is overwritten by every upsert. Natural keys are unique
//! constraints per table. Link tables carry the local ids of both ends
//! under a unique pair constraint.
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use crate::registry::Registry;

pub mod aws;
pub mod gardener;
pub mod gcp;

/// Descriptor of one inventory table, keyed by model name in the model
/// registry. The name is what housekeeper retention configuration is
/// indexed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub name: &'static str,
    pub table: &'static str,
}

pub static MODELS: Lazy<Registry<&'static str, Model>> = Lazy::new(Registry::new);

/// Registers every model, including link-table models, which age out by
/// the same retention rule as resource rows.
pub fn register_models() {
    for model in aws::MODELS
        .iter()
        .chain(gcp::MODELS)
        .chain(gardener::MODELS)
    {
        MODELS.must_register(model.name, *model);
    }
}

/// One row per model per housekeeper sweep.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HousekeeperRun {
    pub id: i64,
    pub model_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub count: i64,
    pub is_ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_are_unique() {
        let registry: Registry<&'static str, Model> = Registry::new();
        for model in aws::MODELS
            .iter()
            .chain(gcp::MODELS)
            .chain(gardener::MODELS)
        {
            registry
                .register(model.name, *model)
                .expect("duplicate model name");
        }
        assert_eq!(
            registry.len(),
            aws::MODELS.len() + gcp::MODELS.len() + gardener::MODELS.len()
        );
    }

    #[test]
    fn model_tables_are_unique() {
        let registry: Registry<&'static str, Model> = Registry::new();
        for model in aws::MODELS
            .iter()
            .chain(gcp::MODELS)
            .chain(gardener::MODELS)
        {
            registry
                .register(model.table, *model)
                .expect("duplicate model table");
        }
    }
}
