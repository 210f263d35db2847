//! Gardener row structs and model descriptors.
use super::Model;

pub const MODELS: &[Model] = &[
    Model {
        name: "g:seed",
        table: "g_seeds",
    },
    Model {
        name: "g:shoot",
        table: "g_shoots",
    },
    Model {
        name: "g:node",
        table: "g_nodes",
    },
    Model {
        name: "g:link-seed-to-shoot",
        table: "l_g_seed_to_shoot",
    },
    Model {
        name: "g:link-seed-to-node",
        table: "l_g_seed_to_node",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Seed {
    pub name: String,
    pub provider_type: String,
    pub region: String,
    pub kubernetes_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Shoot {
    pub name: String,
    pub namespace: String,
    pub technical_id: String,
    pub project_name: String,
    pub cloud_profile: String,
    pub purpose: String,
    pub seed_name: String,
    pub status: String,
    pub is_hibernated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub name: String,
    pub seed_name: String,
    pub provider_id: String,
    pub instance_type: String,
    pub region: String,
    pub zone: String,
    pub kubelet_version: String,
}
