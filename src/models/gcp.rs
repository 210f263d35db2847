//! GCP row structs and model descriptors.
use super::Model;

pub const MODELS: &[Model] = &[
    Model {
        name: "gcp:project",
        table: "gcp_projects",
    },
    Model {
        name: "gcp:instance",
        table: "gcp_instances",
    },
    Model {
        name: "gcp:disk",
        table: "gcp_disks",
    },
    Model {
        name: "gcp:bucket",
        table: "gcp_buckets",
    },
    Model {
        name: "gcp:network",
        table: "gcp_networks",
    },
    Model {
        name: "gcp:subnet",
        table: "gcp_subnets",
    },
    Model {
        name: "gcp:gke-cluster",
        table: "gcp_gke_clusters",
    },
    Model {
        name: "gcp:link-project-to-instance",
        table: "l_gcp_project_to_instance",
    },
    Model {
        name: "gcp:link-project-to-bucket",
        table: "l_gcp_project_to_bucket",
    },
    Model {
        name: "gcp:link-network-to-subnet",
        table: "l_gcp_network_to_subnet",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instance {
    pub instance_id: String,
    pub name: String,
    pub project_id: String,
    pub zone: String,
    pub region: String,
    pub status: String,
    pub machine_type: String,
    /// Derived by following the first boot-disk reference; empty when the
    /// instance reports no boot disk.
    pub source_machine_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disk {
    pub name: String,
    pub project_id: String,
    /// Empty for regional disks.
    pub zone: String,
    pub region: String,
    pub disk_type: String,
    pub status: String,
    pub size_gb: i64,
    pub is_regional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bucket {
    pub name: String,
    pub project_id: String,
    pub location: String,
    pub storage_class: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Network {
    pub name: String,
    pub project_id: String,
    pub description: String,
    pub mtu: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subnet {
    pub name: String,
    pub project_id: String,
    pub network_name: String,
    pub region: String,
    pub ipv4_cidr: String,
    pub purpose: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GkeCluster {
    pub name: String,
    pub project_id: String,
    pub location: String,
    pub endpoint: String,
    /// Base64 PEM, as reported by the API.
    pub ca_certificate: String,
    pub status: String,
}
