//! AWS row structs and model descriptors.
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use super::Model;

pub const MODELS: &[Model] = &[
    Model {
        name: "aws:region",
        table: "aws_regions",
    },
    Model {
        name: "aws:az",
        table: "aws_azs",
    },
    Model {
        name: "aws:vpc",
        table: "aws_vpcs",
    },
    Model {
        name: "aws:subnet",
        table: "aws_subnets",
    },
    Model {
        name: "aws:instance",
        table: "aws_instances",
    },
    Model {
        name: "aws:image",
        table: "aws_images",
    },
    Model {
        name: "aws:net-interface",
        table: "aws_net_interfaces",
    },
    Model {
        name: "aws:bucket",
        table: "aws_buckets",
    },
    Model {
        name: "aws:loadbalancer",
        table: "aws_loadbalancers",
    },
    Model {
        name: "aws:dhcp-options",
        table: "aws_dhcp_options",
    },
    Model {
        name: "aws:hosted-zone",
        table: "aws_hosted_zones",
    },
    Model {
        name: "aws:resource-record-set",
        table: "aws_resource_record_sets",
    },
    Model {
        name: "aws:link-region-to-az",
        table: "l_aws_region_to_az",
    },
    Model {
        name: "aws:link-region-to-vpc",
        table: "l_aws_region_to_vpc",
    },
    Model {
        name: "aws:link-region-to-bucket",
        table: "l_aws_region_to_bucket",
    },
    Model {
        name: "aws:link-vpc-to-subnet",
        table: "l_aws_vpc_to_subnet",
    },
    Model {
        name: "aws:link-vpc-to-instance",
        table: "l_aws_vpc_to_instance",
    },
    Model {
        name: "aws:link-instance-to-image",
        table: "l_aws_instance_to_image",
    },
    Model {
        name: "aws:link-instance-to-net-interface",
        table: "l_aws_instance_to_net_interface",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    pub name: String,
    pub endpoint: String,
    pub opt_in_status: String,
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvailabilityZone {
    pub zone_name: String,
    pub zone_id: String,
    pub opt_in_status: String,
    pub state: String,
    pub group_name: String,
    pub network_border_group: String,
    pub region_name: String,
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Vpc {
    pub vpc_id: String,
    pub account_id: String,
    pub state: String,
    pub ipv4_cidr: String,
    pub is_default: bool,
    pub owner_id: String,
    pub region_name: String,
    /// Empty when the VPC reports no DHCP option set; logged as a mapping
    /// warning and stored as NULL.
    pub dhcp_options_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subnet {
    pub subnet_id: String,
    pub subnet_arn: String,
    pub account_id: String,
    pub vpc_id: String,
    pub state: String,
    pub az: String,
    pub az_id: String,
    pub available_ipv4_addresses: i32,
    pub ipv4_cidr: String,
    pub region_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Instance {
    pub instance_id: String,
    pub account_id: String,
    pub name: String,
    pub arch: String,
    pub instance_type: String,
    pub state: String,
    pub platform: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub image_id: String,
    pub region_name: String,
    pub launch_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Image {
    pub image_id: String,
    pub account_id: String,
    pub name: String,
    pub owner_id: String,
    pub image_type: String,
    pub state: String,
    pub root_device_type: String,
    pub region_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkInterface {
    pub interface_id: String,
    pub account_id: String,
    pub region_name: String,
    pub az: String,
    pub interface_type: String,
    pub mac_address: String,
    pub private_ip: Option<IpAddr>,
    pub public_ip: Option<IpAddr>,
    /// Name of the associated elastic IP allocation. Nullable join key;
    /// the empty string is coerced to NULL before insert.
    pub public_ip_name: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub instance_id: String,
    pub status: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bucket {
    pub name: String,
    pub account_id: String,
    pub region_name: String,
    pub creation_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadBalancer {
    pub name: String,
    pub dns_name: String,
    /// Empty for classic load balancers; only v2 carries an ARN.
    pub arn: String,
    pub state: String,
    pub lb_type: String,
    pub scheme: String,
    pub vpc_id: String,
    pub account_id: String,
    pub region_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DhcpOptions {
    pub set_id: String,
    pub account_id: String,
    pub region_name: String,
    pub domain_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostedZone {
    pub zone_id: String,
    pub account_id: String,
    pub name: String,
    pub is_private: bool,
    pub record_count: i64,
    pub caller_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceRecordSet {
    pub record_name: String,
    pub record_type: String,
    pub hosted_zone_id: String,
    pub account_id: String,
    pub ttl: i64,
    pub is_alias: bool,
    pub value: String,
}
