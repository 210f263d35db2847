//! AWS link functions, invoked best-effort by `aws:link-all`.
use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx::PgPool;

use crate::links::{run_links, upsert_pairs, LinkFn};
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "aws:link-all";

/// Fixed invocation order. Links only read committed rows, so unlike
/// the collect-all order this one is cosmetic.
const LINKS: &[(&str, LinkFn)] = &[
    ("aws:link-region-to-az", region_to_az),
    ("aws:link-region-to-vpc", region_to_vpc),
    ("aws:link-region-to-bucket", region_to_bucket),
    ("aws:link-vpc-to-subnet", vpc_to_subnet),
    ("aws:link-vpc-to-instance", vpc_to_instance),
    ("aws:link-instance-to-image", instance_to_image),
    ("aws:link-instance-to-net-interface", instance_to_net_interface),
];

pub fn register() {
    crate::queue::HANDLERS.must_register(TASK_KIND, crate::queue::handler(handle));
}

pub(crate) async fn handle(ctx: Arc<Context>, _task: ActiveTask) -> Result<(), TaskError> {
    run_links(&ctx.db, LINKS).await;
    Ok(())
}

fn region_to_az(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_aws_region_to_az (region_id, az_id)
        SELECT r.id, az.id
        FROM aws_azs az
        JOIN aws_regions r ON az.region_name = r.name AND az.account_id = r.account_id
        ON CONFLICT (region_id, az_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn region_to_vpc(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_aws_region_to_vpc (region_id, vpc_id)
        SELECT r.id, v.id
        FROM aws_vpcs v
        JOIN aws_regions r ON v.region_name = r.name AND v.account_id = r.account_id
        ON CONFLICT (region_id, vpc_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn region_to_bucket(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_aws_region_to_bucket (region_id, bucket_id)
        SELECT r.id, b.id
        FROM aws_buckets b
        JOIN aws_regions r ON b.region_name = r.name AND b.account_id = r.account_id
        ON CONFLICT (region_id, bucket_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn vpc_to_subnet(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_aws_vpc_to_subnet (vpc_id, subnet_id)
        SELECT v.id, s.id
        FROM aws_subnets s
        JOIN aws_vpcs v ON s.vpc_id = v.vpc_id AND s.account_id = v.account_id
        ON CONFLICT (vpc_id, subnet_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn vpc_to_instance(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_aws_vpc_to_instance (vpc_id, instance_id)
        SELECT v.id, i.id
        FROM aws_instances i
        JOIN aws_vpcs v ON i.vpc_id = v.vpc_id AND i.account_id = v.account_id
        ON CONFLICT (vpc_id, instance_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn instance_to_image(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_aws_instance_to_image (instance_id, image_id)
        SELECT i.id, img.id
        FROM aws_instances i
        JOIN aws_images img ON i.image_id = img.image_id AND i.account_id = img.account_id
        ON CONFLICT (instance_id, image_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn instance_to_net_interface(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_aws_instance_to_net_interface (instance_id, net_interface_id)
        SELECT i.id, ni.id
        FROM aws_net_interfaces ni
        JOIN aws_instances i ON ni.instance_id = i.instance_id AND ni.account_id = i.account_id
        WHERE ni.instance_id <> ''
        ON CONFLICT (instance_id, net_interface_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}
