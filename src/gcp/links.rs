//! GCP link functions, invoked best-effort by `gcp:link-all`.
use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx::PgPool;

use crate::links::{run_links, upsert_pairs, LinkFn};
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "gcp:link-all";

const LINKS: &[(&str, LinkFn)] = &[
    ("gcp:link-project-to-instance", project_to_instance),
    ("gcp:link-project-to-bucket", project_to_bucket),
    ("gcp:link-network-to-subnet", network_to_subnet),
];

pub fn register() {
    crate::queue::HANDLERS.must_register(TASK_KIND, crate::queue::handler(handle));
}

pub(crate) async fn handle(ctx: Arc<Context>, _task: ActiveTask) -> Result<(), TaskError> {
    run_links(&ctx.db, LINKS).await;
    Ok(())
}

fn project_to_instance(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_gcp_project_to_instance (project_id, instance_id)
        SELECT p.id, i.id
        FROM gcp_instances i
        JOIN gcp_projects p ON i.project_id = p.project_id
        ON CONFLICT (project_id, instance_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn project_to_bucket(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_gcp_project_to_bucket (project_id, bucket_id)
        SELECT p.id, b.id
        FROM gcp_buckets b
        JOIN gcp_projects p ON b.project_id = p.project_id
        ON CONFLICT (project_id, bucket_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn network_to_subnet(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_gcp_network_to_subnet (network_id, subnet_id)
        SELECT n.id, s.id
        FROM gcp_subnets s
        JOIN gcp_networks n ON s.network_name = n.name AND s.project_id = n.project_id
        ON CONFLICT (network_id, subnet_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

