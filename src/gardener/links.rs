//! Gardener link functions, invoked best-effort by `g:link-all`.
use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx::PgPool;

use crate::links::{run_links, upsert_pairs, LinkFn};
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "g:link-all";

const LINKS: &[(&str, LinkFn)] = &[
    ("g:link-seed-to-shoot", seed_to_shoot),
    ("g:link-seed-to-node", seed_to_node),
];

pub fn register() {
    crate::queue::HANDLERS.must_register(TASK_KIND, crate::queue::handler(handle));
}

pub(crate) async fn handle(ctx: Arc<Context>, _task: ActiveTask) -> Result<(), TaskError> {
    run_links(&ctx.db, LINKS).await;
    Ok(())
}

fn seed_to_shoot(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_g_seed_to_shoot (seed_id, shoot_id)
        SELECT seed.id, shoot.id
        FROM g_shoots shoot
        JOIN g_seeds seed ON shoot.seed_name = seed.name
        ON CONFLICT (seed_id, shoot_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}

fn seed_to_node(db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
    upsert_pairs(
        db,
        r"
        INSERT INTO l_g_seed_to_node (seed_id, node_id)
        SELECT seed.id, node.id
        FROM g_nodes node
        JOIN g_seeds seed ON node.seed_name = seed.name
        ON CONFLICT (seed_id, node_id) DO UPDATE SET updated_at = EXCLUDED.updated_at
        ",
    )
}
