//! Database pool construction.
//!
//! The pool is shared by every worker; each upsert is its own autocommit
//! statement, so there is no transaction plumbing here. Schema lives in
//! `migrations/` and is materialized by an external `sqlx migrate` step;
//! nothing in this crate issues DDL at runtime.
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;

pub async fn connect(cfg: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .connect(&cfg.dsn)
        .await
}
