//! Link engine.
//!
//! A link function materializes one relationship as `(left id, right
//! id)` rows with a single idempotent INSERT..SELECT upsert; the JOIN
//! only produces pairs whose both ends exist at insertion time. Link
//! passes never cascade deletes; stale pairs age out through the
//! housekeeper like any other row.
use futures::future::BoxFuture;
use sqlx::PgPool;
use tracing::{info, warn};

pub type LinkFn = for<'a> fn(&'a PgPool) -> BoxFuture<'a, Result<u64, sqlx::Error>>;

/// Invokes every link function in order, best-effort: a failing function
/// is logged and the remaining functions still run. Returns the number
/// of failures, which callers deliberately do not turn into an error.
pub async fn run_links(db: &PgPool, links: &[(&str, LinkFn)]) -> usize {
    let mut failed = 0;
    for &(name, link) in links {
        match link(db).await {
            Ok(count) => info!(link = name, count, "linked rows"),
            Err(err) => {
                failed += 1;
                warn!(link = name, "link function failed: {}", err);
            }
        }
    }
    failed
}

/// Executes one link upsert statement and reports the affected pairs.
pub(crate) fn upsert_pairs<'a>(
    db: &'a PgPool,
    sql: &'static str,
) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
    Box::pin(async move {
        let result = sqlx::query(sql).execute(db).await?;
        Ok(result.rows_affected())
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    static FIRST_CALLED: AtomicBool = AtomicBool::new(false);
    static SECOND_CALLED: AtomicBool = AtomicBool::new(false);

    fn failing(_db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
        Box::pin(async {
            FIRST_CALLED.store(true, Ordering::SeqCst);
            Err(sqlx::Error::RowNotFound)
        })
    }

    fn succeeding(_db: &PgPool) -> BoxFuture<'_, Result<u64, sqlx::Error>> {
        Box::pin(async {
            SECOND_CALLED.store(true, Ordering::SeqCst);
            Ok(1)
        })
    }

    #[tokio::test]
    async fn run_links_is_best_effort() {
        // connect_lazy never touches the network; the fakes ignore it.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://inventory@localhost/inventory")
            .unwrap();
        let links: &[(&str, LinkFn)] = &[("first", failing), ("second", succeeding)];
        let failed = run_links(&pool, links).await;
        assert!(FIRST_CALLED.load(Ordering::SeqCst));
        assert!(SECOND_CALLED.load(Ordering::SeqCst));
        assert_eq!(failed, 1);
    }
}
