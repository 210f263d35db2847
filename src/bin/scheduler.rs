// Feed the scheduled-task registry to the broker's timer loop.
use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::fmt::format::FmtSpan;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,inventory=debug".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let config = Arc::new(inventory::Config::load()?);
    let db = inventory::db::connect(&config.database).await?;
    let broker = inventory::queue::Broker::new(db.clone(), &config.queue)?;

    // Populates the scheduled-task registry the timer reads from.
    inventory::assemble();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = inventory::Context::new(db, broker, config);
    let scheduler_handle = tokio::spawn(inventory::queue::scheduler::run(ctx, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    Ok(())
}
