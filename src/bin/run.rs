// Start the worker: assemble registries, build client sets, then drain
// the queue and serve metrics until interrupted.
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

    inventory::assemble();

    let accounts = inventory::aws::clients::configure(&config.aws).await;
    tracing::info!(accounts, "AWS client sets ready");
    if let Err(err) = inventory::gcp::clients::configure(&config.gcp).await {
        tracing::warn!("GCP client set not configured: {}", err);
    }
    if let Some(gardener) = &config.gardener {
        let token_source = inventory::gcp::api::TokenSource::from_config(&config.gcp);
        inventory::gardener::configure(gardener, db.clone(), token_source).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(vault) = &config.vault {
        let vault = Arc::new(inventory::vault::Client::new(vault)?);
        vault.start(shutdown_rx.clone()).await?;
    }

    let metrics_address = config.metrics.address.clone();
    let metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(err) = inventory::metrics::serve(&metrics_address, metrics_shutdown).await {
            tracing::warn!("metrics endpoint failed: {}", err);
        }
    });

    let ctx = inventory::Context::new(db, broker, Arc::clone(&config));
    let worker = inventory::queue::Worker::new(ctx)?;
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = worker_handle.await;
    Ok(())
}
