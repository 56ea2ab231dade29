//! ECOHO data layer
//!
//! Logs one market snapshot, then streams new block headers until shutdown

use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ecoho_block_feed::{FeedCallbacks, FeedExit};
use ecoho_core::DataLayerConfig;
use ecoho_data_node::DataLayerService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting ECOHO data layer v{}", env!("CARGO_PKG_VERSION"));

    let config = DataLayerConfig::load()?;
    info!("Configuration: {}", config.digest());

    let service = DataLayerService::from_config(&config)?;

    let snapshot = service.market_snapshot().await;
    for (source, detail) in &snapshot.errors {
        warn!(%source, kind = %detail.kind, "Source unavailable: {}", detail.message);
    }
    info!("Market snapshot: {}", serde_json::to_string_pretty(&snapshot)?);

    // Setup shutdown channel
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install signal handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C");
            }
            _ = terminate => {
                info!("Received termination signal");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let callbacks = FeedCallbacks::new()
        .on_state_change(|state| info!(%state, "Block feed state"))
        .on_block(|block| info!(number = block.number, hash = %block.hash_hex(), "New block"))
        .on_error(|detail| warn!(kind = %detail.kind, "Block feed error: {}", detail.message));

    info!("Press Ctrl+C to shutdown");

    match service.run_block_feed(callbacks, shutdown_rx).await {
        FeedExit::Shutdown => {}
        FeedExit::GaveUp { attempts, last_error } => {
            error!(attempts, ?last_error, "Block feed stopped after retries");
        }
        FeedExit::Fatal(detail) => {
            error!("Block feed not started: {}", detail);
        }
    }

    info!(uptime = ?service.uptime(), "Shutdown complete");
    Ok(())
}
