//! osnet - correlated request/reply transport with remote byte streams.
//!
//! Serves the osnet protocol over TCP, plus an optional Prometheus endpoint.

use osnet_server::metrics::run_metrics_server;
use osnet_server::{Config, Metrics, Server, StreamRegistry};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// How long live sessions get to receive their shutdown notice.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Defaults, then OSNET_CONFIG if set, then env overrides
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var("OSNET_CONFIG") {
        tracing::info!("Loaded config from {}", path);
    }

    tracing::info!("Starting osnet server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Idle timeout: {}s", config.network.idle_timeout_secs);
    match config.streams.root_dir {
        Some(ref root) => {
            std::fs::create_dir_all(root)?;
            tracing::info!("  Stream root: {}", root.display());
        }
        None => tracing::info!("  Stream root: none (file: locators disabled)"),
    }
    tracing::info!(
        "  Handles per session: {}, read chunk: {} bytes",
        config.streams.max_handles_per_session,
        config.streams.max_read_chunk
    );

    let (metrics_shutdown, _) = broadcast::channel(1);
    let mut server_config = config.server_config();
    let mut registry = StreamRegistry::new(config.streams.clone());

    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        registry = registry.with_metrics(metrics.clone());

        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config, Arc::new(registry)));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown
    server.run().await?;

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while server.stats().connections_active.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            "{} connections still open after {:?}",
            server.stats().connections_active.load(Ordering::Relaxed),
            SHUTDOWN_GRACE
        );
    }

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
