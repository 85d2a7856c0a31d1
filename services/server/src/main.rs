//! bindrop
//!
//! Extracts release binaries from container images and serves them over
//! HTTP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bindrop_server::{
    api, config,
    janitor::{Janitor, JanitorConfig},
    registry::OciRegistry,
    service::ContentService,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to BINDROP_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting bindrop");
    info!(
        listen_addr = %config.listen_addr,
        base_path = %config.base_path.display(),
        cache_capacity = config.cache_capacity.get(),
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "Configuration loaded"
    );

    tokio::fs::create_dir_all(&config.base_path)
        .await
        .with_context(|| format!("creating {}", config.base_path.display()))?;

    let registry = Arc::new(OciRegistry::new(config.registry.clone())?);
    let content = ContentService::new(config.content(), registry);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let janitor_handle = if config.prune_interval.is_zero() {
        info!("Content janitor disabled");
        None
    } else {
        let janitor = Janitor::new(
            content.clone(),
            JanitorConfig {
                interval: config.prune_interval,
                ..JanitorConfig::default()
            },
        );
        let shutdown_rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            janitor.run(shutdown_rx).await;
        }))
    };

    let app = api::create_router(AppState::new(content.clone()));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Some(handle) = janitor_handle {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(10), handle).await {
            warn!(error = %e, "Content janitor did not shut down in time");
        }
    }

    content.close();
    info!("bindrop shutdown complete");
    Ok(())
}
