//! Periodic reconciliation of on-disk content against the release cache.
//!
//! Evicting or expiring a release mapping does not touch its directory, so
//! content for releases nobody can reach anymore accumulates under the base
//! path. The janitor removes it on a fixed interval.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::service::ContentService;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub interval: Duration,
    /// Minimum directory age before it is eligible for removal.
    pub grace: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            grace: Duration::from_secs(600),
        }
    }
}

pub struct Janitor {
    content: ContentService,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(content: ContentService, config: JanitorConfig) -> Self {
        Self { content, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            grace_secs = self.config.grace.as_secs(),
            "Starting content janitor"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Content janitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconciliation pass. Returns the number of directories removed.
    pub async fn run_once(&self) -> usize {
        match self.content.prune_orphans(self.config.grace).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "Pruned orphaned content directories");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "Failed to prune orphaned content");
                0
            }
        }
    }
}
