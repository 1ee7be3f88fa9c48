use crate::coordinator::{LaggingBackendPolicy, UploadCoordinator};
use crate::stats::StatsSummary;
use blobkeep_core::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub idle_sleep: Duration,
    pub max_idle_sleep: Duration,
    pub stats_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_secs(5),
            max_idle_sleep: Duration::from_secs(60),
            stats_interval: Duration::from_secs(60),
        }
    }
}

/// Long-running loop over every changeset with claimable work.
///
/// Any number of workers, in any number of processes, may share a manifest.
pub struct Worker {
    id: String,
    coordinator: Arc<UploadCoordinator>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(id: impl Into<String>, coordinator: Arc<UploadCoordinator>, config: WorkerConfig) -> Self {
        Self {
            id: id.into(),
            coordinator,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> StatsSummary {
        info!(worker = %self.id, "Worker started");
        let mut idle = self.config.idle_sleep;
        let mut last_stats = Instant::now();

        while !*shutdown.borrow() {
            let sleep_for = match self.tick().await {
                Ok(0) => {
                    let current = idle;
                    idle = (idle * 2).min(self.config.max_idle_sleep);
                    current
                }
                Ok(claimed) => {
                    debug!(worker = %self.id, claimed, "Worked a round");
                    idle = self.config.idle_sleep;
                    Duration::ZERO
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "Worker round failed");
                    let current = idle;
                    idle = (idle * 2).min(self.config.max_idle_sleep);
                    current
                }
            };

            if last_stats.elapsed() >= self.config.stats_interval {
                info!(worker = %self.id, stats = %self.coordinator.stats().summary(), "Worker stats");
                last_stats = Instant::now();
            }

            if sleep_for.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let summary = self.coordinator.stats().summary();
        info!(worker = %self.id, stats = %summary, "Worker stopped");
        summary
    }

    /// One batch from each changeset with work. Returns records claimed.
    async fn tick(&self) -> Result<u64> {
        let manifest = self.coordinator.manifest();
        let mut claimed = 0;
        for changeset_id in manifest.changesets_with_work().await? {
            match self.coordinator.run_batch(&changeset_id).await {
                Ok(report) => claimed += report.claimed,
                Err(Error::StoreContention(reason)) => {
                    debug!(worker = %self.id, reason = %reason, "Another worker holds the claim lock");
                    continue;
                }
                Err(e) => return Err(e),
            }
            manifest.refresh_status(&changeset_id).await?;
        }

        if claimed == 0 && self.coordinator.config().lagging_backends == LaggingBackendPolicy::Automatic {
            let lagging = self.coordinator.retry_lagging_backends(None).await?;
            claimed += lagging.recovered;
        }
        Ok(claimed)
    }
}
