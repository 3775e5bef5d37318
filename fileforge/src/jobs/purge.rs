//! Job Purge Service for automatic cleanup of old completed/failed jobs.
//!
//! Terminal jobs stay queryable for the retention period, then this service
//! drops them from the [`JobStore`]. Their artifacts are handled separately
//! by the retention sweeper.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::store::JobStore;

/// Configuration for job purging.
#[derive(Debug, Clone)]
pub struct PurgeConfig {
    /// Seconds a terminal job is retained after its last update.
    /// Set to 0 to retain jobs until the store cap evicts them.
    pub retention_secs: u64,

    /// Interval between purge checks in seconds.
    pub check_interval_secs: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            retention_secs: 24 * 60 * 60,
            check_interval_secs: 300,
        }
    }
}

impl PurgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }
}

/// Job Purge Service for automatic cleanup of old jobs.
pub struct JobPurgeService {
    config: PurgeConfig,
    job_store: Arc<JobStore>,
}

impl JobPurgeService {
    pub fn new(config: PurgeConfig, job_store: Arc<JobStore>) -> Self {
        Self { config, job_store }
    }

    /// Run a single purge pass. Returns the number of jobs removed.
    pub fn run_purge(&self) -> usize {
        if self.config.retention_secs == 0 {
            debug!("Job purging disabled (retention_secs = 0)");
            return 0;
        }

        let retention = chrono::Duration::seconds(
            i64::try_from(self.config.retention_secs).unwrap_or(i64::MAX / 1000),
        );
        let cutoff = Utc::now() - retention;
        let removed = self.job_store.evict_terminal_older_than(cutoff);

        if removed > 0 {
            info!(
                "Purged {} old jobs (retention: {}s)",
                removed, self.config.retention_secs
            );
        } else {
            debug!("No jobs to purge");
        }
        removed
    }

    /// Start the background purge task.
    pub fn start_background_task(
        self: &Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);

        tokio::spawn(async move {
            let period = Duration::from_secs(service.config.check_interval_secs.max(1));
            let mut check_interval = interval(period);
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                "Job purge service started (retention: {}s, interval: {}s)",
                service.config.retention_secs,
                period.as_secs()
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Job purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        service.run_purge();
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &PurgeConfig {
        &self.config
    }
}
