//! Service container for dependency injection.
//!
//! The ServiceContainer builds every service from an [`AppConfig`], owns the
//! shared cancellation token and manages background task lifecycle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::admission::RateLimiter;
use crate::api::server::AppState;
use crate::config::AppConfig;
use crate::engine::{BuiltinEngine, ConversionEngine};
use crate::jobs::{ConversionOrchestrator, JobPurgeService, JobStore};
use crate::logging::LoggingConfig;
use crate::storage::ArtifactStore;
use crate::sweeper::{RetentionSweeper, sweep_stale_dir};

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all application services.
pub struct ServiceContainer {
    pub config: AppConfig,
    pub rate_limiter: Arc<RateLimiter>,
    pub job_store: Arc<JobStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub sweeper: Arc<RetentionSweeper>,
    pub orchestrator: Arc<ConversionOrchestrator>,
    pub purge_service: Arc<JobPurgeService>,
    /// Set once logging is initialized; absent in tests.
    pub logging_config: Option<Arc<LoggingConfig>>,
    start_time: Instant,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create a container with the built-in conversion engine.
    pub async fn new(config: AppConfig) -> Result<Self> {
        Self::with_engine(config, Arc::new(BuiltinEngine::new())).await
    }

    /// Create a container with a custom conversion engine.
    pub async fn with_engine(config: AppConfig, engine: Arc<dyn ConversionEngine>) -> Result<Self> {
        info!("Initializing service container");

        let artifacts = Arc::new(ArtifactStore::new(config.storage.clone()));
        artifacts.init().await?;

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let job_store = Arc::new(JobStore::new(config.job_store.clone()));
        let sweeper = Arc::new(RetentionSweeper::new());
        let orchestrator = Arc::new(ConversionOrchestrator::new(
            config.orchestrator.clone(),
            config.retention.clone(),
            job_store.clone(),
            engine,
            artifacts.clone(),
            sweeper.clone(),
        ));
        let purge_service = Arc::new(JobPurgeService::new(config.purge.clone(), job_store.clone()));

        info!("Service container initialized");

        Ok(Self {
            config,
            rate_limiter,
            job_store,
            artifacts,
            sweeper,
            orchestrator,
            purge_service,
            logging_config: None,
            start_time: Instant::now(),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn with_logging_config(mut self, logging_config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(logging_config);
        self
    }

    /// Clean up leftovers from a previous run and start background tasks.
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing services");

        let retention = &self.config.retention;
        let stale_inputs =
            sweep_stale_dir(self.artifacts.upload_dir(), retention.input_cleanup_delay).await?;
        let stale_outputs =
            sweep_stale_dir(self.artifacts.output_dir(), retention.output_ttl).await?;
        if stale_inputs + stale_outputs > 0 {
            info!(
                inputs = stale_inputs,
                outputs = stale_outputs,
                "Removed artifacts left by a previous run"
            );
        }

        let token = self.cancellation_token.clone();
        self.sweeper.start(token.clone());
        self.rate_limiter.start_eviction_task(token.clone());
        self.purge_service.start_background_task(token.clone());
        if let Some(logging) = &self.logging_config {
            logging.start_retention_cleanup(token);
        }

        info!("Services initialized");
        Ok(())
    }

    /// State shared with the HTTP handlers.
    pub fn app_state(&self) -> AppState {
        AppState {
            start_time: self.start_time,
            rate_limiter: self.rate_limiter.clone(),
            job_store: self.job_store.clone(),
            artifacts: self.artifacts.clone(),
            sweeper: self.sweeper.clone(),
            orchestrator: self.orchestrator.clone(),
            retention: self.config.retention.clone(),
            logging_config: self.logging_config.clone(),
        }
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    ///
    /// Running conversions get `timeout` to finish. Pending artifact deletions
    /// are then executed immediately unless draining is disabled, in which
    /// case the next startup sweep collects them.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        self.orchestrator.shutdown(timeout).await;
        self.cancellation_token.cancel();

        if self.config.retention.drain_on_shutdown {
            self.sweeper.drain().await;
        } else if self.sweeper.pending() > 0 {
            warn!(
                pending = self.sweeper.pending(),
                "Leaving pending artifact deletions for the next startup sweep"
            );
        }

        info!("Services shut down");
        Ok(())
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
