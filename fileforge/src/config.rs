//! Application configuration loaded from environment variables.
//!
//! `main` loads a `.env` file (if present) via `dotenvy` before calling
//! [`AppConfig::from_env`]. Unset variables fall back to defaults; set but
//! unparseable variables are a startup error.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::admission::RateLimiterConfig;
use crate::api::server::ApiServerConfig;
use crate::jobs::{JobStoreConfig, OrchestratorConfig, PurgeConfig};
use crate::logging::LogFormat;
use crate::storage::StorageConfig;
use crate::sweeper::RetentionConfig;
use crate::{Error, Result};

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api: ApiServerConfig,
    pub rate_limit: RateLimiterConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub orchestrator: OrchestratorConfig,
    pub job_store: JobStoreConfig,
    pub purge: PurgeConfig,
    pub log_dir: PathBuf,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiServerConfig::default(),
            rate_limit: RateLimiterConfig::default(),
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            job_store: JobStoreConfig::default(),
            purge: PurgeConfig::default(),
            log_dir: PathBuf::from("./logs"),
            log_format: LogFormat::default(),
        }
    }
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let mut api = defaults.api.clone();
        if let Some(bind_address) = env.string("API_BIND_ADDRESS") {
            api.bind_address = bind_address;
        }
        api.port = env.parse("API_PORT", api.port)?;
        api.body_limit = env
            .parse("API_BODY_LIMIT_MB", api.body_limit / (1024 * 1024))?
            .saturating_mul(1024 * 1024);
        api.enable_cors = env.parse("API_ENABLE_CORS", api.enable_cors)?;

        let rate_limit = RateLimiterConfig {
            max_requests: env.parse(
                "RATE_LIMIT_REQUESTS_PER_MINUTE",
                defaults.rate_limit.max_requests,
            )?,
            window_ms: env.parse("RATE_LIMIT_WINDOW_MS", defaults.rate_limit.window_ms)?,
            max_clients: env.parse("RATE_LIMIT_MAX_CLIENTS", defaults.rate_limit.max_clients)?,
            eviction_interval_ms: defaults.rate_limit.eviction_interval_ms,
        };

        let storage = StorageConfig::new(
            env.string("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage.upload_dir),
            env.string("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage.output_dir),
        );

        let retention = RetentionConfig {
            input_cleanup_delay: env.secs(
                "INPUT_CLEANUP_DELAY_SECS",
                defaults.retention.input_cleanup_delay,
            )?,
            output_ttl: env.secs("OUTPUT_TTL_SECS", defaults.retention.output_ttl)?,
            download_cleanup_delay: env.secs(
                "DOWNLOAD_CLEANUP_DELAY_SECS",
                defaults.retention.download_cleanup_delay,
            )?,
            drain_on_shutdown: env.parse(
                "SWEEPER_DRAIN_ON_SHUTDOWN",
                defaults.retention.drain_on_shutdown,
            )?,
        };

        let max_concurrent_jobs = env.parse(
            "MAX_CONCURRENT_JOBS",
            defaults.orchestrator.max_concurrent_jobs,
        )?;
        if max_concurrent_jobs == 0 {
            return Err(Error::config("MAX_CONCURRENT_JOBS must be at least 1"));
        }
        let default_timeout = defaults
            .orchestrator
            .job_timeout
            .map(|t| t.as_secs())
            .unwrap_or(0);
        let timeout_secs: u64 = env.parse("JOB_TIMEOUT_SECS", default_timeout)?;
        let orchestrator = OrchestratorConfig {
            max_concurrent_jobs,
            job_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        };

        let job_store = JobStoreConfig {
            max_jobs: env.parse("MAX_RETAINED_JOBS", defaults.job_store.max_jobs)?,
        };
        let purge = PurgeConfig::new()
            .with_retention_secs(env.parse("JOB_RETENTION_SECS", defaults.purge.retention_secs)?)
            .with_check_interval_secs(defaults.purge.check_interval_secs);

        Ok(Self {
            api,
            rate_limit,
            storage,
            retention,
            orchestrator,
            job_store,
            purge,
            log_dir: env
                .string("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            log_format: env
                .string("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or_default(),
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty, trimmed value.
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::config(format!("Invalid value for {}: '{}' ({})", name, raw, e))),
        }
    }

    fn secs(&self, name: &str, default: Duration) -> Result<Duration> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }
}
