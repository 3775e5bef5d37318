//! Conversion orchestration.
//!
//! Each accepted request becomes one supervised background task:
//!
//! 1. wait for a concurrency permit (the job stays `pending` meanwhile);
//! 2. run the pipeline (read input, convert, persist outputs) in a child
//!    task, bounded by the job timeout;
//! 3. record the outcome on the job. A pipeline error, timeout or panic all
//!    end in `failed`, so no job is left `processing` forever;
//! 4. schedule deletion of the input and, on failure, of any outputs.
//!
//! The input is leased from the sweeper for the whole life of the job, so a
//! deletion scheduled at upload time cannot remove it while the job waits.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::model::{Job, JobStatus, JobUpdate, ResultFile};
use super::store::JobStore;
use crate::engine::{ConversionEngine, EngineRequest};
use crate::storage::ArtifactStore;
use crate::sweeper::{ArtifactLease, RetentionConfig, RetentionSweeper};
use crate::utils::filename::{file_extension, output_file_name};
use crate::{Error, Result};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum jobs in the processing phase at once.
    pub max_concurrent_jobs: usize,
    /// Limit on a single job's processing phase. `None` disables it.
    pub job_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            job_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Window for blocking writes of an aborted pipeline to land before its
/// outputs are swept again.
const LATE_WRITE_GRACE: Duration = Duration::from_secs(5);

/// A conversion to run.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Location of the uploaded input.
    pub input_path: PathBuf,
    /// Client-supplied name of the input.
    pub source_name: String,
    pub conversion_type: String,
    pub options: Option<serde_json::Value>,
}

/// Drives jobs from `pending` to a terminal state.
pub struct ConversionOrchestrator {
    config: OrchestratorConfig,
    retention: RetentionConfig,
    job_store: Arc<JobStore>,
    engine: Arc<dyn ConversionEngine>,
    artifacts: Arc<ArtifactStore>,
    sweeper: Arc<RetentionSweeper>,
    semaphore: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl ConversionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        retention: RetentionConfig,
        job_store: Arc<JobStore>,
        engine: Arc<dyn ConversionEngine>,
        artifacts: Arc<ArtifactStore>,
        sweeper: Arc<RetentionSweeper>,
    ) -> Self {
        let permits = config.max_concurrent_jobs.max(1);
        Self {
            config,
            retention,
            job_store,
            engine,
            artifacts,
            sweeper,
            semaphore: Arc::new(Semaphore::new(permits)),
            tasks: TaskTracker::new(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ConversionEngine> {
        &self.engine
    }

    /// Number of supervised jobs not yet finished.
    pub fn active_jobs(&self) -> usize {
        self.tasks.len()
    }

    /// Register a new job and start it in the background.
    ///
    /// Returns the initial snapshot and a handle resolving to the job's final
    /// status. Dropping the handle does not affect the job.
    pub fn submit(
        self: &Arc<Self>,
        request: ConversionRequest,
    ) -> Result<(Job, JoinHandle<JobStatus>)> {
        if self.tasks.is_closed() {
            return Err(Error::Unavailable(
                "Conversion service is shutting down".to_string(),
            ));
        }

        let job = self.job_store.insert(
            Job::new(Uuid::new_v4().to_string())
                .with_conversion_type(&request.conversion_type)
                .with_source_name(&request.source_name),
        )?;

        info!(
            job_id = %job.id,
            conversion_type = %request.conversion_type,
            "Conversion job accepted"
        );

        let lease = self.sweeper.lease(&request.input_path);
        let orchestrator = Arc::clone(self);
        let job_id = job.id.clone();
        let handle = self
            .tasks
            .spawn(async move { orchestrator.supervise(job_id, request, lease).await });
        Ok((job, handle))
    }

    /// Stop accepting jobs and wait up to `grace` for running ones.
    ///
    /// Jobs still waiting for a permit fail immediately.
    pub async fn shutdown(&self, grace: Duration) {
        self.tasks.close();
        self.semaphore.close();

        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Timed out waiting for conversion jobs to finish"
            );
        }
    }

    async fn supervise(
        self: Arc<Self>,
        job_id: String,
        request: ConversionRequest,
        input_lease: ArtifactLease,
    ) -> JobStatus {
        let input_path = request.input_path.clone();
        let outcome = self.execute(&job_id, request).await;

        match outcome {
            Ok(files) => self.finish_completed(&job_id, files),
            Err(message) => self.finish_failed(&job_id, message),
        }

        drop(input_lease);
        self.sweeper
            .schedule_delete(input_path, self.retention.input_cleanup_delay);

        self.job_store
            .get_job(&job_id)
            .map(|job| job.status)
            .unwrap_or(JobStatus::Failed)
    }

    /// Run the pipeline under the concurrency limit, timeout and panic guard.
    async fn execute(
        self: &Arc<Self>,
        job_id: &str,
        request: ConversionRequest,
    ) -> std::result::Result<Vec<ResultFile>, String> {
        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| "Conversion service is shutting down".to_string())?;

        let orchestrator = Arc::clone(self);
        let id = job_id.to_string();
        let mut pipeline =
            tokio::spawn(async move { orchestrator.run_pipeline(&id, request).await });

        let joined = match self.config.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut pipeline).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(job_id = %job_id, timeout_ms = limit.as_millis() as u64, "Conversion timed out");
                    // Keep the permit until the task is gone.
                    pipeline.abort();
                    let _ = pipeline.await;
                    self.sweeper.schedule_prefix_delete(
                        self.artifacts.output_dir(),
                        self.artifacts.output_prefix(job_id),
                        LATE_WRITE_GRACE,
                    );
                    return Err(format!("Conversion timed out after {}", format_limit(limit)));
                }
            },
            None => pipeline.await,
        };

        match joined {
            Ok(Ok(files)) => Ok(files),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(job_id = %job_id, panic = %message, "Conversion task panicked");
                Err(format!("Conversion task panicked: {}", message))
            }
            Err(e) => Err(format!("Conversion task was cancelled: {}", e)),
        }
    }

    async fn run_pipeline(&self, job_id: &str, request: ConversionRequest) -> Result<Vec<ResultFile>> {
        self.report(job_id, 10, "Reading input");
        let data = self.artifacts.read(&request.input_path).await.map_err(|e| {
            warn!(job_id = %job_id, error = %e, "Failed to read conversion input");
            if e.is_missing_file() {
                Error::conversion("Input file not found")
            } else {
                Error::conversion("Failed to read input file")
            }
        })?;

        self.report(job_id, 30, "Converting");
        let outputs = self
            .engine
            .convert(EngineRequest {
                conversion_type: request.conversion_type,
                input_extension: file_extension(&request.source_name),
                source_name: request.source_name.clone(),
                data,
                options: request.options,
            })
            .await?;
        if outputs.is_empty() {
            return Err(Error::conversion("Conversion produced no output"));
        }

        self.report(job_id, 80, "Preparing output");
        let total = outputs.len();
        let mut files = Vec::with_capacity(total);
        for (index, output) in outputs.into_iter().enumerate() {
            let path = self.artifacts.output_path(job_id, index, &output.extension);
            self.artifacts
                .write_new(&path, &output.data)
                .await
                .map_err(|e| {
                    warn!(job_id = %job_id, error = %e, "Failed to store conversion output");
                    Error::conversion("Failed to store conversion output")
                })?;
            files.push(ResultFile {
                path,
                file_name: output_file_name(&request.source_name, &output.extension, index, total),
                size: output.data.len() as u64,
            });
        }
        Ok(files)
    }

    fn report(&self, job_id: &str, progress: u8, message: &str) {
        // Rejections are logged by the store; the pipeline carries on.
        let _ = self
            .job_store
            .update_job(job_id, JobUpdate::processing(progress, message));
    }

    fn finish_completed(&self, job_id: &str, files: Vec<ResultFile>) {
        let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
        let delay = match self.job_store.update_job(job_id, JobUpdate::completed(files)) {
            Ok(_) => {
                info!(job_id = %job_id, outputs = paths.len(), "Conversion completed");
                self.retention.output_ttl
            }
            // Nobody can download these.
            Err(_) => Duration::ZERO,
        };
        for path in paths {
            self.sweeper.schedule_delete(path, delay);
        }
    }

    fn finish_failed(&self, job_id: &str, message: String) {
        warn!(job_id = %job_id, error = %message, "Conversion failed");
        let _ = self.job_store.update_job(job_id, JobUpdate::failed(message));

        // Partial outputs are never downloadable.
        self.sweeper.schedule_prefix_delete(
            self.artifacts.output_dir(),
            self.artifacts.output_prefix(job_id),
            Duration::ZERO,
        );
    }
}

/// `12s`, or `250ms` below one second.
fn format_limit(limit: Duration) -> String {
    if limit.as_secs() == 0 {
        format!("{}ms", limit.as_millis())
    } else {
        format!("{}s", limit.as_secs())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BuiltinEngine, ConvertedFile};
    use crate::storage::StorageConfig;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        store: Arc<JobStore>,
        artifacts: Arc<ArtifactStore>,
        sweeper: Arc<RetentionSweeper>,
        orchestrator: Arc<ConversionOrchestrator>,
    }

    async fn harness(engine: Arc<dyn ConversionEngine>, config: OrchestratorConfig) -> Harness {
        harness_with_retention(engine, config, RetentionConfig::default()).await
    }

    async fn harness_with_retention(
        engine: Arc<dyn ConversionEngine>,
        config: OrchestratorConfig,
        retention: RetentionConfig,
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let artifacts = Arc::new(ArtifactStore::new(StorageConfig::new(
            dir.path().join("uploads"),
            dir.path().join("outputs"),
        )));
        artifacts.init().await.unwrap();
        let store = Arc::new(JobStore::default());
        let sweeper = Arc::new(RetentionSweeper::new());
        let orchestrator = Arc::new(ConversionOrchestrator::new(
            config,
            retention,
            store.clone(),
            engine,
            artifacts.clone(),
            sweeper.clone(),
        ));
        Harness {
            _dir: dir,
            store,
            artifacts,
            sweeper,
            orchestrator,
        }
    }

    async fn upload(h: &Harness, data: &[u8], conversion_type: &str) -> ConversionRequest {
        let (_, input_path) = h.artifacts.save_upload(data).await.unwrap();
        ConversionRequest {
            input_path,
            source_name: "input.txt".to_string(),
            conversion_type: conversion_type.to_string(),
            options: None,
        }
    }

    struct PanickingEngine;

    #[async_trait]
    impl ConversionEngine for PanickingEngine {
        fn conversion_types(&self) -> Vec<&'static str> {
            vec!["explode"]
        }

        async fn convert(&self, _request: EngineRequest) -> Result<Vec<ConvertedFile>> {
            panic!("engine blew up");
        }
    }

    /// Echoes the input after `delay`.
    struct DelayEngine {
        delay: Duration,
    }

    #[async_trait]
    impl ConversionEngine for DelayEngine {
        fn conversion_types(&self) -> Vec<&'static str> {
            vec!["echo"]
        }

        async fn convert(&self, request: EngineRequest) -> Result<Vec<ConvertedFile>> {
            tokio::time::sleep(self.delay).await;
            Ok(vec![ConvertedFile::new(request.data, "txt")])
        }
    }

    /// Flags when a conversion future is dropped.
    struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct HangingEngine {
        dropped: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl ConversionEngine for HangingEngine {
        fn conversion_types(&self) -> Vec<&'static str> {
            vec!["hang"]
        }

        async fn convert(&self, _request: EngineRequest) -> Result<Vec<ConvertedFile>> {
            let _flag = DropFlag(self.dropped.clone());
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }
    }

    struct SlowEngine;

    #[async_trait]
    impl ConversionEngine for SlowEngine {
        fn conversion_types(&self) -> Vec<&'static str> {
            vec!["slow"]
        }

        async fn convert(&self, _request: EngineRequest) -> Result<Vec<ConvertedFile>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![ConvertedFile::new(b"late".to_vec(), "txt")])
        }
    }

    #[tokio::test]
    async fn test_successful_conversion() {
        let h = harness(Arc::new(BuiltinEngine::new()), OrchestratorConfig::default()).await;
        let request = upload(&h, b"hello world", "gzip").await;
        let input_path = request.input_path.clone();

        let (job, handle) = h.orchestrator.submit(request).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(handle.await.unwrap(), JobStatus::Completed);
        assert_eq!(h.orchestrator.active_jobs(), 0);

        let job = h.store.get_job(&job.id).unwrap();
        assert_eq!(job.progress, 100);
        assert_eq!(job.result_files.len(), 1);
        assert_eq!(job.result_files[0].file_name, "input.gz");
        assert!(job.result_files[0].path.exists());

        // Input and output deletions are both queued.
        assert_eq!(h.sweeper.pending(), 2);
        assert!(input_path.exists());
        h.sweeper.drain().await;
        assert!(!input_path.exists());
    }

    #[tokio::test]
    async fn test_missing_input_fails_job() {
        let h = harness(Arc::new(BuiltinEngine::new()), OrchestratorConfig::default()).await;
        let request = ConversionRequest {
            input_path: h.artifacts.upload_dir().join(Uuid::new_v4().to_string()),
            source_name: "ghost.txt".to_string(),
            conversion_type: "gzip".to_string(),
            options: None,
        };

        let (job, handle) = h.orchestrator.submit(request).unwrap();
        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        let job = h.store.get_job(&job.id).unwrap();
        assert_eq!(job.error.as_deref(), Some("Input file not found"));
        assert!(job.result_files.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_type_fails_with_engine_message() {
        let h = harness(Arc::new(BuiltinEngine::new()), OrchestratorConfig::default()).await;
        let request = upload(&h, b"data", "pdf-to-docx").await;

        let (job, handle) = h.orchestrator.submit(request).unwrap();
        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        assert_eq!(
            h.store.get_job(&job.id).unwrap().error.as_deref(),
            Some("Unsupported conversion type: pdf-to-docx")
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let h = harness(Arc::new(PanickingEngine), OrchestratorConfig::default()).await;
        let request = upload(&h, b"data", "explode").await;

        let (job, handle) = h.orchestrator.submit(request).unwrap();
        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        let error = h.store.get_job(&job.id).unwrap().error.unwrap();
        assert_eq!(error, "Conversion task panicked: engine blew up");
    }

    #[tokio::test]
    async fn test_timeout_becomes_failure() {
        let config = OrchestratorConfig {
            max_concurrent_jobs: 1,
            job_timeout: Some(Duration::from_millis(50)),
        };
        let h = harness(Arc::new(SlowEngine), config).await;
        let request = upload(&h, b"data", "slow").await;

        let (job, handle) = h.orchestrator.submit(request).unwrap();
        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        let job = h.store.get_job(&job.id).unwrap();
        assert_eq!(job.error.as_deref(), Some("Conversion timed out after 50ms"));
        assert!(job.progress >= 30);
    }

    #[test]
    fn test_timeout_message_precision() {
        assert_eq!(format_limit(Duration::from_millis(250)), "250ms");
        assert_eq!(format_limit(Duration::from_secs(600)), "600s");
        assert_eq!(format_limit(Duration::from_millis(1500)), "1s");
    }

    #[tokio::test]
    async fn test_timed_out_task_is_gone_before_job_fails() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let config = OrchestratorConfig {
            max_concurrent_jobs: 1,
            job_timeout: Some(Duration::from_millis(50)),
        };
        let h = harness(
            Arc::new(HangingEngine {
                dropped: dropped.clone(),
            }),
            config,
        )
        .await;

        let (job, handle) = h.orchestrator.submit(upload(&h, b"data", "hang").await).unwrap();
        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(h.orchestrator.semaphore.available_permits(), 1);

        // An output that lands after the job failed is still collected.
        let late = h.artifacts.output_path(&job.id, 0, "txt");
        tokio::fs::write(&late, b"late").await.unwrap();
        h.sweeper.drain().await;
        assert!(!late.exists());
    }

    #[tokio::test]
    async fn test_queued_job_keeps_its_input() {
        let config = OrchestratorConfig {
            max_concurrent_jobs: 1,
            job_timeout: None,
        };
        let retention = RetentionConfig {
            input_cleanup_delay: Duration::from_millis(100),
            ..RetentionConfig::default()
        };
        let h = harness_with_retention(
            Arc::new(DelayEngine {
                delay: Duration::from_millis(300),
            }),
            config,
            retention.clone(),
        )
        .await;
        let token = tokio_util::sync::CancellationToken::new();
        h.sweeper.start(token.clone());

        let first = upload(&h, b"first", "echo").await;
        let second = upload(&h, b"second", "echo").await;
        // Deletion as scheduled by the upload handler.
        h.sweeper
            .schedule_delete(&first.input_path, retention.input_cleanup_delay);
        h.sweeper
            .schedule_delete(&second.input_path, retention.input_cleanup_delay);

        let (_, first_handle) = h.orchestrator.submit(first).unwrap();
        let (second_job, second_handle) = h.orchestrator.submit(second).unwrap();

        assert_eq!(first_handle.await.unwrap(), JobStatus::Completed);
        assert_eq!(second_handle.await.unwrap(), JobStatus::Completed);
        let job = h.store.get_job(&second_job.id).unwrap();
        assert!(job.error.is_none());
        assert_eq!(h.artifacts.read(&job.result_files[0].path).await.unwrap(), b"second");

        token.cancel();
    }

    #[tokio::test]
    async fn test_unreadable_input_fails_job() {
        let h = harness(Arc::new(BuiltinEngine::new()), OrchestratorConfig::default()).await;
        let input_path = h.artifacts.upload_dir().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir(&input_path).await.unwrap();
        let request = ConversionRequest {
            input_path: input_path.clone(),
            source_name: "folder".to_string(),
            conversion_type: "gzip".to_string(),
            options: None,
        };

        let (job, handle) = h.orchestrator.submit(request).unwrap();
        assert_eq!(handle.await.unwrap(), JobStatus::Failed);
        let job = h.store.get_job(&job.id).unwrap();
        assert_eq!(job.error.as_deref(), Some("Failed to read input file"));

        // Input deletion and the partial output sweep.
        assert!(!h.sweeper.is_leased(&input_path));
        assert_eq!(h.sweeper.pending(), 2);
    }

    #[tokio::test]
    async fn test_output_write_failure_fails_job() {
        let h = harness(Arc::new(BuiltinEngine::new()), OrchestratorConfig::default()).await;
        let output_dir = h.artifacts.output_dir().to_path_buf();
        tokio::fs::remove_dir(&output_dir).await.unwrap();
        tokio::fs::write(&output_dir, b"not a directory").await.unwrap();

        let request = upload(&h, b"hello", "gzip").await;
        let input_path = request.input_path.clone();
        let (job, handle) = h.orchestrator.submit(request).unwrap();
        assert_eq!(handle.await.unwrap(), JobStatus::Failed);

        let job = h.store.get_job(&job.id).unwrap();
        assert_eq!(job.error.as_deref(), Some("Failed to store conversion output"));
        assert!(job.result_files.is_empty());

        assert!(!h.sweeper.is_leased(&input_path));
        assert_eq!(h.sweeper.pending(), 2);
        h.sweeper.drain().await;
        assert!(!input_path.exists());
    }

    #[tokio::test]
    async fn test_concurrency_limit_keeps_jobs_pending() {
        let config = OrchestratorConfig {
            max_concurrent_jobs: 1,
            job_timeout: Some(Duration::from_millis(200)),
        };
        let h = harness(Arc::new(SlowEngine), config).await;

        let (first, first_handle) = h.orchestrator.submit(upload(&h, b"a", "slow").await).unwrap();
        let (second, second_handle) = h.orchestrator.submit(upload(&h, b"b", "slow").await).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.store.get_job(&first.id).unwrap().status, JobStatus::Processing);
        assert_eq!(h.store.get_job(&second.id).unwrap().status, JobStatus::Pending);

        first_handle.await.unwrap();
        second_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs() {
        let h = harness(Arc::new(BuiltinEngine::new()), OrchestratorConfig::default()).await;
        h.orchestrator.shutdown(Duration::from_secs(1)).await;

        let request = upload(&h, b"data", "gzip").await;
        assert!(matches!(
            h.orchestrator.submit(request),
            Err(Error::Unavailable(_))
        ));
    }
}
