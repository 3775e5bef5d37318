//! In-memory job registry.
//!
//! Handlers and the orchestrator share one [`JobStore`]. Every mutation goes
//! through [`Job::apply`] while holding the entry's shard lock, so concurrent
//! updates to the same job are serialized and readers always see a
//! consistent snapshot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, warn};

use super::model::{Job, JobStatus, JobUpdate};
use crate::{Error, Result};

/// Default cap on retained jobs.
pub const DEFAULT_MAX_JOBS: usize = 10_000;

/// Job store configuration.
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// Upper bound on jobs held in memory. Oldest terminal jobs are evicted
    /// first when the cap is reached.
    pub max_jobs: usize,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
        }
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Concurrent job registry keyed by job ID.
pub struct JobStore {
    config: JobStoreConfig,
    jobs: DashMap<String, Job>,
}

impl JobStore {
    pub fn new(config: JobStoreConfig) -> Self {
        Self {
            config,
            jobs: DashMap::new(),
        }
    }

    /// Register a new pending job with the given ID.
    pub fn create_job(&self, id: impl Into<String>) -> Result<Job> {
        self.insert(Job::new(id))
    }

    /// Register a prepared job. Job IDs are never reused.
    pub fn insert(&self, job: Job) -> Result<Job> {
        if job.status != JobStatus::Pending {
            return Err(Error::validation("New jobs must start in pending state"));
        }

        // Make room before taking the entry lock; eviction walks every shard.
        if self.jobs.len() >= self.config.max_jobs {
            let excess = self.jobs.len() + 1 - self.config.max_jobs;
            self.evict_oldest_terminal(excess);
            if self.jobs.len() >= self.config.max_jobs {
                warn!(
                    max_jobs = self.config.max_jobs,
                    "Job store is full of active jobs, rejecting new job"
                );
                return Err(Error::Unavailable(
                    "Too many active jobs, please try again later".to_string(),
                ));
            }
        }

        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(Error::validation(format!(
                "Job {} already exists",
                job.id
            ))),
            Entry::Vacant(slot) => {
                debug!(job_id = %job.id, "Created job");
                slot.insert(job.clone());
                Ok(job)
            }
        }
    }

    /// Merge a partial update into an existing job and return the new snapshot.
    ///
    /// Unknown IDs and updates that would violate the lifecycle are logged
    /// and rejected without touching the stored job.
    pub fn update_job(&self, id: &str, update: JobUpdate) -> Result<Job> {
        let Some(mut job) = self.jobs.get_mut(id) else {
            warn!(job_id = %id, "Update for unknown job ignored");
            return Err(Error::not_found("Job", id));
        };

        match job.apply(update) {
            Ok(()) => {
                debug!(
                    job_id = %id,
                    status = %job.status,
                    progress = job.progress,
                    "Job updated"
                );
                Ok(job.clone())
            }
            Err(e) => {
                warn!(job_id = %id, status = %job.status, error = %e, "Job update rejected");
                Err(e)
            }
        }
    }

    /// Snapshot of a job.
    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|job| job.clone())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        for job in self.jobs.iter() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Drop terminal jobs last updated before `cutoff`. Returns how many were removed.
    pub fn evict_terminal_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        before.saturating_sub(self.jobs.len())
    }

    /// Drop up to `count` terminal jobs, oldest first.
    fn evict_oldest_terminal(&self, count: usize) -> usize {
        let mut terminal: Vec<(DateTime<Utc>, String)> = self
            .jobs
            .iter()
            .filter(|job| job.status.is_terminal())
            .map(|job| (job.updated_at, job.id.clone()))
            .collect();
        terminal.sort();

        let mut removed = 0;
        for (_, id) in terminal.into_iter().take(count) {
            if self
                .jobs
                .remove_if(&id, |_, job| job.status.is_terminal())
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Evicted oldest terminal jobs to stay under cap");
        }
        removed
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(JobStoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_create_and_get() {
        let store = JobStore::default();
        let job = store.create_job("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(store.get_job("job-1").unwrap().id, "job-1");
        assert!(store.get_job("missing").is_none());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let store = JobStore::default();
        store.create_job("job-1").unwrap();
        store
            .update_job("job-1", JobUpdate::failed("boom"))
            .unwrap();

        assert!(matches!(
            store.create_job("job-1"),
            Err(Error::Validation(_))
        ));
        assert_eq!(store.get_job("job-1").unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_update_unknown_job_is_not_found() {
        let store = JobStore::default();
        let result = store.update_job("ghost", JobUpdate::processing(10, "Reading input"));
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn test_terminal_job_is_frozen() {
        let store = JobStore::default();
        store.create_job("job-1").unwrap();
        store
            .update_job("job-1", JobUpdate::processing(10, "Reading input"))
            .unwrap();
        store.update_job("job-1", JobUpdate::completed(vec![])).unwrap();

        assert!(store.update_job("job-1", JobUpdate::failed("late")).is_err());
        let job = store.get_job("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_stats() {
        let store = JobStore::default();
        store.create_job("a").unwrap();
        store.create_job("b").unwrap();
        store.create_job("c").unwrap();
        store
            .update_job("b", JobUpdate::processing(10, "Reading input"))
            .unwrap();
        store.update_job("c", JobUpdate::failed("boom")).unwrap();

        let stats = store.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_cap_evicts_oldest_terminal_first() {
        let store = JobStore::new(JobStoreConfig { max_jobs: 3 });
        store.create_job("old-failed").unwrap();
        store.update_job("old-failed", JobUpdate::failed("x")).unwrap();
        store.create_job("active").unwrap();
        store.create_job("new-failed").unwrap();
        store.update_job("new-failed", JobUpdate::failed("y")).unwrap();

        store.create_job("fresh").unwrap();

        assert_eq!(store.len(), 3);
        assert!(store.get_job("old-failed").is_none());
        assert!(store.get_job("new-failed").is_some());
        assert!(store.get_job("active").is_some());
    }

    #[test]
    fn test_cap_never_evicts_active_jobs() {
        let store = JobStore::new(JobStoreConfig { max_jobs: 2 });
        store.create_job("a").unwrap();
        store.create_job("b").unwrap();

        assert!(matches!(store.create_job("c"), Err(Error::Unavailable(_))));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_evict_terminal_older_than() {
        let store = JobStore::default();
        store.create_job("done").unwrap();
        store.update_job("done", JobUpdate::failed("x")).unwrap();
        store.create_job("waiting").unwrap();

        let removed = store.evict_terminal_older_than(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert!(store.get_job("done").is_none());
        assert!(store.get_job("waiting").is_some());
    }

    #[test]
    fn test_concurrent_updates_keep_progress_monotonic() {
        let store = Arc::new(JobStore::default());
        store.create_job("job-1").unwrap();

        let handles: Vec<_> = (1..=50u8)
            .map(|p| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let _ = store.update_job("job-1", JobUpdate::processing(p, "Converting"));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let job = store.get_job("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 50);
    }
}
