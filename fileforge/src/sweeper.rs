//! Deferred artifact deletion.
//!
//! Every upload and output is handed to the [`RetentionSweeper`] with a
//! deadline. A single background task sleeps until the earliest deadline and
//! deletes whatever is due, so pending deletions are observable and can be
//! drained on shutdown instead of being lost with detached timers.
//!
//! A path may be scheduled more than once (output TTL, then a download); the
//! earliest deadline wins and later entries find nothing to delete.
//! Paths in use are protected with an [`ArtifactLease`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::utils::fs::{file_age, io_error, remove_file_if_exists};

/// Artifact lifetimes.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Delay before an uploaded input is deleted.
    pub input_cleanup_delay: Duration,
    /// Lifetime of an output that is never downloaded.
    pub output_ttl: Duration,
    /// Delay before an output is deleted once a download starts.
    pub download_cleanup_delay: Duration,
    /// Delete everything still pending when the service stops.
    pub drain_on_shutdown: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            input_cleanup_delay: Duration::from_secs(300),
            output_ttl: Duration::from_secs(3600),
            download_cleanup_delay: Duration::from_secs(60),
            drain_on_shutdown: true,
        }
    }
}

/// What a scheduled entry removes.
#[derive(Debug)]
enum Target {
    File(PathBuf),
    /// Every regular file in `dir` whose name starts with `prefix`.
    Prefix { dir: PathBuf, prefix: String },
}

#[derive(Debug)]
struct Scheduled {
    deadline: Instant,
    seq: u64,
    target: Target,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Deadline-ordered queue of files to delete.
///
/// A leased path is never deleted: entries for it that come due while the
/// lease is held are dropped. Whoever holds the lease schedules the final
/// deletion once it is done with the file.
#[derive(Default)]
pub struct RetentionSweeper {
    queue: Mutex<BinaryHeap<Reverse<Scheduled>>>,
    leases: Mutex<HashMap<PathBuf, usize>>,
    seq: AtomicU64,
    deleted: AtomicU64,
    notify: Notify,
}

impl RetentionSweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete `path` once `delay` has elapsed.
    pub fn schedule_delete(&self, path: impl Into<PathBuf>, delay: Duration) {
        let path = path.into();
        debug!(path = %path.display(), delay_secs = delay.as_secs(), "Scheduled artifact deletion");
        self.push(Target::File(path), delay);
    }

    /// Delete every file in `dir` named `prefix*` once `delay` has elapsed.
    ///
    /// The directory is listed when the entry comes due, so files created
    /// after scheduling are caught as well.
    pub fn schedule_prefix_delete(
        &self,
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        delay: Duration,
    ) {
        let dir = dir.into();
        let prefix = prefix.into();
        debug!(dir = %dir.display(), prefix = %prefix, delay_ms = delay.as_millis() as u64, "Scheduled prefix deletion");
        self.push(Target::Prefix { dir, prefix }, delay);
    }

    fn push(&self, target: Target, delay: Duration) {
        let deadline = Instant::now() + delay;
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.lock().push(Reverse(Scheduled {
            deadline,
            seq,
            target,
        }));
        self.notify.notify_one();
    }

    /// Protect `path` from deletion until the returned lease is dropped.
    pub fn lease(self: &Arc<Self>, path: impl Into<PathBuf>) -> ArtifactLease {
        let path = path.into();
        *self.leases.lock().entry(path.clone()).or_insert(0) += 1;
        ArtifactLease {
            sweeper: Arc::clone(self),
            path: Some(path),
        }
    }

    pub fn is_leased(&self, path: &Path) -> bool {
        self.leases.lock().contains_key(path)
    }

    fn release(&self, path: &Path) {
        let mut leases = self.leases.lock();
        if let Some(count) = leases.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                leases.remove(path);
            }
        }
    }

    /// Number of deletions still queued.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Total files this sweeper has removed.
    pub fn deleted_count(&self) -> u64 {
        self.deleted.load(AtomicOrdering::Relaxed)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.lock().peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Delete everything whose deadline has passed. Returns files removed.
    pub async fn run_due(&self) -> usize {
        let due = self.take_due(Some(Instant::now()));
        self.delete_all(due).await
    }

    /// Delete everything still queued, regardless of deadline.
    ///
    /// Leased paths are still skipped.
    pub async fn drain(&self) -> usize {
        let all = self.take_due(None);
        let count = all.len();
        let removed = self.delete_all(all).await;
        if count > 0 {
            info!(scheduled = count, removed, "Drained pending artifact deletions");
        }
        removed
    }

    fn take_due(&self, now: Option<Instant>) -> Vec<Target> {
        let mut queue = self.queue.lock();
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = queue.peek() {
            if now.is_some_and(|now| entry.deadline > now) {
                break;
            }
            if let Some(Reverse(entry)) = queue.pop() {
                due.push(entry.target);
            }
        }
        due
    }

    async fn delete_all(&self, targets: Vec<Target>) -> usize {
        let mut removed = 0;
        for target in targets {
            match target {
                Target::File(path) => {
                    if self.delete_file(&path).await {
                        removed += 1;
                    }
                }
                Target::Prefix { dir, prefix } => match matching_files(&dir, &prefix).await {
                    Ok(paths) => {
                        for path in paths {
                            if self.delete_file(&path).await {
                                removed += 1;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to list artifacts for deletion"),
                },
            }
        }
        self.deleted
            .fetch_add(removed as u64, AtomicOrdering::Relaxed);
        removed
    }

    async fn delete_file(&self, path: &Path) -> bool {
        if self.is_leased(path) {
            debug!(path = %path.display(), "Skipping deletion of leased artifact");
            return false;
        }
        match remove_file_if_exists(path).await {
            Ok(true) => {
                debug!(path = %path.display(), "Deleted artifact");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "Failed to delete artifact");
                false
            }
        }
    }

    /// Start the background task that deletes artifacts as they come due.
    pub fn start(self: &Arc<Self>, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let sweeper = Arc::clone(self);

        tokio::spawn(async move {
            debug!("Retention sweeper started");
            loop {
                let next = sweeper.next_deadline();
                let wait = async move {
                    match next {
                        Some(deadline) => {
                            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))
                                .await
                        }
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Retention sweeper shutting down");
                        break;
                    }
                    // New entry may be earlier than the one we are sleeping on.
                    _ = sweeper.notify.notified() => {}
                    _ = wait => {
                        sweeper.run_due().await;
                    }
                }
            }
        })
    }
}

/// Keeps an artifact alive while it is in use. Released on drop.
pub struct ArtifactLease {
    sweeper: Arc<RetentionSweeper>,
    path: Option<PathBuf>,
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.sweeper.release(&path);
        }
    }
}

async fn matching_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error("reading directory", dir, e)),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}

/// Remove regular files in `dir` older than `max_age`.
///
/// Used on startup to collect artifacts orphaned by a previous process,
/// whose in-memory deletion schedule did not survive the restart.
pub async fn sweep_stale_dir(dir: &Path, max_age: Duration) -> Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error("reading directory", dir, e)),
    };

    let mut removed = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error("reading directory", dir, e))?
    {
        let path = entry.path();
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let stale = file_age(&path).await.is_some_and(|age| age >= max_age);
        if stale && remove_file_if_exists(&path).await? {
            removed += 1;
        }
    }

    if removed > 0 {
        info!(dir = %dir.display(), removed, "Removed stale artifacts");
    }
    Ok(removed)
}

/// Schedules deletion of an artifact when dropped.
///
/// Attached to a download body so the clock starts when the transfer ends
/// or is abandoned.
pub struct DeleteOnDrop {
    sweeper: Arc<RetentionSweeper>,
    path: Option<PathBuf>,
    delay: Duration,
}

impl DeleteOnDrop {
    pub fn new(sweeper: Arc<RetentionSweeper>, path: PathBuf, delay: Duration) -> Self {
        Self {
            sweeper,
            path: Some(path),
            delay,
        }
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.sweeper.schedule_delete(path, self.delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, b"data").await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_run_due_only_deletes_expired() {
        let dir = TempDir::new().unwrap();
        let due = touch(&dir, "due.bin").await;
        let later = touch(&dir, "later.bin").await;

        let sweeper = RetentionSweeper::new();
        sweeper.schedule_delete(&due, Duration::ZERO);
        sweeper.schedule_delete(&later, Duration::from_secs(3600));

        assert_eq!(sweeper.run_due().await, 1);
        assert!(!due.exists());
        assert!(later.exists());
        assert_eq!(sweeper.pending(), 1);
    }

    #[tokio::test]
    async fn test_drain_deletes_everything() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.bin").await;
        let b = touch(&dir, "b.bin").await;

        let sweeper = RetentionSweeper::new();
        sweeper.schedule_delete(&a, Duration::from_secs(3600));
        sweeper.schedule_delete(&b, Duration::from_secs(7200));

        assert_eq!(sweeper.drain().await, 2);
        assert_eq!(sweeper.pending(), 0);
        assert!(!a.exists() && !b.exists());
        assert_eq!(sweeper.deleted_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_paths_are_harmless() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "twice.bin").await;

        let sweeper = RetentionSweeper::new();
        sweeper.schedule_delete(&path, Duration::ZERO);
        sweeper.schedule_delete(&path, Duration::ZERO);
        sweeper.schedule_delete(dir.path().join("never-existed"), Duration::ZERO);

        assert_eq!(sweeper.run_due().await, 1);
        assert_eq!(sweeper.pending(), 0);
    }

    #[tokio::test]
    async fn test_earliest_deadline_first() {
        let sweeper = RetentionSweeper::new();
        sweeper.schedule_delete("/tmp/late", Duration::from_secs(100));
        sweeper.schedule_delete("/tmp/early", Duration::from_secs(10));

        let next = sweeper.next_deadline().unwrap();
        assert!(next <= Instant::now() + Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_background_task_deletes_due_files() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "soon.bin").await;

        let sweeper = Arc::new(RetentionSweeper::new());
        let token = CancellationToken::new();
        let handle = sweeper.start(token.clone());

        sweeper.schedule_delete(&path, Duration::from_millis(20));

        let deadline = Instant::now() + Duration::from_secs(5);
        while path.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!path.exists());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_on_drop_schedules() {
        let sweeper = Arc::new(RetentionSweeper::new());
        let guard = DeleteOnDrop::new(sweeper.clone(), PathBuf::from("/tmp/x"), Duration::from_secs(60));
        assert_eq!(sweeper.pending(), 0);
        drop(guard);
        assert_eq!(sweeper.pending(), 1);
    }

    #[tokio::test]
    async fn test_sweep_stale_dir() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "old.bin").await;
        tokio::fs::create_dir(dir.path().join("subdir")).await.unwrap();

        assert_eq!(sweep_stale_dir(dir.path(), Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(sweep_stale_dir(dir.path(), Duration::ZERO).await.unwrap(), 1);
        assert!(dir.path().join("subdir").is_dir());

        let missing = dir.path().join("missing");
        assert_eq!(sweep_stale_dir(&missing, Duration::ZERO).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_leased_path_survives_due_deletion() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "claimed.bin").await;

        let sweeper = Arc::new(RetentionSweeper::new());
        sweeper.schedule_delete(&path, Duration::ZERO);
        let lease = sweeper.lease(&path);

        assert_eq!(sweeper.run_due().await, 0);
        assert_eq!(sweeper.drain().await, 0);
        assert!(path.exists());
        // The skipped entry is gone for good.
        assert_eq!(sweeper.pending(), 0);

        drop(lease);
        assert!(!sweeper.is_leased(&path));
        sweeper.schedule_delete(&path, Duration::ZERO);
        assert_eq!(sweeper.run_due().await, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_lease_is_counted() {
        let sweeper = Arc::new(RetentionSweeper::new());
        let first = sweeper.lease("/tmp/shared-input");
        let second = sweeper.lease("/tmp/shared-input");

        drop(first);
        assert!(sweeper.is_leased(Path::new("/tmp/shared-input")));
        drop(second);
        assert!(!sweeper.is_leased(Path::new("/tmp/shared-input")));
    }

    #[tokio::test]
    async fn test_prefix_deletion_lists_when_due() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "job1-0.txt").await;

        let sweeper = RetentionSweeper::new();
        sweeper.schedule_prefix_delete(dir.path(), "job1-", Duration::ZERO);

        // Created after scheduling, still collected.
        touch(&dir, "job1-1.txt").await;
        let other = touch(&dir, "job10-0.txt").await;

        assert_eq!(sweeper.run_due().await, 2);
        assert!(!dir.path().join("job1-0.txt").exists());
        assert!(!dir.path().join("job1-1.txt").exists());
        assert!(other.exists());
    }
}
