//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! tolerate files that disappeared underneath us, since artifacts are deleted
//! on timers.

use std::path::Path;
use std::time::{Duration, SystemTime};

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Remove a file, treating "already gone" as success.
///
/// Returns `true` if this call removed the file.
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error("removing file", path, e)),
    }
}

/// Age of a file based on its modification time. `None` if it cannot be determined.
pub async fn file_age(path: &Path) -> Option<Duration> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_remove_file_if_exists_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("artifact.bin");
        tokio::fs::write(&path, b"data").await.unwrap();

        assert!(remove_file_if_exists(&path).await.unwrap());
        assert!(!remove_file_if_exists(&path).await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_ensure_dir_all_creates_nested_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a/b/c");

        ensure_dir_all_with_op("creating test directory", &path).await.unwrap();
        assert!(path.is_dir());
    }

    #[tokio::test]
    async fn test_file_age_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(file_age(&temp_dir.path().join("nope")).await.is_none());
    }
}
