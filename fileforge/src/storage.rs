//! Artifact storage.
//!
//! Uploads and outputs live in two flat directories under server-chosen
//! names: `<uuid>` for inputs and `<job-id>-<index>.<ext>` for outputs.
//! Client-supplied names never reach the filesystem.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::utils::fs::{ensure_dir_all_with_op, io_error};
use crate::{Error, Result};

/// Storage locations.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl StorageConfig {
    pub fn new(upload_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            output_dir: output_dir.into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new("./data/uploads", "./data/outputs")
    }
}

/// Filesystem-backed store for input and output artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    config: StorageConfig,
}

impl ArtifactStore {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Create the storage directories.
    pub async fn init(&self) -> Result<()> {
        ensure_dir_all_with_op("creating upload directory", &self.config.upload_dir).await?;
        ensure_dir_all_with_op("creating output directory", &self.config.output_dir).await?;
        Ok(())
    }

    pub fn upload_dir(&self) -> &Path {
        &self.config.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Location of an uploaded input. `file_id` must be a UUID.
    pub fn input_path(&self, file_id: &str) -> Result<PathBuf> {
        let id = Uuid::parse_str(file_id.trim())
            .map_err(|_| Error::validation(format!("Invalid fileId: {}", file_id)))?;
        Ok(self.config.upload_dir.join(id.hyphenated().to_string()))
    }

    /// Persist an uploaded input under a fresh ID.
    pub async fn save_upload(&self, data: &[u8]) -> Result<(String, PathBuf)> {
        let file_id = Uuid::new_v4().to_string();
        let path = self.config.upload_dir.join(&file_id);
        self.write_new(&path, data).await?;
        debug!(file_id = %file_id, size = data.len(), "Stored upload");
        Ok((file_id, path))
    }

    /// Location of the `index`-th output of a job.
    pub fn output_path(&self, job_id: &str, index: usize, extension: &str) -> PathBuf {
        let ext: String = extension
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(16)
            .collect();
        let name = if ext.is_empty() {
            format!("{}{}", self.output_prefix(job_id), index)
        } else {
            format!(
                "{}{}.{}",
                self.output_prefix(job_id),
                index,
                ext.to_ascii_lowercase()
            )
        };
        self.config.output_dir.join(name)
    }

    /// File name prefix shared by every output of a job.
    pub fn output_prefix(&self, job_id: &str) -> String {
        format!("{}-", job_id)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|e| io_error("reading artifact", path, e))
    }

    /// Write a new artifact. Fails if the path already exists, so every
    /// artifact has exactly one writer.
    pub async fn write_new(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| io_error("creating artifact", path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| io_error("writing artifact", path, e))?;
        file.flush()
            .await
            .map_err(|e| io_error("writing artifact", path, e))?;
        Ok(())
    }

    /// Open an artifact for streaming. `None` when it no longer exists.
    pub async fn open(&self, path: &Path) -> Result<Option<(tokio::fs::File, u64)>> {
        let file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("opening artifact", path, e)),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| io_error("reading artifact metadata", path, e))?
            .len();
        Ok(Some((file, len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> ArtifactStore {
        let store = ArtifactStore::new(StorageConfig::new(
            dir.path().join("uploads"),
            dir.path().join("outputs"),
        ));
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_upload_and_resolve() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let (file_id, path) = store.save_upload(b"hello").await.unwrap();
        assert_eq!(store.input_path(&file_id).unwrap(), path);
        assert_eq!(store.read(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_input_path_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        assert!(matches!(
            store.input_path("../../etc/passwd"),
            Err(Error::Validation(_))
        ));
        assert!(store.input_path("").is_err());
    }

    #[tokio::test]
    async fn test_write_new_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let path = store.output_path("job", 0, "gz");

        store.write_new(&path, b"first").await.unwrap();
        assert!(store.write_new(&path, b"second").await.is_err());
        assert_eq!(store.read(&path).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_output_path_sanitizes_extension() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let path = store.output_path("job-1", 2, "../GZ");
        assert_eq!(path.file_name().unwrap(), "job-1-2.gz");
        assert_eq!(
            store.output_path("job-1", 0, "").file_name().unwrap(),
            "job-1-0"
        );
    }

    #[tokio::test]
    async fn test_outputs_share_job_prefix() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let prefix = store.output_prefix("job-a");

        for index in 0..3 {
            let name = store.output_path("job-a", index, "txt");
            let name = name.file_name().unwrap().to_string_lossy();
            assert!(name.starts_with(&prefix));
        }
        let other = store.output_path("job-ab", 0, "txt");
        assert!(!other.file_name().unwrap().to_string_lossy().starts_with(&prefix));
    }

    #[tokio::test]
    async fn test_open_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let path = store.output_path("job", 0, "bin");

        assert!(store.open(&path).await.unwrap().is_none());
        store.write_new(&path, b"abc").await.unwrap();
        let (_, len) = store.open(&path).await.unwrap().unwrap();
        assert_eq!(len, 3);
    }
}
