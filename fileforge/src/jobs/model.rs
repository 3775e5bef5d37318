//! Job record and the partial updates applied to it.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is accepted and waiting to be processed.
    Pending,
    /// Job is currently being processed.
    Processing,
    /// Job completed successfully.
    Completed,
    /// Job failed.
    Failed,
}

impl JobStatus {
    /// Terminal states are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a job in this state may move to `next`.
    ///
    /// Staying in the same non-terminal state is allowed so progress-only
    /// updates can restate the status.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Pending | Processing | Failed) => true,
            (Processing, Processing | Completed | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An output artifact produced by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFile {
    /// Location on shared storage.
    pub path: PathBuf,
    /// Name offered to the client on download.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
}

/// A tracked unit of asynchronous conversion work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job ID.
    pub id: String,
    /// Current status.
    pub status: JobStatus,
    /// Progress percentage (0-100).
    pub progress: u8,
    /// Human-readable description of the current step.
    pub message: String,
    /// Error message, only when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output artifacts, only when completed.
    #[serde(default)]
    pub result_files: Vec<ResultFile>,
    /// Requested conversion (e.g. "gzip").
    #[serde(default)]
    pub conversion_type: String,
    /// Client-supplied name of the input file.
    #[serde(default)]
    pub source_name: String,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            progress: 0,
            message: "Queued".to_string(),
            error: None,
            result_files: Vec::new(),
            conversion_type: String::new(),
            source_name: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the conversion type.
    pub fn with_conversion_type(mut self, conversion_type: impl Into<String>) -> Self {
        self.conversion_type = conversion_type.into();
        self
    }

    /// Set the input file name.
    pub fn with_source_name(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = source_name.into();
        self
    }

    /// Merge a partial update into this job.
    ///
    /// The update is validated as a whole before anything is written, so a
    /// rejected update leaves the job untouched. Rules:
    /// - terminal jobs accept no updates;
    /// - status changes must follow `pending -> processing -> {completed | failed}`
    ///   (a pending job may also fail directly);
    /// - progress never decreases and is capped at 100;
    /// - `error` is only recorded on failure, `result_files` only on completion.
    pub fn apply(&mut self, update: JobUpdate) -> Result<()> {
        let next_status = update.status.unwrap_or(self.status);

        if self.status.is_terminal() || !self.status.can_transition_to(next_status) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next_status.to_string(),
            });
        }

        if let Some(progress) = update.progress {
            self.progress = self.progress.max(progress.min(100));
        }
        if let Some(message) = update.message {
            self.message = message;
        }

        match next_status {
            JobStatus::Completed => {
                self.progress = 100;
                if self.result_files.is_empty()
                    && let Some(files) = update.result_files
                {
                    self.result_files = files;
                }
            }
            JobStatus::Failed => {
                self.error = Some(
                    update
                        .error
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "Unknown error".to_string()),
                );
            }
            _ => {}
        }

        self.status = next_status;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A partial update to a [`Job`]. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub result_files: Option<Vec<ResultFile>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to `processing` at the given milestone.
    pub fn processing(progress: u8, message: impl Into<String>) -> Self {
        Self::new()
            .with_status(JobStatus::Processing)
            .with_progress(progress)
            .with_message(message)
    }

    /// Mark completed with the produced artifacts.
    pub fn completed(result_files: Vec<ResultFile>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            message: Some("Conversion complete".to_string()),
            error: None,
            result_files: Some(result_files),
        }
    }

    /// Mark failed with a diagnostic.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            message: Some("Conversion failed".to_string()),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
