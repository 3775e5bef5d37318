//! API request and response models (DTOs).
//!
//! All payloads use camelCase field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{Job, JobStats, JobStatus};

// ============================================================================
// Conversion
// ============================================================================

/// Body of `POST /api/convert`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertRequest {
    /// ID returned by the upload endpoint.
    pub file_id: String,
    /// Original name of the uploaded file.
    #[serde(default)]
    pub file_name: Option<String>,
    pub conversion_type: String,
    /// Engine-specific options, passed through untouched.
    #[serde(default, alias = "options")]
    pub advanced_options: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertResponse {
    pub success: bool,
    pub job_id: String,
}

/// Available conversion types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionTypesResponse {
    pub conversion_types: Vec<String>,
}

// ============================================================================
// Jobs
// ============================================================================

/// Query for `GET /api/status`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub job_id: String,
}

/// Query for `GET /api/download`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub job_id: String,
    #[serde(default)]
    pub file_index: usize,
}

/// A downloadable output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultFileResponse {
    pub index: usize,
    pub file_name: String,
    pub size: u64,
    pub download_url: String,
}

/// Job snapshot as seen by clients. Storage paths are never exposed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub result_files: Vec<ResultFileResponse>,
    pub conversion_type: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        let result_files = job
            .result_files
            .iter()
            .enumerate()
            .map(|(index, file)| ResultFileResponse {
                index,
                file_name: file.file_name.clone(),
                size: file.size,
                download_url: format!("/api/download?jobId={}&fileIndex={}", job.id, index),
            })
            .collect();

        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            message: job.message,
            error: job.error,
            result_files,
            conversion_type: job.conversion_type,
            file_name: job.source_name,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

// ============================================================================
// Upload
// ============================================================================

/// Query for `POST /api/upload`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQuery {
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub success: bool,
    pub file_id: String,
    pub file_name: String,
    pub size: u64,
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl From<JobStats> for JobCounts {
    fn from(stats: JobStats) -> Self {
        Self {
            pending: stats.pending,
            processing: stats.processing,
            completed: stats.completed,
            failed: stats.failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub jobs: JobCounts,
    /// Accepted jobs whose supervision has not finished.
    pub active_jobs: usize,
    pub pending_deletions: usize,
    pub tracked_clients: usize,
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilterResponse {
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateLogFilterRequest {
    pub filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobUpdate, ResultFile};
    use std::path::PathBuf;

    #[test]
    fn test_convert_request_accepts_both_option_names() {
        let req: ConvertRequest = serde_json::from_str(
            r#"{"fileId":"abc","fileName":"a.txt","conversionType":"gzip","advancedOptions":{"level":9}}"#,
        )
        .unwrap();
        assert_eq!(req.advanced_options.unwrap()["level"], 9);

        let req: ConvertRequest =
            serde_json::from_str(r#"{"fileId":"abc","conversionType":"split","options":{"parts":2}}"#)
                .unwrap();
        assert!(req.file_name.is_none());
        assert_eq!(req.advanced_options.unwrap()["parts"], 2);
    }

    #[test]
    fn test_job_response_hides_paths() {
        let mut job = Job::new("job-1").with_source_name("a.txt");
        job.apply(JobUpdate::processing(10, "Reading input")).unwrap();
        job.apply(JobUpdate::completed(vec![ResultFile {
            path: PathBuf::from("/srv/outputs/job-1-0.gz"),
            file_name: "a.gz".to_string(),
            size: 12,
        }]))
        .unwrap();

        let json = serde_json::to_value(JobResponse::from(job)).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["resultFiles"][0]["fileName"], "a.gz");
        assert_eq!(
            json["resultFiles"][0]["downloadUrl"],
            "/api/download?jobId=job-1&fileIndex=0"
        );
        assert!(!json.to_string().contains("/srv/outputs"));
        assert!(json.get("error").is_none());
    }
}
