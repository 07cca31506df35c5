use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an extraction job.
///
/// Transitions: queued -> running -> {completed, failed}. Terminal states
/// are never left; there is no whole-job retry.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One extraction run over one or more source files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// Monotonically non-decreasing, 0-100. Reaches exactly 100 on completion.
    pub progress_percentage: u8,
    pub schema_id: Uuid,
    /// Ordered list of data layers this job was submitted with. Archive
    /// expansion appends member layers to the processing list but never
    /// removes the original reference from this list.
    pub data_layer_ids: Vec<Uuid>,
    /// User-visible append-only log for progress-polling clients.
    pub log: Vec<JobLogEntry>,
    /// Terminal error message, set only when status is `Failed`.
    pub error: Option<String>,
    /// Free-form metadata patch (current stage, batch counters, summary).
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the job's user-visible log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl JobLogEntry {
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// POST /api/v1/jobs request body.
#[derive(Debug, Deserialize, garde::Validate)]
pub struct SubmitJobRequest {
    #[garde(skip)]
    pub schema_id: Uuid,
    /// A job needs at least one source file.
    #[garde(length(min = 1, max = 100))]
    pub data_layer_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// POST /api/v1/jobs/{job_id}/match response.
#[derive(Debug, Serialize)]
pub struct MatchKickoffResponse {
    pub job_id: Uuid,
    pub queued: bool,
}

/// Summary written into job metadata on successful completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub files_processed: usize,
    pub total_records: usize,
    pub average_confidence: Option<f64>,
    pub processed_files: Vec<String>,
}
