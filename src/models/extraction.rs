use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Review status of an extracted record.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Accepted,
    Rejected,
    Edited,
}

/// Provenance attached to an extracted record: where on the page the model
/// found it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// One structured record extracted from a document.
///
/// `raw_extraction` is immutable once written; human overrides live in the
/// separate `verified_data` layer, which is merged (not replaced) on update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub raw_extraction: serde_json::Value,
    pub evidence: Evidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified_data: Option<serde_json::Value>,
    /// Ordered, append-only record of every agent stage this result went
    /// through. Entries are never mutated after creation.
    pub agent_execution_metadata: Vec<AgentExecutionMetadata>,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file_name: Option<String>,
}

impl ExtractionResult {
    /// Build a fresh pre-agent result from raw model output.
    pub fn from_raw(job_id: Uuid, raw: serde_json::Value, evidence: Evidence) -> Self {
        let confidence_score = raw
            .get("confidence")
            .and_then(|v| v.as_f64())
            .filter(|c| (0.0..=1.0).contains(c));
        Self {
            id: Uuid::new_v4(),
            job_id,
            raw_extraction: raw,
            evidence,
            verified_data: None,
            agent_execution_metadata: Vec::new(),
            status: ResultStatus::Pending,
            confidence_score,
            source_file_id: None,
            source_file_name: None,
        }
    }
}

/// Outcome of one agent stage for one record.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AgentRunStatus {
    Success,
    Failed,
    Timeout,
}

/// Which fallback path left the data unchanged after a stage failure.
/// Purely a diagnostics label; both paths have the same effect on the data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FallbackMode {
    SkipOnError,
    IndividualFallback,
}

/// Append-only execution record for one agent stage applied to one result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecutionMetadata {
    pub agent_name: String,
    pub agent_order: u32,
    pub agent_prompt: String,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: AgentRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackMode>,
}
