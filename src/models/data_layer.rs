use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File type of an uploaded data layer, inferred from its name at upload.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileType {
    Pdf,
    Zip,
    Other,
}

impl FileType {
    /// Infer the file type from a file name extension.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.ends_with(".pdf") {
            FileType::Pdf
        } else if lower.ends_with(".zip") {
            FileType::Zip
        } else {
            FileType::Other
        }
    }
}

/// Per-job processing status of one data layer.
///
/// Transitions: pending -> processing -> {completed, failed}.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataLayerStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A reference to one source file (or archive) within a job.
///
/// Archive members carry a `parent_id` back-reference to the zip they were
/// extracted from; members are looked up by parent rather than nested in a
/// recursive children field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLayerRef {
    pub id: Uuid,
    pub file_name: String,
    pub file_type: FileType,
    pub storage_path: String,
    pub status: DataLayerStatus,
    pub parent_id: Option<Uuid>,
}

/// POST /api/v1/data-layers response.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub data_layer_id: Uuid,
    pub file_name: String,
    pub file_type: FileType,
}
