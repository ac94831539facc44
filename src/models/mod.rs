use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Progress value carried by a FAILED event.
pub const FAILED_PROGRESS: f64 = -1.0;

/// Position and totals of one uploaded chunk, as sent by the client next to the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    /// Left empty by clients that want the server to assign one
    #[serde(default)]
    #[validate(length(min = 1, max = 255))]
    pub identifier: String,
    /// 1-based
    #[validate(range(min = 1))]
    pub chunk_number: u32,
    #[validate(range(min = 1))]
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub total_size: u64,
    #[validate(length(min = 1, max = 255))]
    pub filename: String,
}

impl ChunkDescriptor {
    /// True when `other` describes the same logical upload.
    pub fn agrees_with(&self, other: &ChunkDescriptor) -> bool {
        self.identifier == other.identifier
            && self.total_chunks == other.total_chunks
            && self.total_size == other.total_size
            && self.filename == other.filename
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

/// Immutable notification of a task's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProgressEvent {
    pub identifier: String,
    pub filename: String,
    /// 0-100, or [`FAILED_PROGRESS`] for a failure
    pub progress: f64,
    pub status: UploadStatus,
    pub message: String,
    /// Unix epoch milliseconds
    pub timestamp: i64,
}

impl ProgressEvent {
    fn new(
        identifier: &str,
        filename: &str,
        progress: f64,
        status: UploadStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            filename: filename.to_string(),
            progress,
            status,
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn processing(
        identifier: &str,
        filename: &str,
        progress: f64,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            identifier,
            filename,
            progress.clamp(0.0, 100.0),
            UploadStatus::Processing,
            message,
        )
    }

    pub fn completed(identifier: &str, filename: &str) -> Self {
        Self::new(
            identifier,
            filename,
            100.0,
            UploadStatus::Completed,
            "processing complete",
        )
    }

    pub fn failed(identifier: &str, filename: &str, message: impl Into<String>) -> Self {
        Self::new(
            identifier,
            filename,
            FAILED_PROGRESS,
            UploadStatus::Failed,
            message,
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChunkUploadResponse {
    pub identifier: String,
    /// True once every chunk arrived and the artifact was merged
    pub complete: bool,
    pub received_chunks: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadStatusResponse {
    pub identifier: String,
    pub filename: String,
    pub status: UploadStatus,
    pub progress: f64,
    pub message: String,
    pub received_chunks: Option<u32>,
    pub total_chunks: Option<u32>,
    pub retry_count: Option<u32>,
}
