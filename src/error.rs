use thiserror::Error;

/// Failures reported synchronously to the uploader.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("unsupported file type '{extension}', allowed: {allowed}")]
    InvalidFileType { extension: String, allowed: String },

    #[error("file size {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("chunk descriptor for '{0}' disagrees with earlier chunks")]
    DescriptorMismatch(String),

    #[error("upload '{0}' is already finalized")]
    AlreadyFinalized(String),

    #[error("merge failed for '{identifier}': {reason}")]
    MergeFailed { identifier: String, reason: String },

    #[error("task submission failed: {0}")]
    Submit(#[from] QueueError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::InvalidFileType { .. } => "INVALID_FILE_TYPE",
            UploadError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            UploadError::InvalidChunk(_) => "INVALID_CHUNK",
            UploadError::DescriptorMismatch(_) => "DESCRIPTOR_MISMATCH",
            UploadError::AlreadyFinalized(_) => "ALREADY_FINALIZED",
            UploadError::MergeFailed { .. } => "MERGE_FAILED",
            UploadError::Submit(_) => "SUBMIT_FAILED",
            UploadError::Io(_) => "IO_ERROR",
        }
    }
}

/// Failure of a single task attempt.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("{0}")]
    ExecutionFailed(String),

    #[error("cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::ExecutionFailed(msg.into())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::ExecutionFailed(e.to_string())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(e: anyhow::Error) -> Self {
        TaskError::ExecutionFailed(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("a task for '{0}' is already active")]
    DuplicateTask(String),

    #[error("task queue is shut down")]
    Closed,
}
