use thiserror::Error;

/// Failure taxonomy for backup execution.
///
/// Everything except `JobNotFound` (and `Store` on the trigger lookup) is
/// absorbed by the orchestrator into a failed history record; the `Display`
/// string is what ends up in `error_message`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackupError {
    #[error("target not found: {0}")]
    TargetNotFound(String),
    #[error("archive failed: {0}")]
    ArchiveFailed(String),
    #[error("destination unavailable: {0}")]
    DestinationUnavailable(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("backup job {0} not found")]
    JobNotFound(i64),
    #[error("backup timed out after {0}s")]
    Timeout(u64),
    #[error("store error: {0}")]
    Store(String),
}

impl BackupError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(format!("{err:#}"))
    }
}
