//! Error types for the task pipeline

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors that can occur while preparing a task for execution.
///
/// These never escape the worker loop; they are converted into failed
/// task results and reported to the server.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Repository synchronization failed
    #[error("{0}")]
    Sync(#[from] repo_sync::SyncError),

    /// Workspace directory could not be prepared
    #[error("Failed to prepare workspace: {0}")]
    Workspace(#[from] std::io::Error),
}
