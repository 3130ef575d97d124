//! Error types for repository synchronization

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that can occur while synchronizing a repository checkout
#[derive(Debug, Error)]
pub enum SyncError {
    /// Git command execution failed
    #[error("Git command failed: {message}")]
    GitCommandFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The target directory is a checkout of a different repository.
    /// Never resolved by deleting the directory.
    #[error("WorkspaceConflict: {path} tracks {existing}, refusing to sync {requested}")]
    WorkspaceConflict {
        path: PathBuf,
        existing: String,
        requested: String,
    },

    /// Clone failed after exhausting retries
    #[error("Failed to clone {url}: {message}")]
    CloneFailed { url: String, message: String },

    /// The requested reference does not exist in the repository
    #[error("Reference '{ref_name}' not found in {url}")]
    RefNotFound { ref_name: String, url: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Create a GitCommandFailed error
    pub fn git_failed(message: impl Into<String>) -> Self {
        Self::GitCommandFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a GitCommandFailed error with source
    pub fn git_failed_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::GitCommandFailed {
            message: message.into(),
            source: Some(source),
        }
    }
}
