//! Task assignments and results

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of work assigned by the server: an optional repository sync
/// followed by a single command execution.
///
/// Immutable after creation; dropped once its result has been sent.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique per assignment.
    pub id: Uuid,
    /// Repository to sync into the workspace before running the command.
    pub repo_url: Option<String>,
    /// Branch, tag or commit to check out.
    pub repo_ref: String,
    /// Working-subdirectory name under the workspace root.
    pub workspace: String,
    /// Shell command to execute.
    pub command: String,
    /// Execution timeout in seconds; the configured default applies when unset.
    pub timeout_secs: Option<u64>,
    /// Extra environment variables for the command.
    pub env: HashMap<String, String>,
}

/// Final status of a task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result reported back to the server once a task finishes.
///
/// Built by the task worker, handed to the connection session for
/// transmission, then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// Exit code of the command; absent for timed-out, cancelled and
    /// signal-terminated executions.
    pub exit_code: Option<i32>,
    /// Captured standard output, bounded (see `stdout_truncated`).
    pub stdout: String,
    /// Captured standard error, bounded (see `stderr_truncated`).
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// Result for a task that never reached the command, e.g. a repository
    /// sync failure. The diagnostic ends up in `stderr`.
    pub fn failed(task_id: Uuid, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failure,
            exit_code: None,
            stdout: String::new(),
            stderr: error.into(),
            stdout_truncated: false,
            stderr_truncated: false,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
