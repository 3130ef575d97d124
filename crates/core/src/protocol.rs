//! Wire protocol between agent and server
//!
//! JSON text frames over a single WebSocket connection. Every frame is a
//! tagged object: `{"type": "...", ...payload}`. Authentication travels in
//! the connect URL (`token` query parameter); the server acknowledges a
//! successful handshake with `connected` and rejects bad credentials with
//! an `error` frame carrying the `auth_rejected` code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::{Task, TaskResult};

/// Error code the server sends when the authentication token is rejected.
/// Terminal for the session: the agent must not retry with the same token.
pub const AUTH_REJECTED: &str = "auth_rejected";

/// Error code the agent reports for an inbound frame it cannot decode.
/// The frame is dropped; the connection stays up.
pub const MALFORMED_FRAME: &str = "malformed_frame";

/// Which stream a progress chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Frames sent by the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication accepted; the session is now usable.
    Connected {
        #[serde(default)]
        message: String,
    },
    /// Acknowledges the heartbeat carrying the same sequence number.
    HeartbeatAck { seq: u64 },
    /// A task assignment.
    TaskAssign {
        task_id: Uuid,
        #[serde(default)]
        repo_url: Option<String>,
        #[serde(default = "default_ref")]
        repo_ref: String,
        #[serde(default = "default_workspace")]
        workspace: String,
        command: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Machine-readable error; `auth_rejected` is fatal, everything else
    /// is logged and ignored.
    Error {
        code: String,
        #[serde(default)]
        message: String,
    },
}

fn default_ref() -> String {
    "main".to_string()
}

fn default_workspace() -> String {
    "default".to_string()
}

/// Frames sent by the agent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Sent once, immediately after the server accepts authentication.
    Register {
        name: String,
        version: String,
        os: String,
        arch: String,
    },
    /// Liveness probe; `seq` increases monotonically per session.
    Heartbeat { seq: u64 },
    /// Rejection of an assignment received while another task is running.
    TaskBusy {
        task_id: Uuid,
        running_task_id: Uuid,
    },
    /// Incremental output for a long-running task.
    TaskProgress {
        task_id: Uuid,
        stream: OutputStream,
        chunk: String,
    },
    /// Final outcome of a task.
    TaskResult {
        #[serde(flatten)]
        result: TaskResult,
    },
    /// Machine-readable error report, e.g. a frame the agent could not
    /// decode (`malformed_frame`).
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Convert a `task_assign` frame into a [`Task`]. Returns `None` for
    /// every other frame type.
    pub fn into_task(self) -> Option<Task> {
        match self {
            Self::TaskAssign {
                task_id,
                repo_url,
                repo_ref,
                workspace,
                command,
                timeout_secs,
                env,
            } => Some(Task {
                id: task_id,
                repo_url,
                repo_ref,
                workspace,
                command,
                timeout_secs,
                env,
            }),
            _ => None,
        }
    }
}
