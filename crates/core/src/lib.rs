//! Core library for the relay agent
//!
//! This crate contains the types shared between the connection session
//! and the task execution pipeline:
//! - Agent configuration (immutable after startup)
//! - Wire protocol envelope
//! - Task assignments and results

pub mod config;
pub mod protocol;
pub mod task;

pub use config::{AgentConfig, ConfigError};
pub use protocol::{ClientMessage, OutputStream, ServerMessage};
pub use task::{Task, TaskResult, TaskStatus};
