//! Task execution pipeline for the relay agent
//!
//! This crate turns task assignments into subprocess executions: bounded
//! output capture, timeout enforcement with terminate-then-kill escalation,
//! single-task concurrency with busy rejection, and throttled progress
//! events.

mod error;
mod event;
mod process;
mod worker;

pub use error::{Result, WorkerError};
pub use event::WorkerEvent;
pub use process::{
    CaptureBuffer, CapturedOutput, CommandRunner, CommandSpec, ExecutionOutcome, OutcomeStatus,
    OutputChunk, RunnerConfig, TRUNCATION_MARKER,
};
pub use worker::{TaskWorker, WorkerConfig};
