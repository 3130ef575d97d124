//! Repository synchronization library
//!
//! Ensures an agent-owned directory reflects a remote repository at a given
//! reference: clone on first use, fetch-and-reset on reuse, and a hard
//! conflict error when the directory belongs to a different remote.

mod commands;
mod error;
mod sync;

pub use error::{Result, SyncError};
pub use sync::{RepoSync, SyncConfig};
