//! Checkout synchronization
//!
//! The workspace is agent-owned: local modifications are discarded on every
//! sync. The one thing a sync never does is repurpose a directory that
//! tracks a different remote; that surfaces as [`SyncError::WorkspaceConflict`].

use std::path::Path;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::commands::{
    git_command, git_command_checked, is_git_checkout, remote_branch_exists, remote_url,
};
use crate::error::{Result, SyncError};

/// Configuration for sync retries.
///
/// These retries are task-scoped and deliberately simple: a small fixed
/// number of attempts with a fixed delay, unrelated to the connection-level
/// exponential backoff.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Attempts per network operation (clone, fetch).
    pub retry_limit: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Synchronizes repository checkouts into task workspaces
#[derive(Debug, Default)]
pub struct RepoSync {
    config: SyncConfig,
}

impl RepoSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Directory name for a repository URL: the last path segment without
    /// a `.git` suffix.
    pub fn repo_dir_name(url: &str) -> String {
        let trimmed = url.trim_end_matches('/');
        let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
        trimmed
            .rsplit(['/', ':'])
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("repo")
            .to_string()
    }

    /// Ensure `dest` contains a clean checkout of `url` at `ref_name`.
    pub async fn sync(&self, url: &str, ref_name: &str, dest: &Path) -> Result<()> {
        if is_git_checkout(dest).await? {
            if let Some(existing) = remote_url(dest).await? {
                if !same_remote(&existing, url) {
                    return Err(SyncError::WorkspaceConflict {
                        path: dest.to_path_buf(),
                        existing,
                        requested: url.to_string(),
                    });
                }
            }
            info!("Updating checkout at {:?} to {}", dest, ref_name);
            self.fetch(dest).await?;
            // Discard whatever the previous task left behind.
            git_command_checked(dest, &["reset", "--hard"]).await?;
            git_command_checked(dest, &["clean", "-fd"]).await?;
        } else {
            info!("Cloning {} into {:?}", url, dest);
            self.clone_repo(url, dest).await?;
        }

        self.checkout_ref(url, ref_name, dest).await
    }

    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;
        let dest_str = dest.to_string_lossy();

        let mut last_error = String::new();
        for attempt in 1..=self.config.retry_limit {
            match git_command(parent, &["clone", url, &dest_str]).await {
                Ok(output) if output.success => return Ok(()),
                Ok(output) => {
                    last_error = output.stderr.trim().to_string();
                    warn!(
                        "Clone attempt {}/{} failed: {}",
                        attempt, self.config.retry_limit, last_error
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        "Clone attempt {}/{} failed: {}",
                        attempt, self.config.retry_limit, last_error
                    );
                }
            }
            if attempt < self.config.retry_limit {
                sleep(self.config.retry_delay).await;
            }
        }

        Err(SyncError::CloneFailed {
            url: url.to_string(),
            message: last_error,
        })
    }

    async fn fetch(&self, dest: &Path) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=self.config.retry_limit {
            match git_command_checked(dest, &["fetch", "origin", "--prune"]).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Fetch attempt {}/{} failed: {}",
                        attempt, self.config.retry_limit, e
                    );
                    last_error = Some(e);
                }
            }
            if attempt < self.config.retry_limit {
                sleep(self.config.retry_delay).await;
            }
        }
        Err(last_error.unwrap_or_else(|| SyncError::git_failed("fetch failed")))
    }

    async fn checkout_ref(&self, url: &str, ref_name: &str, dest: &Path) -> Result<()> {
        if remote_branch_exists(dest, ref_name).await? {
            // Branch: force the local branch onto the remote-tracking tip.
            let remote_ref = format!("origin/{}", ref_name);
            git_command_checked(dest, &["checkout", "-B", ref_name, &remote_ref]).await?;
            debug!("Checked out branch {} at {}", ref_name, remote_ref);
            return Ok(());
        }

        // Tag or commit hash.
        let output = git_command(dest, &["checkout", "--detach", ref_name]).await?;
        if !output.success {
            return Err(SyncError::RefNotFound {
                ref_name: ref_name.to_string(),
                url: url.to_string(),
            });
        }
        debug!("Checked out detached ref {}", ref_name);
        Ok(())
    }
}

/// Remote URLs are equal modulo a trailing slash or `.git` suffix.
fn same_remote(a: &str, b: &str) -> bool {
    normalize_remote(a) == normalize_remote(b)
}

fn normalize_remote(url: &str) -> &str {
    let url = url.trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url)
}
