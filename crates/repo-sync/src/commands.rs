//! Git command execution utilities

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Result, SyncError};

/// Output from a git command
#[derive(Debug)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

/// Execute a git command in the specified directory
pub async fn git_command(dir: &Path, args: &[&str]) -> Result<GitOutput> {
    debug!("Running git {:?} in {:?}", args, dir);

    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SyncError::git_failed_with_source("Failed to execute git command", e))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    trace!("git stdout: {}", stdout);
    if !stderr.is_empty() {
        trace!("git stderr: {}", stderr);
    }

    Ok(GitOutput {
        stdout,
        stderr,
        success: output.status.success(),
    })
}

/// Execute a git command and return an error if it fails
pub async fn git_command_checked(dir: &Path, args: &[&str]) -> Result<String> {
    let output = git_command(dir, args).await?;

    if !output.success {
        return Err(SyncError::git_failed(format!(
            "git {} failed: {}",
            args.join(" "),
            output.stderr.trim()
        )));
    }

    Ok(output.stdout)
}

/// Check whether a path is the root of a repository checkout.
/// A missing directory is simply not a checkout, never an error.
/// The `.git` check keeps plain subdirectories of an enclosing repository
/// from being mistaken for checkouts.
pub async fn is_git_checkout(path: &Path) -> Result<bool> {
    if !path.is_dir() || !path.join(".git").exists() {
        return Ok(false);
    }
    let output = git_command(path, &["rev-parse", "--git-dir"]).await?;
    Ok(output.success)
}

/// URL of the `origin` remote, or `None` when the checkout has no remote
pub async fn remote_url(path: &Path) -> Result<Option<String>> {
    let output = git_command(path, &["remote", "get-url", "origin"]).await?;
    if output.success {
        Ok(Some(output.stdout.trim().to_string()))
    } else {
        Ok(None)
    }
}

/// Commit hash at HEAD of a checkout
pub async fn current_head(path: &Path) -> Result<String> {
    let output = git_command_checked(path, &["rev-parse", "HEAD"]).await?;
    Ok(output.trim().to_string())
}

/// Check if a remote-tracking branch exists in a checkout
pub async fn remote_branch_exists(path: &Path, branch: &str) -> Result<bool> {
    let output = git_command(
        path,
        &[
            "rev-parse",
            "--verify",
            &format!("refs/remotes/origin/{}", branch),
        ],
    )
    .await?;
    Ok(output.success)
}
