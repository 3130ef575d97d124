//! Command execution with bounded capture, timeout and cancellation
//!
//! Commands run through the platform shell in their own process group so
//! that timeout and cancellation can take down the whole tree, not just
//! the shell. Output is captured line by line while it streams, bounded
//! per stream, and forwarded for progress reporting.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::protocol::OutputStream;

/// Appended to a capture that hit its size bound.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Configuration for the command runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Per-stream cap on captured output, in bytes.
    pub max_capture_bytes: usize,
    /// Grace period between terminate and kill.
    pub kill_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_capture_bytes: 512 * 1024,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// A single command to execute
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Shell command line.
    pub command: String,
    /// Directory to execute in; must exist.
    pub working_dir: PathBuf,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Wall-clock limit; `None` runs unbounded.
    pub timeout: Option<Duration>,
}

/// One line of output while the command runs
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub line: String,
}

/// How the command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Normal exit with a code.
    Exited(i32),
    /// Terminated by a signal (unix only).
    Signaled(i32),
    /// The configured timeout elapsed; the process was terminated.
    TimedOut,
    /// Cancelled through the token; the process was terminated.
    Cancelled,
    /// The process never started. Distinct from a non-zero exit.
    SpawnFailed { message: String },
}

/// Captured output of one stream
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

/// Complete outcome of a command execution
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: OutcomeStatus,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Exited(0))
    }

    fn spawn_failed(error: std::io::Error, duration: Duration) -> Self {
        Self {
            status: OutcomeStatus::SpawnFailed {
                message: error.to_string(),
            },
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            duration,
        }
    }
}

/// Accumulates one stream up to a byte bound.
///
/// Invariant: the rendered text never exceeds the bound plus the length
/// of [`TRUNCATION_MARKER`].
#[derive(Debug)]
pub struct CaptureBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    /// Append a line (a trailing newline is added). Once the bound is hit
    /// the remainder of the stream is dropped.
    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let remaining = self.limit.saturating_sub(self.text.len());
        if line.len() + 1 <= remaining {
            self.text.push_str(line);
            self.text.push('\n');
        } else {
            let mut cut = remaining.min(line.len());
            while cut > 0 && !line.is_char_boundary(cut) {
                cut -= 1;
            }
            self.text.push_str(&line[..cut]);
            self.truncated = true;
        }
    }

    pub fn finish(self) -> CapturedOutput {
        let mut text = self.text;
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        CapturedOutput {
            text,
            truncated: self.truncated,
        }
    }
}

/// Executes shell commands and collects their outcome
#[derive(Debug, Default, Clone)]
pub struct CommandRunner {
    config: RunnerConfig,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Run a command to completion, cancellation or timeout.
    ///
    /// Output lines are forwarded on `output_tx` as they arrive; the full
    /// (bounded) captures come back in the outcome either way.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        output_tx: Option<mpsc::Sender<OutputChunk>>,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let start = Instant::now();

        info!("Executing command: {}", spec.command);
        debug!("Working directory: {:?}", spec.working_dir);

        let mut cmd = shell_command(&spec.command);
        cmd.current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn command: {}", e);
                return ExecutionOutcome::spawn_failed(e, start.elapsed());
            }
        };

        let stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(read_stream(
                out,
                OutputStream::Stdout,
                self.config.max_capture_bytes,
                output_tx.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(read_stream(
                err,
                OutputStream::Stderr,
                self.config.max_capture_bytes,
                output_tx,
            ))
        });

        let timeout_fut = async {
            match spec.timeout {
                Some(limit) => sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout_fut);

        let status = tokio::select! {
            result = child.wait() => match result {
                Ok(exit) => exit_status_to_outcome(exit),
                Err(e) => {
                    warn!("Failed to await command: {}", e);
                    OutcomeStatus::Exited(-1)
                }
            },
            _ = cancel.cancelled() => {
                info!("Cancelling command: {}", spec.command);
                self.terminate(&mut child).await;
                OutcomeStatus::Cancelled
            }
            _ = &mut timeout_fut => {
                warn!(
                    "Command timed out after {:?}: {}",
                    spec.timeout.unwrap_or_default(),
                    spec.command
                );
                self.terminate(&mut child).await;
                OutcomeStatus::TimedOut
            }
        };

        let stdout = collect_capture(stdout_task).await;
        let stderr = collect_capture(stderr_task).await;

        ExecutionOutcome {
            status,
            stdout,
            stderr,
            duration: start.elapsed(),
        }
    }

    /// Terminate-then-kill escalation for the child and, best effort, the
    /// process group it leads.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Negative pid signals the whole group.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
            if timeout(self.config.kill_grace, child.wait()).await.is_ok() {
                return;
            }
            warn!("Process {} ignored SIGTERM, killing", pid);
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill process: {}", e);
        }
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn exit_status_to_outcome(status: std::process::ExitStatus) -> OutcomeStatus {
    if let Some(code) = status.code() {
        return OutcomeStatus::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return OutcomeStatus::Signaled(signal);
        }
    }
    OutcomeStatus::Exited(-1)
}

async fn read_stream<R: AsyncRead + Unpin>(
    stream: R,
    kind: OutputStream,
    limit: usize,
    tx: Option<mpsc::Sender<OutputChunk>>,
) -> CaptureBuffer {
    let mut buffer = CaptureBuffer::new(limit);
    let reader = BufReader::new(stream);
    let mut lines = reader.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        buffer.push_line(&line);
        if let Some(tx) = &tx {
            // The receiver may be gone; capture continues regardless.
            let _ = tx
                .send(OutputChunk {
                    stream: kind,
                    line,
                })
                .await;
        }
    }

    buffer
}

async fn collect_capture(
    task: Option<tokio::task::JoinHandle<CaptureBuffer>>,
) -> CapturedOutput {
    match task {
        Some(handle) => match handle.await {
            Ok(buffer) => buffer.finish(),
            Err(_) => CapturedOutput::default(),
        },
        None => CapturedOutput::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(command: &str, dir: &TempDir) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            working_dir: dir.path().to_path_buf(),
            env: Vec::new(),
            timeout: None,
        }
    }

    #[test]
    fn test_capture_buffer_bound() {
        let mut buffer = CaptureBuffer::new(10);
        buffer.push_line("0123456789abcdef");
        let captured = buffer.finish();
        assert!(captured.truncated);
        assert_eq!(captured.text.len(), 10 + TRUNCATION_MARKER.len());
        assert!(captured.text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_capture_buffer_under_bound() {
        let mut buffer = CaptureBuffer::new(64);
        buffer.push_line("hello");
        buffer.push_line("world");
        let captured = buffer.finish();
        assert!(!captured.truncated);
        assert_eq!(captured.text, "hello\nworld\n");
    }

    #[test]
    fn test_capture_buffer_respects_char_boundaries() {
        let mut buffer = CaptureBuffer::new(5);
        buffer.push_line("aé日本");
        let captured = buffer.finish();
        assert!(captured.truncated);
        assert!(captured.text.len() <= 5 + TRUNCATION_MARKER.len());
        // Must still be valid UTF-8 (String guarantees it; check no panic happened).
        assert!(captured.text.starts_with('a'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new();
        let cancel = CancellationToken::new();

        let outcome = runner.run(&spec("echo hello", &dir), None, &cancel).await;
        assert_eq!(outcome.status, OutcomeStatus::Exited(0));
        assert!(outcome.is_success());
        assert_eq!(outcome.stdout.text, "hello\n");
        assert_eq!(outcome.stderr.text, "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new();
        let cancel = CancellationToken::new();

        let outcome = runner
            .run(&spec("echo oops >&2; exit 3", &dir), None, &cancel)
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Exited(3));
        assert!(!outcome.is_success());
        assert_eq!(outcome.stderr.text, "oops\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_timeout() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::with_config(RunnerConfig {
            max_capture_bytes: 1024,
            kill_grace: Duration::from_millis(200),
        });
        let cancel = CancellationToken::new();

        let mut command = spec("sleep 30", &dir);
        command.timeout = Some(Duration::from_millis(100));
        let start = Instant::now();
        let outcome = runner.run(&command, None, &cancel).await;
        assert_eq!(outcome.status, OutcomeStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_cancellation() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::with_config(RunnerConfig {
            max_capture_bytes: 1024,
            kill_grace: Duration::from_millis(200),
        });
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let outcome = runner.run(&spec("sleep 30", &dir), None, &cancel).await;
        assert_eq!(outcome.status, OutcomeStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_run_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new();
        let cancel = CancellationToken::new();

        let mut command = spec("echo hello", &dir);
        command.working_dir = dir.path().join("does-not-exist");
        let outcome = runner.run(&command, None, &cancel).await;
        assert!(matches!(outcome.status, OutcomeStatus::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_truncates_output() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::with_config(RunnerConfig {
            max_capture_bytes: 64,
            kill_grace: Duration::from_millis(200),
        });
        let cancel = CancellationToken::new();

        let command = spec(
            "i=0; while [ $i -lt 50 ]; do echo 0123456789; i=$((i+1)); done",
            &dir,
        );
        let outcome = runner.run(&command, None, &cancel).await;
        assert_eq!(outcome.status, OutcomeStatus::Exited(0));
        assert!(outcome.stdout.truncated);
        assert!(outcome.stdout.text.len() <= 64 + TRUNCATION_MARKER.len());
        assert!(outcome.stdout.text.ends_with(TRUNCATION_MARKER));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_streams_output_incrementally() {
        let dir = TempDir::new().unwrap();
        let runner = CommandRunner::new();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);

        let outcome = runner
            .run(&spec("echo one; echo two", &dir), Some(tx), &cancel)
            .await;
        assert!(outcome.is_success());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.line, "one");
        assert_eq!(first.stream, OutputStream::Stdout);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.line, "two");
        assert!(rx.recv().await.is_none());
    }
}
