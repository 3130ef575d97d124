//! Single-task worker loop
//!
//! Accepts task assignments one at a time. An assignment that arrives
//! while another task runs is rejected immediately rather than queued,
//! so the server always knows which task the agent is on. Each task gets
//! its repository synced into the named workspace before its command
//! runs, and output is batched into periodic progress events.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use relay_core::protocol::OutputStream;
use relay_core::task::{Task, TaskResult, TaskStatus};
use repo_sync::RepoSync;

use crate::event::WorkerEvent;
use crate::process::{CommandRunner, CommandSpec, OutcomeStatus, OutputChunk};

/// Environment variable exposing the task id to the command.
pub const TASK_ID_ENV: &str = "RELAY_TASK_ID";

/// Configuration for the task worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root under which named workspaces are created.
    pub workspace_root: PathBuf,
    /// Applied when a task carries no timeout of its own.
    pub default_timeout: Duration,
    /// Minimum spacing between progress events per task.
    pub progress_interval: Duration,
}

/// Runs assigned tasks sequentially and reports their lifecycle
pub struct TaskWorker {
    config: WorkerConfig,
    sync: Arc<RepoSync>,
    runner: Arc<CommandRunner>,
    shutdown: CancellationToken,
    assignments_rx: mpsc::Receiver<Task>,
    events_tx: mpsc::Sender<WorkerEvent>,
    done_tx: mpsc::Sender<TaskResult>,
    done_rx: mpsc::Receiver<TaskResult>,
    current: Option<(Uuid, CancellationToken)>,
}

impl TaskWorker {
    /// Create a worker together with its assignment sender and event
    /// receiver.
    pub fn new(
        config: WorkerConfig,
        sync: Arc<RepoSync>,
        runner: Arc<CommandRunner>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Sender<Task>, mpsc::Receiver<WorkerEvent>) {
        let (assignments_tx, assignments_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (done_tx, done_rx) = mpsc::channel(1);
        let worker = Self {
            config,
            sync,
            runner,
            shutdown,
            assignments_rx,
            events_tx,
            done_tx,
            done_rx,
            current: None,
        };
        (worker, assignments_tx, events_rx)
    }

    /// Drive the worker until shutdown. Consumes the worker.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                task = self.assignments_rx.recv() => match task {
                    Some(task) => self.handle_assignment(task).await,
                    None => break,
                },
                // done_tx is held by self, so recv cannot return None here.
                Some(result) = self.done_rx.recv() => {
                    self.current = None;
                    self.emit(WorkerEvent::Finished(result)).await;
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Let a running task observe cancellation and report its result.
        if let Some((task_id, cancel)) = self.current.take() {
            info!("Shutting down, cancelling task {}", task_id);
            cancel.cancel();
            if let Some(result) = self.done_rx.recv().await {
                self.emit(WorkerEvent::Finished(result)).await;
            }
        }
    }

    async fn handle_assignment(&mut self, task: Task) {
        if let Some((running_task_id, _)) = &self.current {
            warn!(
                "Rejecting task {}: already running {}",
                task.id, running_task_id
            );
            let event = WorkerEvent::Busy {
                task_id: task.id,
                running_task_id: *running_task_id,
            };
            self.emit(event).await;
            return;
        }

        info!("Accepted task {}: {}", task.id, task.command);
        let cancel = self.shutdown.child_token();
        self.current = Some((task.id, cancel.clone()));

        let config = self.config.clone();
        let sync = Arc::clone(&self.sync);
        let runner = Arc::clone(&self.runner);
        let events_tx = self.events_tx.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let result = run_task(task, config, sync, runner, events_tx, cancel).await;
            let _ = done_tx.send(result).await;
        });
    }

    async fn emit(&self, event: WorkerEvent) {
        if self.events_tx.send(event).await.is_err() {
            error!("Worker event receiver dropped");
        }
    }
}

async fn run_task(
    task: Task,
    config: WorkerConfig,
    sync: Arc<RepoSync>,
    runner: Arc<CommandRunner>,
    events_tx: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
) -> TaskResult {
    let started_at = Utc::now();

    let working_dir = match prepare_workspace(&task, &config, &sync).await {
        Ok(dir) => dir,
        Err(e) => {
            error!("Task {} preparation failed: {}", task.id, e);
            return TaskResult::failed(task.id, started_at, e.to_string());
        }
    };

    let (chunk_tx, chunk_rx) = mpsc::channel::<OutputChunk>(256);
    let forwarder = tokio::spawn(forward_progress(
        task.id,
        chunk_rx,
        events_tx,
        config.progress_interval,
    ));

    let mut env: Vec<(String, String)> = task.env.clone().into_iter().collect();
    env.push((TASK_ID_ENV.to_string(), task.id.to_string()));

    let spec = CommandSpec {
        command: task.command.clone(),
        working_dir,
        env,
        timeout: task
            .timeout_secs
            .map(Duration::from_secs)
            .or(Some(config.default_timeout)),
    };

    let outcome = runner.run(&spec, Some(chunk_tx), &cancel).await;
    // Flush any buffered progress before the final result.
    let _ = forwarder.await;

    debug!(
        "Task {} finished in {:?}: {:?}",
        task.id, outcome.duration, outcome.status
    );

    let (status, exit_code, spawn_error) = match outcome.status {
        OutcomeStatus::Exited(0) => (TaskStatus::Success, Some(0), None),
        OutcomeStatus::Exited(code) => (TaskStatus::Failure, Some(code), None),
        OutcomeStatus::Signaled(signal) => {
            warn!("Task {} killed by signal {}", task.id, signal);
            (TaskStatus::Failure, None, None)
        }
        OutcomeStatus::TimedOut => (TaskStatus::TimedOut, None, None),
        OutcomeStatus::Cancelled => (TaskStatus::Cancelled, None, None),
        OutcomeStatus::SpawnFailed { message } => (TaskStatus::Failure, None, Some(message)),
    };

    let mut stderr = outcome.stderr.text;
    if let Some(message) = spawn_error {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&format!("failed to start command: {}", message));
    }

    TaskResult {
        task_id: task.id,
        status,
        exit_code,
        stdout: outcome.stdout.text,
        stderr,
        stdout_truncated: outcome.stdout.truncated,
        stderr_truncated: outcome.stderr.truncated,
        started_at,
        finished_at: Utc::now(),
    }
}

/// Create the workspace directory and, when the task names a repository,
/// sync it and return the checkout as the working directory.
async fn prepare_workspace(
    task: &Task,
    config: &WorkerConfig,
    sync: &RepoSync,
) -> crate::Result<PathBuf> {
    let task_dir = config.workspace_root.join(&task.workspace);
    tokio::fs::create_dir_all(&task_dir).await?;

    match &task.repo_url {
        Some(url) => {
            let dest = task_dir.join(RepoSync::repo_dir_name(url));
            sync.sync(url, &task.repo_ref, &dest).await?;
            Ok(dest)
        }
        None => Ok(task_dir),
    }
}

/// Batch raw output lines into progress events, at most one per stream
/// per interval.
async fn forward_progress(
    task_id: Uuid,
    mut chunk_rx: mpsc::Receiver<OutputChunk>,
    events_tx: mpsc::Sender<WorkerEvent>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // first tick is immediate

    let mut pending_stdout = String::new();
    let mut pending_stderr = String::new();

    loop {
        tokio::select! {
            chunk = chunk_rx.recv() => match chunk {
                Some(chunk) => {
                    let pending = match chunk.stream {
                        OutputStream::Stdout => &mut pending_stdout,
                        OutputStream::Stderr => &mut pending_stderr,
                    };
                    pending.push_str(&chunk.line);
                    pending.push('\n');
                }
                None => break,
            },
            _ = ticker.tick() => {
                flush(task_id, OutputStream::Stdout, &mut pending_stdout, &events_tx).await;
                flush(task_id, OutputStream::Stderr, &mut pending_stderr, &events_tx).await;
            }
        }
    }

    flush(task_id, OutputStream::Stdout, &mut pending_stdout, &events_tx).await;
    flush(task_id, OutputStream::Stderr, &mut pending_stderr, &events_tx).await;
}

async fn flush(
    task_id: Uuid,
    stream: OutputStream,
    pending: &mut String,
    events_tx: &mpsc::Sender<WorkerEvent>,
) {
    if pending.is_empty() {
        return;
    }
    let event = WorkerEvent::Progress {
        task_id,
        stream,
        chunk: std::mem::take(pending),
    };
    let _ = events_tx.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_task(command: &str) -> Task {
        Task {
            id: Uuid::new_v4(),
            repo_url: None,
            repo_ref: "main".to_string(),
            workspace: "default".to_string(),
            command: command.to_string(),
            timeout_secs: None,
            env: HashMap::new(),
        }
    }

    fn spawn_worker(root: &TempDir) -> (mpsc::Sender<Task>, mpsc::Receiver<WorkerEvent>, CancellationToken) {
        let config = WorkerConfig {
            workspace_root: root.path().to_path_buf(),
            default_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(50),
        };
        let shutdown = CancellationToken::new();
        let (worker, assignments, events) = TaskWorker::new(
            config,
            Arc::new(RepoSync::new()),
            Arc::new(CommandRunner::new()),
            shutdown.clone(),
        );
        tokio::spawn(worker.run());
        (assignments, events, shutdown)
    }

    async fn next_finished(events: &mut mpsc::Receiver<WorkerEvent>) -> TaskResult {
        loop {
            let event = timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for worker event")
                .expect("worker event channel closed");
            if let WorkerEvent::Finished(result) = event {
                return result;
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_command_and_reports_result() {
        let root = TempDir::new().unwrap();
        let (assignments, mut events, _shutdown) = spawn_worker(&root);

        let task = test_task("echo hello");
        let task_id = task.id;
        assignments.send(task).await.unwrap();

        let result = next_finished(&mut events).await;
        assert_eq!(result.task_id, task_id);
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert!(root.path().join("default").is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejects_assignment_while_busy() {
        let root = TempDir::new().unwrap();
        let (assignments, mut events, _shutdown) = spawn_worker(&root);

        let long = test_task("sleep 5");
        let long_id = long.id;
        assignments.send(long).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = test_task("echo hi");
        let second_id = second.id;
        assignments.send(second).await.unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            WorkerEvent::Busy {
                task_id,
                running_task_id,
            } => {
                assert_eq!(task_id, second_id);
                assert_eq!(running_task_id, long_id);
            }
            other => panic!("expected busy rejection, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_cancels_running_task() {
        let root = TempDir::new().unwrap();
        let (assignments, mut events, shutdown) = spawn_worker(&root);

        let task = test_task("sleep 30");
        assignments.send(task).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();

        let result = next_finished(&mut events).await;
        assert_eq!(result.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_reports_failure_for_bad_repository() {
        let root = TempDir::new().unwrap();
        let (assignments, mut events, _shutdown) = spawn_worker(&root);

        let mut task = test_task("echo hi");
        task.repo_url = Some(format!(
            "file://{}/no-such-repo",
            root.path().display()
        ));
        assignments.send(task).await.unwrap();

        let result = timeout(Duration::from_secs(60), next_finished(&mut events))
            .await
            .expect("sync failure should resolve");
        assert_eq!(result.status, TaskStatus::Failure);
        assert!(!result.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streams_progress_before_result() {
        let root = TempDir::new().unwrap();
        let (assignments, mut events, _shutdown) = spawn_worker(&root);

        let task = test_task("echo chunk; sleep 1");
        let task_id = task.id;
        assignments.send(task).await.unwrap();

        let mut saw_progress = false;
        loop {
            let event = timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                WorkerEvent::Progress {
                    task_id: id,
                    stream,
                    chunk,
                } => {
                    assert_eq!(id, task_id);
                    assert_eq!(stream, OutputStream::Stdout);
                    assert!(chunk.contains("chunk"));
                    saw_progress = true;
                }
                WorkerEvent::Finished(result) => {
                    assert_eq!(result.status, TaskStatus::Success);
                    break;
                }
                WorkerEvent::Busy { .. } => panic!("unexpected busy event"),
            }
        }
        assert!(saw_progress);
    }
}
