//! Agent runtime
//!
//! Owns the session and the worker and shuttles events between them:
//! task assignments flow from the session to the worker, results and
//! progress flow back out. Results produced while disconnected are held
//! and flushed on the next successful connection; progress and busy
//! frames are only meaningful live and are dropped instead.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::config::AgentConfig;
use relay_core::protocol::ClientMessage;
use repo_sync::RepoSync;
use task_runner::{CommandRunner, RunnerConfig, TaskWorker, WorkerConfig, WorkerEvent};

use crate::session::{
    ConnectionSession, SessionConfig, SessionError, SessionEvent, SessionHandle,
};
use crate::transport::{Connector, WsConnector};

/// Top-level agent process: one session, one worker.
pub struct AgentRuntime {
    config: AgentConfig,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig, shutdown: CancellationToken) -> Self {
        Self { config, shutdown }
    }

    /// Run until shutdown or a fatal session error.
    pub async fn run(self) -> Result<(), SessionError> {
        let endpoint = self
            .config
            .endpoint()
            .expect("configuration was validated at startup");
        let session_config = SessionConfig {
            endpoint,
            agent_name: self.config.name.clone(),
            heartbeat_interval: self.config.heartbeat_interval(),
            reconnect_base: self.config.reconnect_base(),
            reconnect_cap: self.config.reconnect_cap(),
            max_reconnect_attempts: self.config.max_reconnect_attempts,
        };
        self.run_with(session_config, Box::new(WsConnector)).await
    }

    async fn run_with(
        self,
        session_config: SessionConfig,
        connector: Box<dyn Connector>,
    ) -> Result<(), SessionError> {
        let (session, handle, mut session_events) =
            ConnectionSession::new(session_config, connector, self.shutdown.clone());

        let worker_config = WorkerConfig {
            workspace_root: self.config.workspace_root.clone(),
            default_timeout: self.config.default_timeout(),
            progress_interval: self.config.progress_interval(),
        };
        let runner = CommandRunner::with_config(RunnerConfig {
            max_capture_bytes: self.config.max_capture_bytes,
            ..RunnerConfig::default()
        });
        let (worker, assignments, mut worker_events) = TaskWorker::new(
            worker_config,
            Arc::new(RepoSync::new()),
            Arc::new(runner),
            self.shutdown.clone(),
        );

        let mut session_task = tokio::spawn(session.run());
        let worker_task = tokio::spawn(worker.run());

        // Results that could not be delivered; flushed on reconnect.
        let mut pending: VecDeque<ClientMessage> = VecDeque::new();

        let outcome = loop {
            tokio::select! {
                Some(event) = session_events.recv() => {
                    self.handle_session_event(event, &handle, &assignments, &mut pending).await;
                }
                Some(event) = worker_events.recv() => {
                    self.handle_worker_event(event, &handle, &mut pending).await;
                }
                result = &mut session_task => {
                    break result.unwrap_or(Err(SessionError::Closed));
                }
            }
        };

        // Take the worker down with us so a fatal session error does not
        // leave a task running headless.
        self.shutdown.cancel();
        drop(assignments);
        let _ = worker_task.await;

        if !pending.is_empty() {
            warn!("Discarding {} undelivered result frame(s)", pending.len());
        }

        outcome
    }

    async fn handle_session_event(
        &self,
        event: SessionEvent,
        handle: &SessionHandle,
        assignments: &mpsc::Sender<relay_core::task::Task>,
        pending: &mut VecDeque<ClientMessage>,
    ) {
        match event {
            SessionEvent::Connected => {
                if !pending.is_empty() {
                    info!("Flushing {} held result frame(s)", pending.len());
                }
                while let Some(message) = pending.pop_front() {
                    if let Err(e) = handle.send(message.clone()).await {
                        debug!("Flush interrupted: {}", e);
                        pending.push_front(message);
                        break;
                    }
                }
            }
            SessionEvent::Disconnected { reason } => {
                debug!("Session disconnected: {}", reason);
            }
            SessionEvent::Message(message) => {
                if let Some(task) = message.into_task() {
                    if assignments.send(task).await.is_err() {
                        error!("Worker is gone; dropping assignment");
                    }
                }
            }
        }
    }

    async fn handle_worker_event(
        &self,
        event: WorkerEvent,
        handle: &SessionHandle,
        pending: &mut VecDeque<ClientMessage>,
    ) {
        let (message, hold_on_failure) = match event {
            WorkerEvent::Busy {
                task_id,
                running_task_id,
            } => (
                ClientMessage::TaskBusy {
                    task_id,
                    running_task_id,
                },
                false,
            ),
            WorkerEvent::Progress {
                task_id,
                stream,
                chunk,
            } => (
                ClientMessage::TaskProgress {
                    task_id,
                    stream,
                    chunk,
                },
                false,
            ),
            WorkerEvent::Finished(result) => {
                info!(
                    "Task {} finished with status {:?}",
                    result.task_id, result.status
                );
                (ClientMessage::TaskResult { result }, true)
            }
        };

        if let Err(e) = handle.send(message.clone()).await {
            if hold_on_failure {
                debug!("Holding result frame until reconnect: {}", e);
                pending.push_back(message);
            } else {
                debug!("Dropping frame while disconnected: {}", e);
            }
        }
    }
}
