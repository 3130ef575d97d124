//! Connection session management
//!
//! One session outlives many connections. The run loop connects,
//! authenticates, heartbeats and receives frames until the connection
//! drops, then backs off and reconnects, forever (or until the attempt
//! limit). Only a rejected token ends the session early; everything
//! else is treated as transient.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use relay_core::protocol::{ClientMessage, ServerMessage, AUTH_REJECTED, MALFORMED_FRAME};

use crate::backoff::Backoff;
use crate::transport::{Connector, Transport, TransportError};

/// Errors that end the session permanently.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server rejected the authentication token. Not retried.
    #[error("authentication rejected: {message}")]
    AuthRejected { message: String },

    /// Gave up after the configured number of consecutive failures.
    #[error("giving up after {attempts} failed connection attempts")]
    RetriesExhausted { attempts: u32 },

    /// An outbound send was attempted while disconnected.
    #[error("not connected")]
    NotConnected,

    /// The session loop is gone.
    #[error("session closed")]
    Closed,
}

/// Where the session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet started.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport is up; waiting for the server's verdict on the token.
    Authenticating,
    /// Authenticated and exchanging frames.
    Connected,
    /// Lost the connection; waiting out the backoff delay.
    Reconnecting,
    /// Terminal.
    ShuttingDown,
}

/// What the session reports to the runtime.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed; outbound sends will now succeed.
    Connected,
    /// The connection dropped; the session is about to back off.
    Disconnected { reason: String },
    /// A frame from the server, already decoded.
    Message(ServerMessage),
}

/// Session parameters, extracted from the agent configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connect URL including the token and name query parameters.
    pub endpoint: Url,
    /// Display name sent in the register frame.
    pub agent_name: String,
    pub heartbeat_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// 0 retries forever.
    pub max_reconnect_attempts: u32,
}

/// Heartbeat bookkeeping for one connection.
///
/// The liveness rule is miss-one: if the previous heartbeat is still
/// unacknowledged when the next one is due, the connection is declared
/// dead.
#[derive(Debug, Default)]
struct HeartbeatRecord {
    last_sent: Option<u64>,
    last_acked: Option<u64>,
}

impl HeartbeatRecord {
    fn pending(&self) -> bool {
        match self.last_sent {
            Some(sent) => self.last_acked.map_or(true, |acked| acked < sent),
            None => false,
        }
    }

    fn record_ack(&mut self, seq: u64) {
        if self.last_acked.map_or(true, |acked| seq > acked) {
            self.last_acked = Some(seq);
        }
    }
}

/// Cloneable handle for sending frames to the server.
#[derive(Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<ClientMessage>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Queue a frame for the current connection. Fails immediately when
    /// disconnected; the caller decides whether the frame is worth
    /// holding for later.
    pub async fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        if self.state() != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// How one connection ended.
enum DriveEnd {
    Shutdown,
    Lost(String),
    Fatal(SessionError),
}

/// What to do after one inbound frame.
enum FrameAction {
    Continue,
    Reply(ClientMessage),
    End(DriveEnd),
}

/// Owns the connect/heartbeat/reconnect loop.
pub struct ConnectionSession {
    config: SessionConfig,
    connector: Box<dyn Connector>,
    shutdown: CancellationToken,
    outbound_rx: mpsc::Receiver<ClientMessage>,
    events_tx: mpsc::Sender<SessionEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionSession {
    pub fn new(
        config: SessionConfig,
        connector: Box<dyn Connector>,
        shutdown: CancellationToken,
    ) -> (Self, SessionHandle, mpsc::Receiver<SessionEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let session = Self {
            config,
            connector,
            shutdown,
            outbound_rx,
            events_tx,
            state_tx,
        };
        let handle = SessionHandle {
            outbound: outbound_tx,
            state: state_rx,
        };
        (session, handle, events_rx)
    }

    /// Run until shutdown, a rejected token, or retry exhaustion.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut backoff = Backoff::new(self.config.reconnect_base, self.config.reconnect_cap);

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            info!("Connecting to {}", redacted(&self.config.endpoint));
            match self.connect_and_auth().await {
                Ok(mut transport) => {
                    self.set_state(ConnectionState::Connected);
                    self.emit(SessionEvent::Connected).await;
                    info!("Connected and authenticated");

                    let connected_at = Instant::now();
                    let end = self.drive(transport.as_mut()).await;
                    transport.close().await;
                    self.set_state(ConnectionState::Reconnecting);

                    // A connection that survived a full heartbeat interval
                    // counts as healthy; start the backoff over.
                    if connected_at.elapsed() >= self.config.heartbeat_interval {
                        backoff.reset();
                    }

                    match end {
                        DriveEnd::Shutdown => break,
                        DriveEnd::Fatal(e) => {
                            self.set_state(ConnectionState::ShuttingDown);
                            return Err(e);
                        }
                        DriveEnd::Lost(reason) => {
                            warn!("Connection lost: {}", reason);
                            self.emit(SessionEvent::Disconnected { reason }).await;
                        }
                    }
                }
                Err(ConnectError::Fatal(e)) => {
                    self.set_state(ConnectionState::ShuttingDown);
                    return Err(e);
                }
                Err(ConnectError::Transient(reason)) => {
                    self.set_state(ConnectionState::Reconnecting);
                    warn!("Connection attempt failed: {}", reason);
                    self.emit(SessionEvent::Disconnected { reason }).await;
                }
            }

            let limit = self.config.max_reconnect_attempts;
            if limit > 0 && backoff.attempt() + 1 >= limit {
                self.set_state(ConnectionState::ShuttingDown);
                return Err(SessionError::RetriesExhausted { attempts: limit });
            }

            let delay = backoff.next_delay();
            debug!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.set_state(ConnectionState::ShuttingDown);
        info!("Session shut down");
        Ok(())
    }

    /// Open a transport and wait for the server's verdict on the token.
    ///
    /// The handshake must complete within one heartbeat interval; a
    /// server that accepts the socket but never answers is treated like
    /// a failed connection.
    async fn connect_and_auth(&mut self) -> Result<Box<dyn Transport>, ConnectError> {
        let mut transport = self
            .connector
            .connect(&self.config.endpoint)
            .await
            .map_err(|e| ConnectError::Transient(e.to_string()))?;
        self.set_state(ConnectionState::Authenticating);

        let first = timeout(self.config.heartbeat_interval, transport.recv()).await;
        let verdict = match first {
            Ok(Ok(Some(text))) => text,
            Ok(Ok(None)) => {
                return Err(ConnectError::Transient(
                    "server closed during handshake".to_string(),
                ))
            }
            Ok(Err(e)) => return Err(ConnectError::Transient(e.to_string())),
            Err(_) => {
                transport.close().await;
                return Err(ConnectError::Transient("handshake timed out".to_string()));
            }
        };

        match serde_json::from_str::<ServerMessage>(&verdict) {
            Ok(ServerMessage::Connected { message }) => {
                if !message.is_empty() {
                    debug!("Server greeting: {}", message);
                }
            }
            Ok(ServerMessage::Error { code, message }) if code == AUTH_REJECTED => {
                error!("Authentication rejected: {}", message);
                transport.close().await;
                return Err(ConnectError::Fatal(SessionError::AuthRejected { message }));
            }
            Ok(other) => {
                return Err(ConnectError::Transient(format!(
                    "unexpected handshake frame: {:?}",
                    other
                )))
            }
            Err(e) => {
                return Err(ConnectError::Transient(format!(
                    "malformed handshake frame: {}",
                    e
                )))
            }
        }

        let register = ClientMessage::Register {
            name: self.config.agent_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        };
        send_frame(transport.as_mut(), &register)
            .await
            .map_err(|e| ConnectError::Transient(e.to_string()))?;

        Ok(transport)
    }

    /// Exchange frames on an authenticated connection until it ends.
    async fn drive(&mut self, transport: &mut dyn Transport) -> DriveEnd {
        let mut record = HeartbeatRecord::default();
        let mut seq: u64 = 0;

        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return DriveEnd::Shutdown;
                }
                _ = ticker.tick() => {
                    if record.pending() {
                        return DriveEnd::Lost(format!(
                            "heartbeat {} unacknowledged",
                            record.last_sent.unwrap_or(0)
                        ));
                    }
                    seq += 1;
                    if let Err(e) = send_frame(transport, &ClientMessage::Heartbeat { seq }).await {
                        return DriveEnd::Lost(e.to_string());
                    }
                    record.last_sent = Some(seq);
                }
                Some(message) = self.outbound_rx.recv() => {
                    if let Err(e) = send_frame(transport, &message).await {
                        return DriveEnd::Lost(e.to_string());
                    }
                }
                frame = transport.recv() => match frame {
                    Ok(Some(text)) => match self.handle_frame(&text, &mut record).await {
                        FrameAction::Continue => {}
                        FrameAction::Reply(message) => {
                            if let Err(e) = send_frame(transport, &message).await {
                                return DriveEnd::Lost(e.to_string());
                            }
                        }
                        FrameAction::End(end) => return end,
                    },
                    Ok(None) => return DriveEnd::Lost("connection closed by server".to_string()),
                    Err(e) => return DriveEnd::Lost(e.to_string()),
                },
            }
        }
    }

    /// Decode and dispatch one inbound frame. A frame that cannot be
    /// decoded is dropped and reported back as an `error` frame; the
    /// connection stays up.
    async fn handle_frame(&self, text: &str, record: &mut HeartbeatRecord) -> FrameAction {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return FrameAction::Reply(ClientMessage::Error {
                    code: MALFORMED_FRAME.to_string(),
                    message: e.to_string(),
                });
            }
        };

        match message {
            ServerMessage::HeartbeatAck { seq } => {
                record.record_ack(seq);
                FrameAction::Continue
            }
            ServerMessage::Connected { .. } => {
                debug!("Ignoring duplicate connected frame");
                FrameAction::Continue
            }
            ServerMessage::Error { code, message } if code == AUTH_REJECTED => {
                error!("Authentication revoked: {}", message);
                FrameAction::End(DriveEnd::Fatal(SessionError::AuthRejected { message }))
            }
            ServerMessage::Error { code, message } => {
                warn!("Server error {}: {}", code, message);
                FrameAction::Continue
            }
            assignment @ ServerMessage::TaskAssign { .. } => {
                self.emit(SessionEvent::Message(assignment)).await;
                FrameAction::Continue
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).await.is_err() {
            error!("Session event receiver dropped");
        }
    }
}

enum ConnectError {
    Transient(String),
    Fatal(SessionError),
}

async fn send_frame(
    transport: &mut dyn Transport,
    message: &ClientMessage,
) -> Result<(), TransportError> {
    let text = serde_json::to_string(message)
        .map_err(|e| TransportError(format!("failed to encode frame: {}", e)))?;
    transport.send(text).await
}

/// Endpoint without its query string, safe to log.
fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
