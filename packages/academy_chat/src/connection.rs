//! Connection Manager
//!
//! Owns the single logical transport session: handshake, disconnect
//! detection, and bounded reconnection. Consumers observe every state
//! transition through a watch channel and receive inbound events through
//! a broadcast channel, so they can suspend optimistic sends while
//! disconnected and resume on reconnect.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;
use crate::error::ChatError;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::transport::{Transport, TransportLink};

/// Connection status. Authentication rejection lands in `Failed` without
/// ever passing through `Reconnecting`; transport loss cycles through
/// `Reconnecting` until the retry budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Observable connection state, single instance per client session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: Status,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Authenticated user id, echoed by the server on `connected`.
    pub user_id: Option<String>,
}

impl ConnectionState {
    fn idle() -> Self {
        Self {
            status: Status::Idle,
            retry_count: 0,
            last_error: None,
            user_id: None,
        }
    }
}

/// Commands that can be sent to the connection actor.
enum ConnectionCommand {
    Send {
        event: ClientEvent,
        respond_to: oneshot::Sender<Result<(), ChatError>>,
    },
}

/// Handle to the connection actor. Cloneable; all clones share the one
/// underlying session.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<ConnectionCommand>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ServerEvent>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Current state plus a receiver for observing future transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to the inbound message/typing/read event stream.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Send an event over the live link. Fails with `ConnectionClosed`
    /// while the session is not connected; callers decide whether that
    /// means "mark failed" (messages) or "drop silently" (typing).
    pub async fn send(&self, event: ClientEvent) -> Result<(), ChatError> {
        if self.state.borrow().status != Status::Connected {
            return Err(ChatError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ConnectionCommand::Send {
                event,
                respond_to: tx,
            })
            .await
            .map_err(|_| ChatError::ConnectionClosed)?;
        rx.await.map_err(|_| ChatError::ConnectionClosed)?
    }

    /// Explicit caller-initiated close: cancels every pending timer and
    /// settles the state machine in `Idle`. After this, only a fresh
    /// `ConnectionManager::connect` produces a live session.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Outcome of pumping one live link.
enum LinkEnd {
    /// Caller asked to close; settle in Idle.
    Closed,
    /// Transport dropped; enter the reconnect path.
    Lost(String),
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    credential: String,
    cfg: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ServerEvent>,
    commands: mpsc::Receiver<ConnectionCommand>,
    cancel: CancellationToken,
    retries: u32,
}

impl ConnectionManager {
    /// Establish the session and return its handle. The actor starts in
    /// `Connecting` immediately; the handle's watch channel reports the
    /// handshake outcome.
    pub fn connect(
        transport: Arc<dyn Transport>,
        credential: String,
        cfg: ReconnectConfig,
    ) -> ConnectionHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::idle());
        let (events, _) = broadcast::channel(256);
        let (command_tx, command_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let actor = ConnectionManager {
            transport,
            credential,
            cfg,
            state_tx,
            events: events.clone(),
            commands: command_rx,
            cancel: cancel.clone(),
            retries: 0,
        };
        tokio::spawn(actor.run());

        ConnectionHandle {
            commands: command_tx,
            state: state_rx,
            events,
            cancel,
        }
    }

    async fn run(mut self) {
        loop {
            self.set_status(Status::Connecting);
            match self.open_and_handshake().await {
                Ok((link, user_id)) => {
                    info!("Connected as {}", user_id);
                    self.retries = 0;
                    self.state_tx.send_modify(|s| {
                        s.status = Status::Connected;
                        s.retry_count = 0;
                        s.last_error = None;
                        s.user_id = Some(user_id);
                    });
                    match self.pump_link(link).await {
                        LinkEnd::Closed => {
                            self.set_status(Status::Idle);
                            break;
                        }
                        LinkEnd::Lost(reason) => {
                            if !self.backoff_then_retry(reason).await {
                                break;
                            }
                        }
                    }
                }
                Err(ChatError::ConnectionClosed) => {
                    // Cancelled mid-handshake by an explicit close.
                    self.set_status(Status::Idle);
                    break;
                }
                Err(err) if err.is_fatal() => {
                    warn!("Authentication rejected: {}", err);
                    self.set_failed(err.to_string());
                    break;
                }
                Err(err) => {
                    if !self.backoff_then_retry(err.to_string()).await {
                        break;
                    }
                }
            }
        }
        debug!("Connection actor stopped");
    }

    /// Open a link and run the authenticate handshake. Events received
    /// before `connected`, other than the handshake reply, are discarded.
    async fn open_and_handshake(&self) -> Result<(TransportLink, String), ChatError> {
        let mut link = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ChatError::ConnectionClosed),
            result = self.transport.open() => result?,
        };

        link.outbound
            .send(ClientEvent::Authenticate {
                credential: self.credential.clone(),
            })
            .await
            .map_err(|_| ChatError::Transport("link dropped during handshake".into()))?;

        let deadline = tokio::time::sleep(self.cfg.handshake_timeout());
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ChatError::ConnectionClosed),
                _ = &mut deadline => {
                    return Err(ChatError::Transport("handshake timed out".into()));
                }
                event = link.inbound.recv() => match event {
                    Some(ServerEvent::Connected { user_id }) => return Ok((link, user_id)),
                    Some(ServerEvent::AuthError { message }) => return Err(ChatError::Auth(message)),
                    Some(other) => debug!("Discarding pre-handshake event: {:?}", other),
                    None => {
                        return Err(ChatError::Transport(
                            "connection closed during handshake".into(),
                        ));
                    }
                }
            }
        }
    }

    /// Pump one live link until it drops or the caller closes.
    async fn pump_link(&mut self, mut link: TransportLink) -> LinkEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return LinkEnd::Closed,
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Send { event, respond_to }) => {
                        if link.outbound.send(event).await.is_ok() {
                            let _ = respond_to.send(Ok(()));
                        } else {
                            let _ = respond_to.send(Err(ChatError::ConnectionClosed));
                            return LinkEnd::Lost("link dropped while sending".into());
                        }
                    }
                    None => return LinkEnd::Closed,
                },
                inbound = link.inbound.recv() => match inbound {
                    Some(event) => {
                        let _ = self.events.send(event);
                    }
                    None => return LinkEnd::Lost("server closed the connection".into()),
                },
            }
        }
    }

    /// Enter `Reconnecting`, burn one retry, and wait out the backoff.
    /// Returns false when the session is over (budget exhausted or
    /// cancelled) and the run loop should stop.
    async fn backoff_then_retry(&mut self, reason: String) -> bool {
        self.retries += 1;
        let retries = self.retries;
        self.state_tx.send_modify(|s| {
            s.status = Status::Reconnecting;
            s.retry_count = retries;
            s.last_error = Some(reason.clone());
        });

        if self.retries > self.cfg.max_attempts {
            warn!(
                "Retry budget exhausted after {} attempts: {}",
                self.cfg.max_attempts, reason
            );
            self.set_failed(format!(
                "retry budget exhausted after {} attempts: {}",
                self.cfg.max_attempts, reason
            ));
            return false;
        }

        let delay = self.backoff_delay();
        debug!(
            "Transport lost ({}); retry {}/{} in {:?}",
            reason, self.retries, self.cfg.max_attempts, delay
        );
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.set_status(Status::Idle);
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Exponential backoff from the configured base, capped, with up to
    /// 25% random jitter.
    fn backoff_delay(&self) -> Duration {
        let exponent = self.retries.saturating_sub(1).min(16);
        let scaled = self
            .cfg
            .base_delay()
            .saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        let capped = scaled.min(self.cfg.max_delay());
        let jitter_ms = rand::rng().random_range(0..=(capped.as_millis() as u64 / 4).max(1));
        (capped + Duration::from_millis(jitter_ms)).min(self.cfg.max_delay())
    }

    fn set_status(&self, status: Status) {
        self.state_tx.send_modify(|s| s.status = status);
    }

    fn set_failed(&self, error: String) {
        self.state_tx.send_modify(|s| {
            s.status = Status::Failed;
            s.last_error = Some(error);
        });
    }
}
