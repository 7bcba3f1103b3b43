//! Stream Connection Manager
//!
//! Owns one logical subscription: acquires a token, opens the transport,
//! sends the subscribe frame, routes decoded frames to the consumer and runs
//! the reconnect/backoff state machine:
//!
//! ```text
//! disconnected -> connecting -> connected -> (disconnected | error)
//! ```
//!
//! Each subscription runs in its own task so one stalled symbol never
//! affects another.

pub mod ws;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::error::FeedError;
use crate::types::{ConnectionStatus, ReconnectState};
use crate::wire::{self, Decoded, MessageKind};

pub use ws::WsTransport;

pub type SubscriptionId = Uuid;

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Event reported by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(String),
    /// Remote close, with the reason if one was given
    Closed(Option<String>),
    Error(String),
}

/// Opens connections to a URL
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportConnection>, FeedError>;
}

/// One open text-frame connection
#[async_trait]
pub trait TransportConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), FeedError>;

    /// Next inbound event; `None` once the connection is gone.
    /// Must be cancel-safe.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    async fn ping(&mut self) -> Result<(), FeedError> {
        Ok(())
    }

    /// Clean, caller-initiated close
    async fn close(&mut self);
}

/// Exponential backoff with a cap and a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Static description of one subscription
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint: String,
    /// Query-string parameter carrying the auth token
    pub auth_param: String,
    /// Sent once every time the transport opens
    pub subscribe_payload: String,
    pub kind: MessageKind,
    pub policy: ReconnectPolicy,
    pub ping_interval: Duration,
}

impl StreamConfig {
    pub fn new(
        endpoint: impl Into<String>,
        subscribe_payload: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_param: "token".to_string(),
            subscribe_payload: subscribe_payload.into(),
            kind,
            policy: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(20),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

/// Decoded frame tagged with the transport generation that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFrame {
    pub subscription: SubscriptionId,
    pub generation: u64,
    pub payload: Decoded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Reconnect,
    Shutdown,
}

/// Caller side of a running subscription
pub struct StreamHandle {
    id: SubscriptionId,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ReconnectState>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn state(&self) -> ReconnectState {
        *self.state.borrow()
    }

    /// Receiver for `onConnectionStatus`-style observers
    pub fn watch_state(&self) -> watch::Receiver<ReconnectState> {
        self.state.clone()
    }

    /// True if `frame` comes from the live transport generation
    pub fn is_current(&self, frame: &StreamFrame) -> bool {
        frame.subscription == self.id && frame.generation == self.state.borrow().generation
    }

    /// Reset the attempt counter and reconnect now, from any state
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Clean close. Cancels any pending backoff timer; never reconnects.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!(subscription = %self.id, error = %e, "Stream task ended abnormally");
        }
    }
}

/// Spawns and drives subscriptions
pub struct StreamConnection;

impl StreamConnection {
    /// Start a subscription; decoded frames are sent to `frames`.
    pub fn spawn(
        config: StreamConfig,
        tokens: Arc<dyn TokenProvider>,
        transport: Arc<dyn Transport>,
        frames: mpsc::Sender<StreamFrame>,
    ) -> StreamHandle {
        let id = Uuid::new_v4();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ReconnectState::new(config.policy.max_attempts));

        let task = StreamTask {
            id,
            config,
            tokens,
            transport,
            frames,
            commands: command_rx,
            state: state_tx,
        };
        let task = tokio::spawn(task.run());

        StreamHandle {
            id,
            commands: command_tx,
            state: state_rx,
            task,
        }
    }
}

enum Outcome {
    /// Caller asked to stop, or the consumer went away
    Shutdown,
    ManualReconnect,
    /// Unexpected close or failed connect
    Lost { delivered: bool },
}

struct StreamTask {
    id: SubscriptionId,
    config: StreamConfig,
    tokens: Arc<dyn TokenProvider>,
    transport: Arc<dyn Transport>,
    frames: mpsc::Sender<StreamFrame>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ReconnectState>,
}

impl StreamTask {
    async fn run(mut self) {
        let policy = self.config.policy;
        let mut attempt = 0u32;
        let mut generation = 0u64;
        let mut force_token = false;

        info!(subscription = %self.id, endpoint = %self.config.endpoint, "Starting stream");

        loop {
            generation += 1;
            self.publish(ConnectionStatus::Connecting, attempt, generation);

            match self.connect_and_serve(force_token, attempt, generation).await {
                Outcome::Shutdown => break,
                Outcome::ManualReconnect => {
                    info!(subscription = %self.id, "Manual reconnect requested");
                    attempt = 0;
                    force_token = true;
                    continue;
                }
                Outcome::Lost { delivered } => {
                    if delivered {
                        attempt = 0;
                    }
                }
            }
            force_token = true;

            if attempt >= policy.max_attempts {
                error!(
                    subscription = %self.id,
                    attempts = attempt,
                    "Max reconnection attempts reached, waiting for manual reconnect"
                );
                self.publish(ConnectionStatus::Error, attempt, generation);
                match self.commands.recv().await {
                    Some(Command::Reconnect) => {
                        attempt = 0;
                        continue;
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }

            let delay = policy.delay_for(attempt);
            attempt += 1;
            self.publish(ConnectionStatus::Disconnected, attempt, generation);
            info!(
                subscription = %self.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Reconnect) => attempt = 0,
                    Some(Command::Shutdown) | None => break,
                }
            }
        }

        self.publish(ConnectionStatus::Disconnected, attempt, generation);
        info!(subscription = %self.id, "Stream stopped");
    }

    async fn connect_and_serve(
        &mut self,
        force_token: bool,
        attempt: u32,
        generation: u64,
    ) -> Outcome {
        let token = tokio::select! {
            token = self.tokens.get_token(force_token) => token,
            cmd = self.commands.recv() => return command_outcome(cmd),
        };
        let token = match token {
            Ok(token) => token,
            Err(e) => {
                warn!(subscription = %self.id, error = %e, "Token acquisition failed");
                return Outcome::Lost { delivered: false };
            }
        };

        let url = match authenticated_url(&self.config.endpoint, &self.config.auth_param, &token) {
            Ok(url) => url,
            Err(e) => {
                error!(subscription = %self.id, error = %e, "Invalid stream endpoint");
                return Outcome::Lost { delivered: false };
            }
        };

        let opened = tokio::select! {
            opened = self.transport.open(&url) => opened,
            cmd = self.commands.recv() => return command_outcome(cmd),
        };
        let mut conn = match opened {
            Ok(conn) => conn,
            Err(e) => {
                warn!(subscription = %self.id, error = %e, "Connection failed");
                return Outcome::Lost { delivered: false };
            }
        };

        if let Err(e) = conn.send(self.config.subscribe_payload.clone()).await {
            warn!(subscription = %self.id, error = %e, "Failed to send subscription");
            conn.close().await;
            return Outcome::Lost { delivered: false };
        }

        info!(subscription = %self.id, generation, "Connected");
        self.publish(ConnectionStatus::Connected, attempt, generation);

        let period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut delivered = false;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    conn.close().await;
                    return command_outcome(cmd);
                }
                _ = ping.tick() => {
                    if let Err(e) = conn.ping().await {
                        warn!(subscription = %self.id, error = %e, "Ping failed");
                        conn.close().await;
                        return Outcome::Lost { delivered };
                    }
                }
                event = conn.next_event() => match event {
                    Some(TransportEvent::Message(text)) => {
                        let received_at = chrono::Utc::now().timestamp_millis();
                        match wire::decode(self.config.kind, &text, received_at) {
                            Ok(payload) => {
                                delivered = true;
                                let frame = StreamFrame {
                                    subscription: self.id,
                                    generation,
                                    payload,
                                };
                                if self.frames.send(frame).await.is_err() {
                                    info!(subscription = %self.id, "Frame consumer dropped, closing");
                                    conn.close().await;
                                    return Outcome::Shutdown;
                                }
                            }
                            Err(e) => {
                                warn!(subscription = %self.id, error = %e, "Dropping malformed frame");
                                debug!(subscription = %self.id, raw = %text, "Malformed frame");
                            }
                        }
                    }
                    Some(TransportEvent::Closed(reason)) => {
                        warn!(subscription = %self.id, reason = ?reason, "Connection closed by server");
                        return Outcome::Lost { delivered };
                    }
                    Some(TransportEvent::Error(e)) => {
                        error!(subscription = %self.id, error = %e, "Transport error");
                        conn.close().await;
                        return Outcome::Lost { delivered };
                    }
                    None => {
                        warn!(subscription = %self.id, "Transport stream ended");
                        return Outcome::Lost { delivered };
                    }
                }
            }
        }
    }

    fn publish(&self, status: ConnectionStatus, attempt: u32, generation: u64) {
        self.state.send_replace(ReconnectState {
            status,
            attempt,
            max_attempts: self.config.policy.max_attempts,
            generation,
        });
    }
}

fn command_outcome(cmd: Option<Command>) -> Outcome {
    match cmd {
        Some(Command::Reconnect) => Outcome::ManualReconnect,
        Some(Command::Shutdown) | None => Outcome::Shutdown,
    }
}

/// Append the auth token as a query parameter
pub fn authenticated_url(endpoint: &str, param: &str, token: &str) -> Result<String, FeedError> {
    let mut url = reqwest::Url::parse(endpoint)
        .map_err(|e| FeedError::Config(format!("invalid endpoint {endpoint}: {e}")))?;
    url.query_pairs_mut().append_pair(param, token);
    Ok(url.into())
}
