//! Push-side position source: one stream subscription per account whose
//! JSON frames carry full open-trades snapshots.

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PositionReconciler, SourceStatus};
use crate::auth::TokenProvider;
use crate::stream::{StreamConfig, StreamConnection, StreamFrame, StreamHandle, Transport};
use crate::types::{ConnectionStatus, OpenTradesSnapshot, ReconnectState};
use crate::wire::{Decoded, MessageKind};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PushMessage {
    OpenTrades { data: OpenTradesSnapshot },
    #[serde(other)]
    Other,
}

/// Subscribe frame for `account`'s open-trades channel
pub fn subscribe_payload(account: &str) -> String {
    serde_json::json!({
        "type": "subscribe",
        "channel": "open_trades",
        "account": account,
    })
    .to_string()
}

/// Running push feed for one account
pub struct PositionFeed {
    account: String,
    handle: StreamHandle,
    pump: JoinHandle<()>,
}

impl PositionFeed {
    /// Default stream settings for `account` on `endpoint`; adjust policy/ping before `start`
    pub fn stream_config(endpoint: &str, account: &str) -> StreamConfig {
        StreamConfig::new(endpoint, subscribe_payload(account), MessageKind::Control)
    }

    pub fn start(
        account: &str,
        config: StreamConfig,
        buffer: usize,
        tokens: Arc<dyn TokenProvider>,
        transport: Arc<dyn Transport>,
        reconciler: PositionReconciler,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(buffer.max(1));
        let handle = StreamConnection::spawn(config, tokens, transport, frames_tx);
        info!(account = %account, subscription = %handle.id(), "Position feed started");

        let pump = tokio::spawn(pump(
            account.to_string(),
            frames_rx,
            handle.watch_state(),
            reconciler,
        ));

        Self {
            account: account.to_string(),
            handle,
            pump,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn state(&self) -> ReconnectState {
        self.handle.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ReconnectState> {
        self.handle.watch_state()
    }

    pub fn reconnect(&self) {
        self.handle.reconnect();
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        if let Err(e) = self.pump.await {
            warn!(account = %self.account, error = %e, "Position pump ended abnormally");
        }
        info!(account = %self.account, "Position feed stopped");
    }
}

async fn pump(
    account: String,
    mut frames: mpsc::Receiver<StreamFrame>,
    mut state: watch::Receiver<ReconnectState>,
    reconciler: PositionReconciler,
) {
    let mut state_open = true;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if frame.generation != state.borrow().generation {
                    debug!(account = %account, generation = frame.generation, "Dropping frame from superseded connection");
                    continue;
                }
                if let Some(snapshot) = snapshot_from(&account, frame.payload) {
                    reconciler.on_push(snapshot).await;
                }
            }
            changed = state.changed(), if state_open => {
                if changed.is_err() {
                    state_open = false;
                    continue;
                }
                let current = *state.borrow_and_update();
                match current.status {
                    ConnectionStatus::Error => {
                        reconciler.set_push_health(&account, SourceStatus::Failing).await;
                    }
                    ConnectionStatus::Disconnected if current.attempt > 0 => {
                        reconciler.set_push_health(&account, SourceStatus::Failing).await;
                    }
                    _ => {}
                }
            }
        }
    }
}

fn snapshot_from(account: &str, payload: Decoded) -> Option<OpenTradesSnapshot> {
    let Decoded::Control(value) = payload else {
        return None;
    };

    match serde_json::from_value::<PushMessage>(value) {
        Ok(PushMessage::OpenTrades { mut data }) => {
            if data.account.is_empty() {
                data.account = account.to_string();
            }
            if data.account != account {
                warn!(account = %account, other = %data.account, "Ignoring snapshot for another account");
                return None;
            }
            Some(data)
        }
        Ok(PushMessage::Other) => None,
        Err(e) => {
            warn!(account = %account, error = %e, "Dropping malformed position message");
            None
        }
    }
}
