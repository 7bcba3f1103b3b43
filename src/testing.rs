//! Scripted transport and token fakes shared by unit tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::auth::TokenProvider;
use crate::error::FeedError;
use crate::stream::{Transport, TransportConnection, TransportEvent};

/// What the next `open` call does
pub enum Script {
    Refuse,
    Accept {
        events: Vec<TransportEvent>,
        hold_open: bool,
    },
    /// Events pushed by the test through the paired sender
    Live(mpsc::UnboundedReceiver<TransportEvent>),
    /// Stays open and silent; every keepalive ping fails
    DeadPing,
}

impl Script {
    pub fn closes_immediately() -> Self {
        Script::Accept {
            events: vec![TransportEvent::Closed(None)],
            hold_open: false,
        }
    }

    pub fn idle() -> Self {
        Script::Accept {
            events: Vec::new(),
            hold_open: true,
        }
    }

    pub fn live() -> (Self, mpsc::UnboundedSender<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Script::Live(rx), tx)
    }
}

/// Behaviour once the script queue is empty
#[derive(Debug, Clone, Copy)]
pub enum Fallback {
    Refuse,
    CloseImmediately,
    HoldOpen,
}

pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Fallback,
    opened: mpsc::UnboundedSender<(String, Instant)>,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub closed: Arc<AtomicBool>,
}

impl ScriptedTransport {
    pub fn new(
        scripts: Vec<Script>,
        fallback: Fallback,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Instant)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            opened: tx,
            sent: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        });
        (transport, rx)
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn TransportConnection>, FeedError> {
        let _ = self.opened.send((url.to_string(), Instant::now()));
        let script = self.scripts.lock().unwrap().pop_front();
        let script = script.unwrap_or(match self.fallback {
            Fallback::Refuse => Script::Refuse,
            Fallback::CloseImmediately => Script::closes_immediately(),
            Fallback::HoldOpen => Script::idle(),
        });

        let ping_fails = matches!(script, Script::DeadPing);
        let events = match script {
            Script::Refuse => return Err(FeedError::Transport("refused".to_string())),
            Script::Accept { events, hold_open } => Events::Queue {
                events: events.into(),
                hold_open,
            },
            Script::Live(rx) => Events::Live(rx),
            Script::DeadPing => Events::Queue {
                events: VecDeque::new(),
                hold_open: true,
            },
        };
        Ok(Box::new(ScriptedConnection {
            events,
            ping_fails,
            sent: self.sent.clone(),
            closed: self.closed.clone(),
        }))
    }
}

enum Events {
    Queue {
        events: VecDeque<TransportEvent>,
        hold_open: bool,
    },
    Live(mpsc::UnboundedReceiver<TransportEvent>),
}

struct ScriptedConnection {
    events: Events,
    ping_fails: bool,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportConnection for ScriptedConnection {
    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        match &mut self.events {
            Events::Queue { events, hold_open } => match events.pop_front() {
                Some(event) => Some(event),
                None if *hold_open => std::future::pending().await,
                None => None,
            },
            Events::Live(rx) => rx.recv().await,
        }
    }

    async fn ping(&mut self) -> Result<(), FeedError> {
        if self.ping_fails {
            return Err(FeedError::Transport("ping timed out".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Token provider that fails a set number of times and records `force_refresh`
pub struct RecordingTokens {
    failures_left: Mutex<u32>,
    pub forced: Mutex<Vec<bool>>,
}

impl RecordingTokens {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: Mutex::new(failures),
            forced: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TokenProvider for RecordingTokens {
    async fn get_token(&self, force_refresh: bool) -> Result<String, FeedError> {
        self.forced.lock().unwrap().push(force_refresh);
        let mut left = self.failures_left.lock().unwrap();
        if *left > 0 {
            *left -= 1;
            return Err(FeedError::Auth("expired".to_string()));
        }
        Ok("tok".to_string())
    }
}
