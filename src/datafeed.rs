//! Data Feed Facade
//!
//! Coordination layer for a charting consumer: symbol metadata (fetched
//! once), historical bars (delegated to a [`HistorySource`]) and live bars
//! built from the quote stream.
//!
//! Live subscriptions are shared per (symbol, resolution): the first
//! `subscribe_live_bars` opens a stream, further calls attach to it, and the
//! stream is torn down when its last handle is unsubscribed.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::TokenProvider;
use crate::bars::{BarAggregator, BarUpdate};
use crate::error::FeedError;
use crate::stream::{
    ReconnectPolicy, StreamConfig, StreamConnection, StreamFrame, StreamHandle, Transport,
};
use crate::types::{Bar, ChartTradingToggles, PriceTick, ReconnectState, Resolution, SymbolInfo};
use crate::wire::MessageKind;

const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Symbol metadata source
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SymbolSource: Send + Sync {
    async fn fetch_symbols(&self) -> Result<Vec<SymbolInfo>, FeedError>;
}

/// Historical bar source; `from`/`to` are ms timestamps, `to` exclusive
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_bars(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: i64,
        to: i64,
    ) -> Result<Vec<Bar>, FeedError>;
}

/// Quote stream settings shared by every live subscription
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub ws_url: String,
    pub kind: MessageKind,
    pub policy: ReconnectPolicy,
    pub ping_interval: Duration,
    pub channel_buffer_size: usize,
}

impl FeedSettings {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            kind: MessageKind::SingleTick,
            policy: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(20),
            channel_buffer_size: 1024,
        }
    }
}

/// Subscribe frame for `symbol`'s quote channel
pub fn quote_subscribe_payload(symbol: &str) -> String {
    serde_json::json!({
        "type": "subscribe",
        "channel": "quotes",
        "symbol": symbol,
    })
    .to_string()
}

/// Opaque handle returned by `subscribe_live_bars`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiveHandle(Uuid);

impl LiveHandle {
    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for LiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receivers for one live subscription
pub struct LiveBars {
    pub handle: LiveHandle,
    /// New or updated bars, in tick order
    pub bars: broadcast::Receiver<BarUpdate>,
    /// Raw ticks for price/spread display
    pub quotes: broadcast::Receiver<PriceTick>,
    pub status: watch::Receiver<ReconnectState>,
}

type LiveKey = (String, Resolution);

struct LiveStream {
    stream: StreamHandle,
    bars: broadcast::Sender<BarUpdate>,
    quotes: broadcast::Sender<PriceTick>,
    pump: JoinHandle<()>,
    holders: HashSet<LiveHandle>,
}

impl LiveStream {
    fn attach(&mut self, handle: LiveHandle) -> LiveBars {
        self.holders.insert(handle);
        LiveBars {
            handle,
            bars: self.bars.subscribe(),
            quotes: self.quotes.subscribe(),
            status: self.stream.watch_state(),
        }
    }

    async fn shutdown(self) {
        let id = self.stream.id();
        self.stream.shutdown().await;
        if let Err(e) = self.pump.await {
            warn!(subscription = %id, error = %e, "Bar pump ended abnormally");
        }
    }
}

#[derive(Default)]
struct LiveRegistry {
    streams: HashMap<LiveKey, LiveStream>,
    handles: HashMap<LiveHandle, LiveKey>,
}

/// Data feed facade
pub struct DataFeed {
    symbols_source: Arc<dyn SymbolSource>,
    history: Arc<dyn HistorySource>,
    tokens: Arc<dyn TokenProvider>,
    transport: Arc<dyn Transport>,
    settings: FeedSettings,
    symbols: OnceCell<HashMap<String, SymbolInfo>>,
    /// Last bar of the most recent history query, used to seed live aggregation
    last_bars: Mutex<HashMap<LiveKey, Bar>>,
    live: Mutex<LiveRegistry>,
    toggles: watch::Sender<ChartTradingToggles>,
}

impl DataFeed {
    pub fn new(
        settings: FeedSettings,
        symbols_source: Arc<dyn SymbolSource>,
        history: Arc<dyn HistorySource>,
        tokens: Arc<dyn TokenProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (toggles, _) = watch::channel(ChartTradingToggles::default());
        Self {
            symbols_source,
            history,
            tokens,
            transport,
            settings,
            symbols: OnceCell::new(),
            last_bars: Mutex::new(HashMap::new()),
            live: Mutex::new(LiveRegistry::default()),
            toggles,
        }
    }

    async fn symbol_table(&self) -> Result<&HashMap<String, SymbolInfo>, FeedError> {
        self.symbols
            .get_or_try_init(|| async {
                let symbols = self.symbols_source.fetch_symbols().await?;
                info!(count = symbols.len(), "Loaded symbol metadata");
                Ok::<_, FeedError>(
                    symbols
                        .into_iter()
                        .map(|info| (info.symbol.to_uppercase(), info))
                        .collect(),
                )
            })
            .await
    }

    /// Symbol metadata; the table is fetched on first use and then cached
    pub async fn resolve_symbol(&self, symbol: &str) -> Result<SymbolInfo, FeedError> {
        self.symbol_table()
            .await?
            .get(&symbol.trim().to_uppercase())
            .cloned()
            .ok_or_else(|| FeedError::UnknownSymbol(symbol.to_string()))
    }

    /// Case-insensitive substring match on symbol or description
    pub async fn search_symbols(&self, query: &str) -> Result<Vec<SymbolInfo>, FeedError> {
        let query = query.trim().to_lowercase();
        let mut matches: Vec<SymbolInfo> = self
            .symbol_table()
            .await?
            .values()
            .filter(|info| {
                query.is_empty()
                    || info.symbol.to_lowercase().contains(&query)
                    || info.description.to_lowercase().contains(&query)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(matches)
    }

    /// Historical bars in `[from, to)`, sorted by time
    pub async fn get_bars(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: i64,
        to: i64,
    ) -> Result<Vec<Bar>, FeedError> {
        let info = self.resolve_symbol(symbol).await?;
        let mut bars = self
            .history
            .fetch_bars(&info.symbol, resolution, from, to)
            .await?;
        bars.sort_by_key(|bar| bar.time);
        bars.dedup_by_key(|bar| bar.time);
        debug!(symbol = %info.symbol, %resolution, count = bars.len(), "Fetched history");

        if let Some(last) = bars.last() {
            let mut last_bars = self.last_bars.lock().await;
            let key = (info.symbol.clone(), resolution);
            let newer = last_bars.get(&key).map_or(true, |held| held.time <= last.time);
            if newer {
                last_bars.insert(key, *last);
            }
        }

        Ok(bars)
    }

    /// Start (or join) the live bar stream for `symbol` at `resolution`
    pub async fn subscribe_live_bars(
        &self,
        symbol: &str,
        resolution: Resolution,
    ) -> Result<LiveBars, FeedError> {
        let info = self.resolve_symbol(symbol).await?;
        let key = (info.symbol.clone(), resolution);
        let handle = LiveHandle(Uuid::new_v4());

        let seed = self.last_bars.lock().await.get(&key).copied();
        let mut registry = self.live.lock().await;

        if let Some(live) = registry.streams.get_mut(&key) {
            debug!(symbol = %info.symbol, %resolution, handle = %handle, "Joining live stream");
            let bars = live.attach(handle);
            registry.handles.insert(handle, key);
            return Ok(bars);
        }

        let mut live = self.open_live(&info.symbol, resolution, seed);
        info!(
            symbol = %info.symbol,
            %resolution,
            subscription = %live.stream.id(),
            "Live bars subscribed"
        );
        let bars = live.attach(handle);
        registry.streams.insert(key.clone(), live);
        registry.handles.insert(handle, key);
        Ok(bars)
    }

    fn open_live(&self, symbol: &str, resolution: Resolution, seed: Option<Bar>) -> LiveStream {
        let config = StreamConfig::new(
            self.settings.ws_url.clone(),
            quote_subscribe_payload(symbol),
            self.settings.kind,
        )
        .with_policy(self.settings.policy)
        .with_ping_interval(self.settings.ping_interval);

        let (frames_tx, frames_rx) = mpsc::channel(self.settings.channel_buffer_size.max(1));
        let stream = StreamConnection::spawn(
            config,
            self.tokens.clone(),
            self.transport.clone(),
            frames_tx,
        );

        let (bars, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let (quotes, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);

        let mut aggregator = BarAggregator::new();
        if let Some(bar) = seed {
            aggregator.seed(symbol, resolution, bar);
        }

        let pump = tokio::spawn(pump_bars(
            symbol.to_string(),
            resolution,
            frames_rx,
            stream.watch_state(),
            aggregator,
            bars.clone(),
            quotes.clone(),
        ));

        LiveStream {
            stream,
            bars,
            quotes,
            pump,
            holders: HashSet::new(),
        }
    }

    /// Detach `handle`; the stream closes once no handle shares it
    pub async fn unsubscribe(&self, handle: LiveHandle) -> Result<(), FeedError> {
        let finished = {
            let mut registry = self.live.lock().await;
            let key = registry
                .handles
                .remove(&handle)
                .ok_or(FeedError::UnknownSubscription(handle.id()))?;

            let last = match registry.streams.get_mut(&key) {
                Some(live) => {
                    live.holders.remove(&handle);
                    live.holders.is_empty()
                }
                None => false,
            };
            if last {
                registry.streams.remove(&key).map(|live| (key, live))
            } else {
                None
            }
        };

        if let Some(((symbol, resolution), live)) = finished {
            info!(symbol = %symbol, %resolution, "Last live subscriber left, closing stream");
            live.shutdown().await;
        }
        Ok(())
    }

    /// Manual reconnect of the stream behind `handle`, resetting its backoff
    pub async fn reconnect(&self, handle: LiveHandle) -> Result<(), FeedError> {
        let registry = self.live.lock().await;
        let live = Self::lookup(&registry, handle)?;
        live.stream.reconnect();
        Ok(())
    }

    pub async fn live_state(&self, handle: LiveHandle) -> Result<ReconnectState, FeedError> {
        let registry = self.live.lock().await;
        Ok(Self::lookup(&registry, handle)?.stream.state())
    }

    fn lookup(registry: &LiveRegistry, handle: LiveHandle) -> Result<&LiveStream, FeedError> {
        registry
            .handles
            .get(&handle)
            .and_then(|key| registry.streams.get(key))
            .ok_or(FeedError::UnknownSubscription(handle.id()))
    }

    /// Number of open live streams
    pub async fn active_streams(&self) -> usize {
        self.live.lock().await.streams.len()
    }

    pub fn toggles(&self) -> ChartTradingToggles {
        *self.toggles.borrow()
    }

    /// Change the chart-trading toggles and notify watchers
    pub fn update_toggles<F>(&self, update: F) -> ChartTradingToggles
    where
        F: FnOnce(&mut ChartTradingToggles),
    {
        self.toggles.send_modify(update);
        self.toggles()
    }

    pub fn watch_toggles(&self) -> watch::Receiver<ChartTradingToggles> {
        self.toggles.subscribe()
    }

    /// Close every live stream
    pub async fn shutdown_all(&self) {
        let streams: Vec<LiveStream> = {
            let mut registry = self.live.lock().await;
            registry.handles.clear();
            registry.streams.drain().map(|(_, live)| live).collect()
        };
        info!(count = streams.len(), "Closing all live streams");
        for live in streams {
            live.shutdown().await;
        }
    }
}

async fn pump_bars(
    symbol: String,
    resolution: Resolution,
    mut frames: mpsc::Receiver<StreamFrame>,
    state: watch::Receiver<ReconnectState>,
    mut aggregator: BarAggregator,
    bars: broadcast::Sender<BarUpdate>,
    quotes: broadcast::Sender<PriceTick>,
) {
    while let Some(frame) = frames.recv().await {
        if frame.generation != state.borrow().generation {
            debug!(symbol = %symbol, generation = frame.generation, "Dropping frame from superseded connection");
            continue;
        }

        for tick in frame.payload.into_ticks() {
            if tick.symbol != symbol {
                continue;
            }
            let update = aggregator.on_tick(&tick, resolution);
            // no receivers is fine; the handle may be mid-teardown
            let _ = quotes.send(tick);
            let _ = bars.send(update);
        }
    }
    debug!(symbol = %symbol, %resolution, "Bar pump stopped");
}
