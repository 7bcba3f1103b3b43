//! Position Reconciliation Manager
//!
//! Combines a polled REST snapshot and a pushed stream snapshot of an
//! account's open trades/orders into one observed value:
//!
//! - the view is always the latest accepted full snapshot, never a merge
//! - concurrent `refresh` calls share one in-flight fetch
//! - a failing source never clears the last good value

pub mod feed;

pub use feed::PositionFeed;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::types::{OpenTradesSnapshot, SnapshotCounts, TradePatch};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
const UPDATE_CHANNEL_CAPACITY: usize = 256;

type RefreshResult = Result<Arc<OpenTradesSnapshot>, FeedError>;
type PendingRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// REST side: returns a full snapshot; must be safe to call repeatedly
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_open_trades(&self, account: &str) -> Result<OpenTradesSnapshot, FeedError>;
}

/// Health of one snapshot producer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceStatus {
    #[default]
    Unknown,
    Healthy,
    Failing,
}

/// Per-account health of both producers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceHealth {
    pub poll: SourceStatus,
    pub push: SourceStatus,
}

#[derive(Default)]
struct AccountState {
    last_good: Option<Arc<OpenTradesSnapshot>>,
    /// When the last successful poll completed
    last_fetch_ok: Option<Instant>,
    polled_counts: Option<SnapshotCounts>,
    /// At most one in-flight refresh per account
    pending: Option<PendingRefresh>,
    /// A poll started before the last `forget`; must land before a new one starts
    draining: Option<PendingRefresh>,
    /// Bumped by `forget`; polls from an older epoch write nothing
    epoch: u64,
    health: SourceHealth,
}

/// Reconciles polled and pushed snapshots per account
#[derive(Clone)]
pub struct PositionReconciler {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn SnapshotSource>,
    debounce: Duration,
    accounts: Mutex<HashMap<String, AccountState>>,
    updates: broadcast::Sender<Arc<OpenTradesSnapshot>>,
}

impl PositionReconciler {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self::with_debounce(source, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(source: Arc<dyn SnapshotSource>, debounce: Duration) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                source,
                debounce,
                accounts: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }

    /// Every accepted snapshot (poll, push or optimistic), for `onTradesSnapshot`
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<OpenTradesSnapshot>> {
        self.inner.updates.subscribe()
    }

    /// Last good snapshot, if any
    pub async fn current(&self, account: &str) -> Option<Arc<OpenTradesSnapshot>> {
        let accounts = self.inner.accounts.lock().await;
        accounts.get(account).and_then(|s| s.last_good.clone())
    }

    /// Last good snapshot, or `StaleData` if neither source ever produced one
    pub async fn view(&self, account: &str) -> Result<Arc<OpenTradesSnapshot>, FeedError> {
        self.current(account)
            .await
            .ok_or_else(|| FeedError::StaleData {
                account: account.to_string(),
                cause: "no snapshot received yet".to_string(),
            })
    }

    pub async fn health(&self, account: &str) -> SourceHealth {
        let accounts = self.inner.accounts.lock().await;
        accounts.get(account).map(|s| s.health).unwrap_or_default()
    }

    /// Poll the REST source.
    ///
    /// Callers arriving while a poll is in flight get that poll's outcome.
    /// Within the debounce window after a successful poll the held
    /// snapshot is returned without a network call.
    pub async fn refresh(&self, account: &str) -> RefreshResult {
        loop {
            let (pending, superseded) = {
                let mut accounts = self.inner.accounts.lock().await;
                let state = accounts.entry(account.to_string()).or_default();

                if let Some(draining) = &state.draining {
                    debug!(account = %account, "Waiting for poll of forgotten account");
                    (draining.clone(), true)
                } else if let Some(pending) = &state.pending {
                    debug!(account = %account, "Joining in-flight refresh");
                    (pending.clone(), false)
                } else {
                    let fresh = state
                        .last_fetch_ok
                        .is_some_and(|at| at.elapsed() < self.inner.debounce);
                    if let (true, Some(snapshot)) = (fresh, &state.last_good) {
                        debug!(account = %account, "Refresh debounced");
                        return Ok(snapshot.clone());
                    }

                    let inner = self.inner.clone();
                    let task = tokio::spawn(inner.poll(account.to_string(), state.epoch));
                    // Detaching callers only discard the result; the poll still lands
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(FeedError::Transport(format!("refresh task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    state.pending = Some(pending.clone());
                    (pending, false)
                }
            };

            let result = pending.clone().await;
            if !superseded {
                return result;
            }

            // a poll task that panicked never clears its own marker
            let mut accounts = self.inner.accounts.lock().await;
            if let Some(state) = accounts.get_mut(account) {
                if state.draining.as_ref().is_some_and(|d| d.ptr_eq(&pending)) {
                    state.draining = None;
                }
            }
        }
    }

    /// Deliver a pushed snapshot. Returns false if it was discarded as out of date.
    pub async fn on_push(&self, snapshot: OpenTradesSnapshot) -> bool {
        let account = snapshot.account.clone();
        let incoming = Arc::new(snapshot);

        let mismatch = {
            let mut accounts = self.inner.accounts.lock().await;
            let state = accounts.entry(account.clone()).or_default();
            state.health.push = SourceStatus::Healthy;

            if !self.inner.accept(state, incoming.clone(), "push") {
                return false;
            }
            state
                .polled_counts
                .is_some_and(|polled| polled != incoming.counts())
        };

        if mismatch {
            info!(
                account = %account,
                "Pushed snapshot counts differ from last poll, refreshing"
            );
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.refresh(&account).await {
                    debug!(account = %account, error = %e, "Count-mismatch refresh failed");
                }
            });
        }

        true
    }

    /// Record push-stream health reported by the connection layer
    pub async fn set_push_health(&self, account: &str, status: SourceStatus) {
        let mut accounts = self.inner.accounts.lock().await;
        accounts.entry(account.to_string()).or_default().health.push = status;
    }

    /// Apply `patch` to the held snapshot before the server confirms it.
    /// The next real snapshot overwrites it. Returns false if nothing matched.
    pub async fn optimistic_update(&self, account: &str, trade_id: &str, patch: &TradePatch) -> bool {
        let mut accounts = self.inner.accounts.lock().await;
        let Some(current) = accounts
            .get_mut(account)
            .and_then(|state| state.last_good.as_mut())
        else {
            return false;
        };

        let mut projected = (**current).clone();
        if !projected.apply_patch(trade_id, patch) {
            return false;
        }

        let projected = Arc::new(projected);
        *current = projected.clone();
        let _ = self.inner.updates.send(projected);
        debug!(account = %account, trade_id = %trade_id, "Applied optimistic update");
        true
    }

    /// Drop everything held for `account`, e.g. when the user switches accounts
    ///
    /// A poll still in flight is left to finish but its result is discarded.
    pub async fn forget(&self, account: &str) {
        let mut accounts = self.inner.accounts.lock().await;
        let Some(old) = accounts.remove(account) else {
            return;
        };
        if let Some(in_flight) = old.pending.or(old.draining) {
            accounts.insert(
                account.to_string(),
                AccountState {
                    draining: Some(in_flight),
                    epoch: old.epoch + 1,
                    ..Default::default()
                },
            );
        }
    }

    /// Poll `account` every `period` until the returned task is aborted
    pub fn spawn_poller(&self, account: &str, period: Duration) -> JoinHandle<()> {
        let this = self.clone();
        let account = account.to_string();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = this.refresh(&account).await {
                    warn!(account = %account, error = %e, "Position poll failed");
                }
            }
        })
    }
}

impl Inner {
    async fn poll(self: Arc<Self>, account: String, epoch: u64) -> RefreshResult {
        let result = self.source.fetch_open_trades(&account).await;

        let mut accounts = self.accounts.lock().await;
        let forgotten = || FeedError::StaleData {
            account: account.clone(),
            cause: "account was forgotten".to_string(),
        };
        let Some(state) = accounts.get_mut(&account) else {
            return Err(forgotten());
        };
        if state.epoch != epoch {
            state.draining = None;
            debug!(account = %account, epoch, "Discarding poll for forgotten account");
            return Err(forgotten());
        }
        state.pending = None;

        match result {
            Ok(mut snapshot) => {
                if snapshot.account.is_empty() {
                    snapshot.account = account.clone();
                }
                let snapshot = Arc::new(snapshot);
                state.polled_counts = Some(snapshot.counts());
                state.last_fetch_ok = Some(Instant::now());
                state.health.poll = SourceStatus::Healthy;
                self.accept(state, snapshot, "poll");

                state.last_good.clone().ok_or_else(|| FeedError::StaleData {
                    account,
                    cause: "snapshot discarded".to_string(),
                })
            }
            Err(e) => {
                state.health.poll = SourceStatus::Failing;
                warn!(account = %account, error = %e, "Snapshot poll failed, keeping last good value");
                match state.last_good {
                    Some(_) => Err(e),
                    None => Err(FeedError::StaleData {
                        account,
                        cause: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Replace the held snapshot unless `incoming` is provably older
    fn accept(&self, state: &mut AccountState, incoming: Arc<OpenTradesSnapshot>, source: &str) -> bool {
        let held_at = state.last_good.as_ref().and_then(|s| s.updated_at);
        if let (Some(held_at), Some(incoming_at)) = (held_at, incoming.updated_at) {
            if incoming_at < held_at {
                debug!(
                    account = %incoming.account,
                    source,
                    incoming_at,
                    held_at,
                    "Discarding out-of-order snapshot"
                );
                return false;
            }
        }

        state.last_good = Some(incoming.clone());
        let _ = self.updates.send(incoming);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OpenTrade, Side};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        responses: std::sync::Mutex<VecDeque<Result<OpenTradesSnapshot, FeedError>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        latency: Duration,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<OpenTradesSnapshot, FeedError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                latency: Duration::from_millis(50),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_open_trades(&self, _account: &str) -> Result<OpenTradesSnapshot, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FeedError::Http("no scripted response".to_string())))
        }
    }

    fn trade(id: &str) -> OpenTrade {
        OpenTrade {
            id: id.to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            volume: 1.0,
            open_price: 1.1,
            stop_loss: None,
            take_profit: None,
            profit: None,
        }
    }

    fn snapshot(ids: &[&str]) -> OpenTradesSnapshot {
        OpenTradesSnapshot {
            account: "acc".to_string(),
            open_trades: ids.iter().map(|id| trade(id)).collect(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_fetch() {
        let source = ScriptedSource::new(vec![Ok(snapshot(&["T1"]))]);
        let reconciler = PositionReconciler::new(source.clone());

        let (a, b) = tokio::join!(reconciler.refresh("acc"), reconciler.refresh("acc"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(source.calls(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_trades.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_inside_debounce_window_is_short_circuited() {
        let source = ScriptedSource::new(vec![Ok(snapshot(&["T1"])), Ok(snapshot(&["T1", "T2"]))]);
        let reconciler = PositionReconciler::new(source.clone());

        reconciler.refresh("acc").await.unwrap();
        let again = reconciler.refresh("acc").await.unwrap();
        assert_eq!(source.calls(), 1);
        assert_eq!(again.open_trades.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let later = reconciler.refresh("acc").await.unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(later.open_trades.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_keeps_last_good_but_reports_error() {
        let source = ScriptedSource::new(vec![
            Ok(snapshot(&["T1", "T2"])),
            Err(FeedError::Http("502".to_string())),
        ]);
        let reconciler = PositionReconciler::new(source.clone());

        let good = reconciler.refresh("acc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let err = reconciler.refresh("acc").await.unwrap_err();

        assert_eq!(err, FeedError::Http("502".to_string()));
        assert_eq!(reconciler.current("acc").await.unwrap(), good);
        assert_eq!(reconciler.health("acc").await.poll, SourceStatus::Failing);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_any_data_is_stale() {
        let source = ScriptedSource::new(vec![Err(FeedError::Http("timeout".to_string()))]);
        let reconciler = PositionReconciler::new(source);

        let err = reconciler.refresh("acc").await.unwrap_err();
        assert!(matches!(err, FeedError::StaleData { .. }));
        assert!(matches!(
            reconciler.view("acc").await,
            Err(FeedError::StaleData { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn push_replaces_view_without_merging() {
        let reconciler = PositionReconciler::new(ScriptedSource::new(vec![]));
        let mut updates = reconciler.subscribe();

        assert!(reconciler.on_push(snapshot(&["T1", "T2"])).await);
        assert!(reconciler.on_push(snapshot(&["T1"])).await);

        let view = reconciler.view("acc").await.unwrap();
        assert_eq!(*view, snapshot(&["T1"]));
        assert_eq!(updates.recv().await.unwrap().open_trades.len(), 2);
        assert_eq!(updates.recv().await.unwrap().open_trades.len(), 1);
        assert_eq!(reconciler.health("acc").await.push, SourceStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_update_is_overwritten_by_next_snapshot() {
        let reconciler = PositionReconciler::new(ScriptedSource::new(vec![]));
        reconciler.on_push(snapshot(&["T1"])).await;

        let patch = TradePatch {
            stop_loss: Some(1.05),
            ..Default::default()
        };
        assert!(reconciler.optimistic_update("acc", "T1", &patch).await);
        assert!(!reconciler.optimistic_update("acc", "T404", &patch).await);
        assert!(!reconciler.optimistic_update("other", "T1", &patch).await);

        let view = reconciler.view("acc").await.unwrap();
        assert_eq!(view.open_trades[0].stop_loss, Some(1.05));

        reconciler.on_push(snapshot(&["T1"])).await;
        let view = reconciler.view("acc").await.unwrap();
        assert_eq!(view.open_trades[0].stop_loss, None);
    }

    #[tokio::test(start_paused = true)]
    async fn count_mismatch_triggers_one_poll() {
        let source = ScriptedSource::new(vec![Ok(snapshot(&["T1", "T2"])), Ok(snapshot(&["T1"]))]);
        let reconciler = PositionReconciler::new(source.clone());

        reconciler.refresh("acc").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // same counts: no poll
        reconciler.on_push(snapshot(&["T1", "T3"])).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 1);

        // T2 closed elsewhere
        reconciler.on_push(snapshot(&["T1"])).await;
        reconciler.on_push(snapshot(&["T1"])).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 2);
        assert_eq!(*reconciler.view("acc").await.unwrap(), snapshot(&["T1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn older_snapshots_are_discarded() {
        let reconciler = PositionReconciler::new(ScriptedSource::new(vec![]));

        let mut newer = snapshot(&["T1"]);
        newer.updated_at = Some(200);
        let mut older = snapshot(&["T1", "T2"]);
        older.updated_at = Some(100);

        assert!(reconciler.on_push(newer.clone()).await);
        assert!(!reconciler.on_push(older).await);
        assert_eq!(*reconciler.view("acc").await.unwrap(), newer);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_after_forget_waits_for_the_old_poll() {
        let source = ScriptedSource::new(vec![Ok(snapshot(&["T1"])), Ok(snapshot(&["T2"]))]);
        let reconciler = PositionReconciler::new(source.clone());

        let old = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.refresh("acc").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        reconciler.forget("acc").await;

        let fresh = reconciler.refresh("acc").await.unwrap();
        assert_eq!(fresh.open_trades[0].id, "T2");
        assert_eq!(source.calls(), 2);
        assert_eq!(source.max_in_flight(), 1);
        assert!(matches!(
            old.await.unwrap(),
            Err(FeedError::StaleData { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_landing_after_forget_writes_nothing() {
        let source = ScriptedSource::new(vec![Ok(snapshot(&["T1"]))]);
        let reconciler = PositionReconciler::new(source.clone());
        let mut updates = reconciler.subscribe();

        let old = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.refresh("acc").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        reconciler.forget("acc").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(source.calls(), 1);
        assert!(old.is_finished());
        assert!(reconciler.current("acc").await.is_none());
        assert_eq!(reconciler.health("acc").await.poll, SourceStatus::Unknown);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_drives_refreshes() {
        let source = ScriptedSource::new(vec![Ok(snapshot(&["T1"])), Ok(snapshot(&["T1", "T2"]))]);
        let reconciler = PositionReconciler::new(source.clone());

        let poller = reconciler.spawn_poller("acc", Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        poller.abort();

        assert_eq!(source.calls(), 2);
        assert_eq!(reconciler.view("acc").await.unwrap().open_trades.len(), 2);
    }
}
