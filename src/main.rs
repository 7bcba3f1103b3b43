//! tradefeed - streams live bars and reconciled positions until Ctrl-C

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tradefeed::auth::EnvTokenProvider;
use tradefeed::config::AppConfig;
use tradefeed::datafeed::{DataFeed, FeedSettings, LiveBars};
use tradefeed::positions::{PositionFeed, PositionReconciler};
use tradefeed::rest::RestClient;
use tradefeed::stream::{ReconnectPolicy, WsTransport};
use tradefeed::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    telemetry::init_tracing(&config.logging)?;
    info!(config = %config.digest(), "Starting tradefeed v{}", env!("CARGO_PKG_VERSION"));

    let tokens = Arc::new(EnvTokenProvider::default());
    let transport = Arc::new(WsTransport::new());
    let rest = Arc::new(
        RestClient::new(&config.rest.base_url, config.rest.timeout(), tokens.clone())
            .context("Failed to create REST client")?,
    );

    let policy = ReconnectPolicy::from(&config.feed);
    let settings = FeedSettings {
        policy,
        ping_interval: config.feed.ping_interval(),
        channel_buffer_size: config.feed.channel_buffer_size,
        ..FeedSettings::new(config.feed.ws_url.clone())
    };
    let datafeed = DataFeed::new(
        settings,
        rest.clone(),
        rest.clone(),
        tokens.clone(),
        transport.clone(),
    );

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    for symbol in &config.chart.symbols {
        for resolution in config.chart_resolutions()? {
            match datafeed.subscribe_live_bars(symbol, resolution).await {
                Ok(live) => tasks.push(tokio::spawn(log_live_bars(symbol.clone(), live))),
                Err(e) => warn!(symbol = %symbol, %resolution, error = %e, "Live subscription failed"),
            }
        }
    }

    let reconciler = PositionReconciler::with_debounce(rest.clone(), config.positions.debounce());
    tasks.push(tokio::spawn(log_snapshots(reconciler.clone())));

    let mut feeds = Vec::new();
    for account in &config.positions.accounts {
        tasks.push(reconciler.spawn_poller(account, config.positions.poll_interval()));
        let stream = PositionFeed::stream_config(&config.positions.ws_url, account)
            .with_policy(policy)
            .with_ping_interval(config.feed.ping_interval());
        feeds.push(PositionFeed::start(
            account,
            stream,
            config.feed.channel_buffer_size,
            tokens.clone(),
            transport.clone(),
            reconciler.clone(),
        ));
    }

    info!(
        symbols = config.chart.symbols.len(),
        accounts = feeds.len(),
        "Feeds running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    datafeed.shutdown_all().await;
    for feed in feeds {
        feed.shutdown().await;
    }
    for task in tasks {
        task.abort();
    }

    info!("tradefeed stopped");
    Ok(())
}

async fn log_live_bars(symbol: String, mut live: LiveBars) {
    loop {
        tokio::select! {
            update = live.bars.recv() => match update {
                Ok(update) => {
                    let bar = update.bar();
                    info!(
                        symbol = %symbol,
                        new = update.is_new(),
                        time = bar.time,
                        open = bar.open,
                        high = bar.high,
                        low = bar.low,
                        close = bar.close,
                        "Bar"
                    );
                }
                Err(RecvError::Lagged(skipped)) => warn!(symbol = %symbol, skipped, "Bar logger lagged"),
                Err(RecvError::Closed) => break,
            },
            quote = live.quotes.recv() => match quote {
                Ok(tick) => debug!(
                    symbol = %symbol,
                    price = tick.market_price,
                    spread = tick.spread(),
                    "Quote"
                ),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            changed = live.status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *live.status.borrow_and_update();
                info!(
                    symbol = %symbol,
                    status = %state.status,
                    attempt = state.attempt,
                    "Connection status"
                );
            }
        }
    }
}

async fn log_snapshots(reconciler: PositionReconciler) {
    let mut updates = reconciler.subscribe();
    loop {
        match updates.recv().await {
            Ok(snapshot) => {
                let counts = snapshot.counts();
                info!(
                    account = %snapshot.account,
                    trades = counts.trades,
                    orders = counts.orders,
                    "Open trades snapshot"
                );
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Snapshot logger lagged"),
            Err(RecvError::Closed) => {
                error!("Snapshot channel closed");
                break;
            }
        }
    }
}
