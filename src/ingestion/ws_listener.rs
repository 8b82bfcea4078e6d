//! Exchange feed subscriber.
//!
//! One WebSocket session multiplexes `account_trades` subscriptions for every
//! followed master wallet. On each (re)connect the full subscription set is
//! replayed; commands issued while offline are dropped, never queued.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::exchange::types::{WsAccountTrade, WsCommand};
use crate::models::{Fill, FillKind, TradeSide};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl FeedConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: PING_INTERVAL,
            reconnect_base_delay: BASE_RECONNECT_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted. Terminal.
    Failed,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed reconnect limit reached after {attempts} attempts: {last_error}")]
    ReconnectLimit { attempts: u32, last_error: String },
}

/// Delay before reconnect attempt `attempt` (1-based): base, 2×base, 4×base, …
/// `None` once the attempt budget is spent.
pub fn backoff_delay(base: Duration, attempt: u32, max_attempts: u32) -> Option<Duration> {
    if attempt == 0 || attempt > max_attempts {
        return None;
    }
    Some(base.saturating_mul(1u32 << (attempt - 1).min(31)))
}

// ---------------------------------------------------------------------------
// Subscription set and handle
// ---------------------------------------------------------------------------

/// Master wallets the session should be subscribed to.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    wallets: Mutex<BTreeSet<String>>,
}

impl SubscriptionSet {
    pub fn insert(&self, wallet: &str) -> bool {
        self.lock().insert(wallet.to_string())
    }

    pub fn remove(&self, wallet: &str) -> bool {
        self.lock().remove(wallet)
    }

    pub fn snapshot(&self) -> BTreeSet<String> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.wallets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Cloneable control surface for a running [`FeedSubscriber`].
#[derive(Debug, Clone)]
pub struct FeedHandle {
    subscriptions: Arc<SubscriptionSet>,
    commands: mpsc::UnboundedSender<FeedCommand>,
    state: watch::Receiver<FeedState>,
}

impl FeedHandle {
    /// Add a master wallet. The wire command goes out only while connected;
    /// otherwise the next connect replays it. Returns false if already present.
    pub fn subscribe(&self, wallet: &str) -> bool {
        if !self.subscriptions.insert(wallet) {
            return false;
        }
        if self.state() == FeedState::Connected {
            let _ = self.commands.send(FeedCommand::Subscribe(wallet.to_string()));
        }
        true
    }

    pub fn unsubscribe(&self, wallet: &str) -> bool {
        if !self.subscriptions.remove(wallet) {
            return false;
        }
        if self.state() == FeedState::Connected {
            let _ = self.commands.send(FeedCommand::Unsubscribe(wallet.to_string()));
        }
        true
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.subscriptions.snapshot()
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

pub struct FeedSubscriber {
    config: FeedConfig,
    subscriptions: Arc<SubscriptionSet>,
    commands_tx: mpsc::UnboundedSender<FeedCommand>,
    commands_rx: mpsc::UnboundedReceiver<FeedCommand>,
    state_tx: watch::Sender<FeedState>,
    fill_tx: mpsc::Sender<Fill>,
}

enum SessionEnd {
    Shutdown,
    Closed { connected: bool, reason: String },
}

impl FeedSubscriber {
    pub fn new(config: FeedConfig, fill_tx: mpsc::Sender<Fill>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(FeedState::Disconnected);
        Self {
            config,
            subscriptions: Arc::new(SubscriptionSet::default()),
            commands_tx,
            commands_rx,
            state_tx,
            fill_tx,
        }
    }

    pub fn handle(&self) -> FeedHandle {
        FeedHandle {
            subscriptions: Arc::clone(&self.subscriptions),
            commands: self.commands_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Run until shutdown (Ok) or until the reconnect budget is exhausted
    /// (Err). A successful connect resets the attempt counter.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                self.set_state(FeedState::Disconnected);
                return Ok(());
            }

            self.set_state(FeedState::Connecting);
            let end = self.run_session(&mut shutdown).await;
            self.set_state(FeedState::Disconnected);

            let reason = match end {
                SessionEnd::Shutdown => {
                    tracing::info!("Feed subscriber shut down");
                    return Ok(());
                }
                SessionEnd::Closed { connected, reason } => {
                    if connected {
                        attempt = 0;
                    }
                    reason
                }
            };

            attempt = attempt.saturating_add(1);
            let Some(delay) = backoff_delay(
                self.config.reconnect_base_delay,
                attempt,
                self.config.max_reconnect_attempts,
            ) else {
                self.set_state(FeedState::Failed);
                tracing::error!(
                    attempts = attempt - 1,
                    error = %reason,
                    "Feed reconnect limit reached — giving up"
                );
                return Err(FeedError::ReconnectLimit {
                    attempts: attempt - 1,
                    last_error: reason,
                });
            };

            counter!("feed_reconnects_total").increment(1);
            tracing::warn!(
                attempt,
                delay_secs = delay.as_secs_f64(),
                error = %reason,
                "Feed disconnected — reconnecting"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {
                    tracing::info!("Shutdown requested during feed backoff");
                    return Ok(());
                }
            }
        }
    }

    async fn run_session(&mut self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        tracing::info!(url = %self.config.url, "Connecting to exchange feed...");

        let ws_stream = match connect_async(self.config.url.as_str()).await {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                return SessionEnd::Closed {
                    connected: false,
                    reason: e.to_string(),
                }
            }
        };
        let (mut write, mut read) = ws_stream.split();

        self.set_state(FeedState::Connected);

        // Anything queued before this point predates the replay below.
        while self.commands_rx.try_recv().is_ok() {}

        let wallets = self.subscriptions.snapshot();
        for wallet in &wallets {
            if let Err(e) = write.send(command_message(&WsCommand::subscribe(wallet))).await {
                return SessionEnd::Closed {
                    connected: true,
                    reason: format!("subscribe replay failed: {e}"),
                };
            }
        }
        tracing::info!(masters = wallets.len(), "Feed connected — subscriptions replayed");

        let mut ping_timer = interval(self.config.ping_interval.max(Duration::from_millis(1)));
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_timer.tick().await; // consume the first immediate tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_text_message(text.as_str(), &self.fill_tx).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return SessionEnd::Closed { connected: true, reason: e.to_string() };
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by server: {} {}", u16::from(f.code), f.reason.as_str()))
                                .unwrap_or_else(|| "closed by server".into());
                            return SessionEnd::Closed { connected: true, reason };
                        }
                        Some(Ok(_)) => {} // Binary, Pong, Frame
                        Some(Err(e)) => {
                            return SessionEnd::Closed { connected: true, reason: e.to_string() };
                        }
                        None => {
                            return SessionEnd::Closed { connected: true, reason: "stream ended".into() };
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if let Err(e) = write.send(command_message(&WsCommand::ping())).await {
                        return SessionEnd::Closed { connected: true, reason: format!("ping failed: {e}") };
                    }
                }
                cmd = self.commands_rx.recv() => {
                    let command = match cmd {
                        Some(FeedCommand::Subscribe(wallet)) => WsCommand::subscribe(&wallet),
                        Some(FeedCommand::Unsubscribe(wallet)) => WsCommand::unsubscribe(&wallet),
                        None => continue,
                    };
                    if let Err(e) = write.send(command_message(&command)).await {
                        return SessionEnd::Closed { connected: true, reason: e.to_string() };
                    }
                    tracing::debug!(method = command.method, "Feed subscription command sent");
                }
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn set_state(&self, state: FeedState) {
        self.state_tx.send_replace(state);
    }
}

fn command_message(command: &WsCommand) -> Message {
    // WsCommand holds only strings; serialization cannot fail.
    let text = serde_json::to_string(command).unwrap_or_default();
    Message::Text(text.into())
}

// ---------------------------------------------------------------------------
// Inbound parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// What one inbound text frame turned out to be.
#[derive(Debug)]
pub enum FeedFrame {
    Fills(Vec<Fill>),
    Pong,
    Ignored,
}

pub fn parse_feed_message(text: &str, received_at: DateTime<Utc>) -> FeedFrame {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(_) => {
            tracing::trace!(raw = %text, "Non-JSON feed message");
            return FeedFrame::Ignored;
        }
    };

    match envelope.channel.as_deref() {
        Some("pong") => FeedFrame::Pong,
        Some(WsCommand::ACCOUNT_TRADES) => {
            let records: Vec<WsAccountTrade> = match envelope.data {
                Some(serde_json::Value::Array(items)) => items
                    .into_iter()
                    .filter_map(|v| serde_json::from_value(v).ok())
                    .collect(),
                Some(obj @ serde_json::Value::Object(_)) => {
                    serde_json::from_value(obj).map(|r| vec![r]).unwrap_or_default()
                }
                _ => Vec::new(),
            };
            FeedFrame::Fills(
                records
                    .iter()
                    .filter_map(|r| convert_account_trade(r, received_at))
                    .collect(),
            )
        }
        _ => {
            tracing::trace!(raw = %text, "Feed control message");
            FeedFrame::Ignored
        }
    }
}

fn convert_account_trade(record: &WsAccountTrade, received_at: DateTime<Utc>) -> Option<Fill> {
    let kind = FillKind::from_api_str(record.event_type.as_deref()?)?;
    let master_wallet = record.account.as_deref().filter(|w| !w.is_empty())?;
    let symbol = record.symbol.as_deref().filter(|s| !s.is_empty())?;

    let Some(trade_side) = record.trade_side.as_deref().and_then(TradeSide::from_api_str) else {
        tracing::debug!(?record, "Dropping feed record with unknown trade side");
        return None;
    };

    let amount = record.amount.as_deref().and_then(|s| Decimal::from_str(s).ok());
    let price = record.price.as_deref().and_then(|s| Decimal::from_str(s).ok());
    let (Some(amount), Some(price)) = (amount, price) else {
        tracing::debug!(?record, "Dropping feed record with unparsable amount or price");
        return None;
    };
    if amount <= Decimal::ZERO || price <= Decimal::ZERO {
        return None;
    }

    Some(Fill {
        master_wallet: master_wallet.to_string(),
        symbol: symbol.to_uppercase(),
        trade_side,
        amount,
        price,
        kind,
        received_at,
    })
}

async fn handle_text_message(text: &str, tx: &mpsc::Sender<Fill>) {
    let fills = match parse_feed_message(text, Utc::now()) {
        FeedFrame::Fills(fills) => fills,
        FeedFrame::Pong => {
            tracing::trace!("Feed pong");
            return;
        }
        FeedFrame::Ignored => return,
    };

    for fill in fills {
        counter!("fills_received_total").increment(1);
        tracing::info!(
            master = %fill.master_wallet,
            symbol = %fill.symbol,
            side = %fill.trade_side,
            amount = %fill.amount,
            price = %fill.price,
            "Master fill received"
        );
        if let Err(e) = tx.send(fill).await {
            tracing::error!(error = %e, "Failed to forward fill — coordinator gone");
        }
    }
}
