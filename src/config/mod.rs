use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::exchange::DispatcherConfig;
use crate::execution::CopyEngineConfig;
use crate::ingestion::FeedConfig;

const DEFAULT_REST_URL: &str = "https://api.pacifica.fi/api/v1";
const DEFAULT_WS_URL: &str = "wss://ws.pacifica.fi/ws";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,

    // Exchange endpoints
    pub exchange_rest_url: String,
    pub exchange_ws_url: String,

    // Feed
    pub feed_ping_interval_secs: u64,
    pub feed_reconnect_base_secs: u64,
    pub feed_max_reconnect_attempts: u32,
    pub fill_channel_capacity: usize,

    // Dispatcher
    pub dispatch_max_per_window: u32,
    pub dispatch_window_secs: u64,
    pub dispatch_retry_delay_ms: u64,
    pub dispatch_poll_interval_ms: u64,
    pub http_timeout_secs: u64,
    pub signature_expiry_window_ms: u64,

    // Execution
    pub market_slippage_percent: Decimal,
    pub default_lot_size: Decimal,
    pub reconcile_interval_secs: u64,
    pub failure_alert_threshold: u32,
    pub dry_run: bool,

    // Observability
    pub metrics_listen_addr: Option<String>,
    pub log_json: bool,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,

            exchange_rest_url: env::var("EXCHANGE_REST_URL")
                .unwrap_or_else(|_| DEFAULT_REST_URL.into()),
            exchange_ws_url: env::var("EXCHANGE_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.into()),

            feed_ping_interval_secs: parse_var("FEED_PING_INTERVAL_SECS", 30)?,
            feed_reconnect_base_secs: parse_var("FEED_RECONNECT_BASE_SECS", 1)?,
            feed_max_reconnect_attempts: parse_var("FEED_MAX_RECONNECT_ATTEMPTS", 10)?,
            fill_channel_capacity: parse_var("FILL_CHANNEL_CAPACITY", 1000)?,

            dispatch_max_per_window: parse_var("DISPATCH_MAX_PER_WINDOW", 90)?,
            dispatch_window_secs: parse_var("DISPATCH_WINDOW_SECS", 60)?,
            dispatch_retry_delay_ms: parse_var("DISPATCH_RETRY_DELAY_MS", 1000)?,
            dispatch_poll_interval_ms: parse_var("DISPATCH_POLL_INTERVAL_MS", 50)?,
            http_timeout_secs: parse_var("HTTP_TIMEOUT_SECS", 10)?,
            signature_expiry_window_ms: parse_var("SIGNATURE_EXPIRY_WINDOW_MS", 5000)?,

            market_slippage_percent: parse_var("MARKET_SLIPPAGE_PERCENT", Decimal::new(5, 1))?,
            default_lot_size: parse_var("DEFAULT_LOT_SIZE", Decimal::new(1, 3))?,
            reconcile_interval_secs: parse_var("RECONCILE_INTERVAL_SECS", 60)?,
            failure_alert_threshold: parse_var("FAILURE_ALERT_THRESHOLD", 5)?,
            dry_run: parse_var("DRY_RUN", false)?,

            metrics_listen_addr: env::var("METRICS_LISTEN_ADDR").ok().filter(|s| !s.is_empty()),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            url: self.exchange_ws_url.clone(),
            ping_interval: Duration::from_secs(self.feed_ping_interval_secs),
            reconnect_base_delay: Duration::from_secs(self.feed_reconnect_base_secs),
            max_reconnect_attempts: self.feed_max_reconnect_attempts,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_per_window: self.dispatch_max_per_window,
            window: Duration::from_secs(self.dispatch_window_secs),
            retry_delay: Duration::from_millis(self.dispatch_retry_delay_ms),
            poll_interval: Duration::from_millis(self.dispatch_poll_interval_ms),
        }
    }

    pub fn copy_engine_config(&self) -> CopyEngineConfig {
        CopyEngineConfig {
            slippage_percent: self.market_slippage_percent,
            dry_run: self.dry_run,
            failure_alert_threshold: self.failure_alert_threshold,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Read `name`, falling back to `default` when unset. A set but unparsable
/// value is an error rather than a silent default.
fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        _ => Ok(default),
    }
}
