use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Side;

// ---------------------------------------------------------------------------
// Response envelope (REST)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: Option<bool>,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
}

// ---------------------------------------------------------------------------
// Account / positions / orders (REST reads)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountSnapshot {
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub account_equity: Option<Decimal>,
    #[serde(default, alias = "available_balance")]
    pub available_to_spend: Option<Decimal>,
    #[serde(default)]
    pub total_margin_used: Option<Decimal>,
    #[serde(default)]
    pub positions_count: Option<u32>,
}

impl AccountSnapshot {
    /// Funds that can back a new order. Falls back to balance when the
    /// exchange omits the spendable figure.
    pub fn available(&self) -> Decimal {
        self.available_to_spend
            .or(self.balance)
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiPosition {
    pub symbol: String,
    #[serde(default)]
    pub side: Option<Side>,
    pub amount: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub margin: Option<Decimal>,
    #[serde(default)]
    pub isolated: Option<bool>,
}

impl ApiPosition {
    pub fn notional(&self) -> Decimal {
        self.amount.abs() * self.entry_price
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiOpenOrder {
    pub order_id: u64,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub initial_amount: Option<Decimal>,
    #[serde(default)]
    pub filled_amount: Option<Decimal>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub reduce_only: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Market metadata (REST /info)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiMarket {
    pub symbol: String,
    pub lot_size: Decimal,
    #[serde(default)]
    pub tick_size: Option<Decimal>,
    #[serde(default)]
    pub max_leverage: Option<u32>,
    #[serde(default)]
    pub min_order_size: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Order placement (REST writes)
// ---------------------------------------------------------------------------

/// Intent for an immediate order at the prevailing price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketOrder {
    pub symbol: String,
    pub amount: Decimal,
    pub side: Side,
    pub slippage_percent: Decimal,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

/// Intent for a resting order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitOrder {
    pub symbol: String,
    pub amount: Decimal,
    pub price: Decimal,
    pub side: Side,
    pub post_only: bool,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrderAck {
    #[serde(default)]
    pub order_id: Option<u64>,
}

// ---------------------------------------------------------------------------
// WebSocket messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WsSubscribeParams {
    pub source: &'static str,
    pub account: String,
}

/// Outbound control frame: subscribe, unsubscribe or ping.
#[derive(Debug, Clone, Serialize)]
pub struct WsCommand {
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<WsSubscribeParams>,
}

impl WsCommand {
    pub const ACCOUNT_TRADES: &'static str = "account_trades";

    pub fn subscribe(account: &str) -> Self {
        Self {
            method: "subscribe",
            params: Some(WsSubscribeParams {
                source: Self::ACCOUNT_TRADES,
                account: account.to_string(),
            }),
        }
    }

    pub fn unsubscribe(account: &str) -> Self {
        Self {
            method: "unsubscribe",
            params: Some(WsSubscribeParams {
                source: Self::ACCOUNT_TRADES,
                account: account.to_string(),
            }),
        }
    }

    pub fn ping() -> Self {
        Self {
            method: "ping",
            params: None,
        }
    }
}

/// One record of an `account_trades` data frame. Numbers arrive as text.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WsAccountTrade {
    #[serde(rename = "s")]
    pub symbol: Option<String>,
    #[serde(rename = "ts")]
    pub trade_side: Option<String>,
    #[serde(rename = "p")]
    pub price: Option<String>,
    #[serde(rename = "a")]
    pub amount: Option<String>,
    #[serde(rename = "te")]
    pub event_type: Option<String>,
    #[serde(rename = "u")]
    pub account: Option<String>,
}
