pub mod market;
pub mod relationship;

pub use market::{quantize, MarketInfo};
pub use relationship::{CopyRelationship, RelationshipError, SizingRule};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Order side as the exchange spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TradeSide: position-aware side tag carried by feed records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
}

impl TradeSide {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "open_long" => Some(TradeSide::OpenLong),
            "close_long" => Some(TradeSide::CloseLong),
            "open_short" => Some(TradeSide::OpenShort),
            "close_short" => Some(TradeSide::CloseShort),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::OpenLong => "open_long",
            TradeSide::CloseLong => "close_long",
            TradeSide::OpenShort => "open_short",
            TradeSide::CloseShort => "close_short",
        }
    }

    /// Buying opens a long or closes a short; selling does the opposite.
    pub fn order_side(&self) -> Side {
        match self {
            TradeSide::OpenLong | TradeSide::CloseShort => Side::Bid,
            TradeSide::CloseLong | TradeSide::OpenShort => Side::Ask,
        }
    }

    pub fn is_reduce_only(&self) -> bool {
        matches!(self, TradeSide::CloseLong | TradeSide::CloseShort)
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Fill: core pipeline message
// ---------------------------------------------------------------------------

/// How a master's order was executed. Only fulfill events are copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillKind {
    FulfillMaker,
    FulfillTaker,
}

impl FillKind {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s {
            "fulfill_maker" => Some(FillKind::FulfillMaker),
            "fulfill_taker" => Some(FillKind::FulfillTaker),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub master_wallet: String,
    pub symbol: String,
    pub trade_side: TradeSide,
    pub amount: Decimal,
    pub price: Decimal,
    pub kind: FillKind,
    pub received_at: DateTime<Utc>,
}
