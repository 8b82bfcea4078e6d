use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trading parameters for one symbol, as cached for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketInfo {
    pub symbol: String,
    pub lot_size: Decimal,
    pub tick_size: Option<Decimal>,
    pub max_leverage: Option<u32>,
}

impl MarketInfo {
    pub fn with_lot_size(symbol: impl Into<String>, lot_size: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            lot_size,
            tick_size: None,
            max_leverage: None,
        }
    }

    /// Round an amount toward zero onto the lot grid.
    ///
    /// Idempotent, and never returns more than `amount` for non-negative
    /// input. A non-positive lot size leaves the amount untouched.
    pub fn quantize(&self, amount: Decimal) -> Decimal {
        quantize(amount, self.lot_size)
    }
}

pub fn quantize(amount: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return amount;
    }
    ((amount / lot_size).trunc() * lot_size).normalize()
}
