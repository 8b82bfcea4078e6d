use std::collections::HashMap;

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use crate::models::MarketInfo;

use super::client::ExchangeClient;
use super::types::ApiMarket;

/// Lot size used when market metadata cannot be fetched.
pub const DEFAULT_LOT_SIZE: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001

/// Process-lifetime cache of per-symbol trading parameters.
///
/// Entries are filled lazily from the exchange's market list and are never
/// invalidated. A failed lookup yields the default lot size without caching
/// it, so the next fill for that symbol tries again.
#[derive(Debug)]
pub struct MarketInfoCache {
    entries: RwLock<HashMap<String, MarketInfo>>,
    default_lot_size: Decimal,
}

impl Default for MarketInfoCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOT_SIZE)
    }
}

impl MarketInfoCache {
    pub fn new(default_lot_size: Decimal) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_lot_size,
        }
    }

    pub async fn get(&self, symbol: &str) -> Option<MarketInfo> {
        self.entries.read().await.get(symbol).cloned()
    }

    pub async fn insert(&self, info: MarketInfo) {
        self.entries.write().await.insert(info.symbol.clone(), info);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Return the cached entry for `symbol`, fetching the market list on a
    /// miss. Never fails: falls back to the default lot size.
    pub async fn get_or_fetch(&self, symbol: &str, client: &ExchangeClient) -> MarketInfo {
        if let Some(info) = self.get(symbol).await {
            return info;
        }

        match client.get_markets().await {
            Ok(markets) => {
                let fetched = markets.len();
                self.populate(markets).await;
                tracing::debug!(markets = fetched, "Market metadata cached");
                if let Some(info) = self.get(symbol).await {
                    return info;
                }
                tracing::warn!(
                    symbol,
                    default_lot_size = %self.default_lot_size,
                    "Symbol missing from market list — using default lot size"
                );
            }
            Err(e) => {
                tracing::warn!(
                    symbol,
                    error = %e,
                    default_lot_size = %self.default_lot_size,
                    "Market metadata lookup failed — using default lot size"
                );
            }
        }

        MarketInfo::with_lot_size(symbol, self.default_lot_size)
    }

    async fn populate(&self, markets: Vec<ApiMarket>) {
        let mut entries = self.entries.write().await;
        for m in markets {
            if m.lot_size <= Decimal::ZERO {
                tracing::warn!(symbol = %m.symbol, lot_size = %m.lot_size, "Ignoring market with bad lot size");
                continue;
            }
            let symbol = m.symbol.to_uppercase();
            entries.entry(symbol.clone()).or_insert(MarketInfo {
                symbol,
                lot_size: m.lot_size,
                tick_size: m.tick_size,
                max_leverage: m.max_leverage,
            });
        }
    }
}
