use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use copybot::db::{InMemoryRelationshipStore, RelationshipStore};
use copybot::errors::ExchangeError;
use copybot::exchange::{
    spawn_dispatcher, ApiRequest, ApiResponse, DispatcherConfig, ExchangeClient, HttpTransport, MarketInfoCache,
};
use copybot::execution::{CopyEngine, CopyEngineConfig};
use copybot::models::{CopyRelationship, Fill, FillKind, SizingRule, TradeSide};
use copybot::vault::EnvelopeVault;

/// HTTP transport that answers from a per-path script and records every call.
///
/// One-shot responses are served first, in order; after that the path's
/// sticky response repeats. Unknown paths get a 404. A stalled path or
/// account holds every matching call for the given time before answering.
#[derive(Default)]
pub struct ScriptedTransport {
    once: Mutex<HashMap<String, VecDeque<ApiResponse>>>,
    sticky: Mutex<HashMap<String, ApiResponse>>,
    stalls: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<(Instant, ApiRequest)>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, path: &str, status: u16, body: impl Into<String>) {
        self.sticky.lock().unwrap().insert(
            path.to_string(),
            ApiResponse {
                status,
                body: body.into(),
            },
        );
    }

    pub fn respond_once(&self, path: &str, status: u16, body: impl Into<String>) {
        self.once
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(ApiResponse {
                status,
                body: body.into(),
            });
    }

    /// Delay every call whose path or account equals `key`.
    pub fn stall(&self, key: &str, delay: Duration) {
        self.stalls.lock().unwrap().insert(key.to_string(), delay);
    }

    /// Calls as recorded on arrival, with the time each one reached the wire.
    pub fn timed_requests(&self) -> Vec<(Instant, ApiRequest)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ExchangeError> {
        self.calls.lock().unwrap().push((Instant::now(), request.clone()));

        let delay = {
            let stalls = self.stalls.lock().unwrap();
            let account = request_account(request);
            stalls
                .get(&request.path)
                .or_else(|| account.as_deref().and_then(|a| stalls.get(a)))
                .copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(resp) = self
            .once
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(|q| q.pop_front())
        {
            return Ok(resp);
        }
        if let Some(resp) = self.sticky.lock().unwrap().get(&request.path) {
            return Ok(resp.clone());
        }
        Ok(ApiResponse {
            status: 404,
            body: r#"{"success":false,"data":null,"error":"not found"}"#.into(),
        })
    }
}

/// The account a call acts for: the `account` query parameter on reads, the
/// body field on signed writes.
#[allow(dead_code)]
pub fn request_account(request: &ApiRequest) -> Option<String> {
    request
        .query
        .iter()
        .find(|(k, _)| k == "account")
        .map(|(_, v)| v.clone())
        .or_else(|| {
            request
                .body
                .as_ref()
                .and_then(|b| b["account"].as_str())
                .map(str::to_string)
        })
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[allow(dead_code)]
pub fn ok_body(data: Value) -> String {
    json!({"success": true, "data": data, "error": null, "code": null}).to_string()
}

#[allow(dead_code)]
pub fn markets_body() -> String {
    ok_body(json!([
        {"symbol": "BTC", "lot_size": "0.001", "tick_size": "1", "max_leverage": 50},
        {"symbol": "ETH", "lot_size": "0.01", "tick_size": "0.1", "max_leverage": 50},
    ]))
}

#[allow(dead_code)]
pub fn account_body(available: &str) -> String {
    ok_body(json!({
        "balance": available,
        "account_equity": available,
        "available_to_spend": available,
        "total_margin_used": "0",
        "positions_count": 0,
    }))
}

#[allow(dead_code)]
pub fn order_ack_body(order_id: u64) -> String {
    ok_body(json!({"order_id": order_id}))
}

/// A transport scripted for the happy path: BTC/ETH markets, the given
/// available balance, no positions, and order id 42 for every order.
#[allow(dead_code)]
pub fn exchange_with_balance(available: &str) -> Arc<ScriptedTransport> {
    let transport = ScriptedTransport::new();
    transport.respond("/info", 200, markets_body());
    transport.respond("/account", 200, account_body(available));
    transport.respond("/positions", 200, ok_body(json!([])));
    transport.respond("/orders/create_market", 200, order_ack_body(42));
    transport
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[allow(dead_code)]
pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

#[allow(dead_code)]
pub fn fill(master: &str, symbol: &str, side: TradeSide, amount: &str, price: &str) -> Fill {
    Fill {
        master_wallet: master.into(),
        symbol: symbol.into(),
        trade_side: side,
        amount: dec(amount),
        price: dec(price),
        kind: FillKind::FulfillTaker,
        received_at: Utc::now(),
    }
}

/// Deterministic agent key for a copier, by seed byte.
#[allow(dead_code)]
pub fn agent_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// A relationship whose credential is the sealed base58 seed of `agent_key(seed)`.
#[allow(dead_code)]
pub fn relationship(copier: &str, master: &str, sizing: SizingRule, seed: u8) -> CopyRelationship {
    let secret = bs58::encode(agent_key(seed).to_bytes()).into_string();
    CopyRelationship::new(copier, master, EnvelopeVault::seal(&secret), sizing)
}

/// Copy engine over a live dispatcher backed by `transport`.
#[allow(dead_code)]
pub fn engine(
    transport: Arc<ScriptedTransport>,
    relationships: Vec<CopyRelationship>,
    config: CopyEngineConfig,
) -> (CopyEngine, JoinHandle<()>) {
    let store: Arc<dyn RelationshipStore> = Arc::new(InMemoryRelationshipStore::with_relationships(relationships));
    let (dispatcher, task) = spawn_dispatcher(transport, DispatcherConfig::default());
    let engine = CopyEngine::new(
        store,
        Arc::new(EnvelopeVault),
        ExchangeClient::new(dispatcher),
        Arc::new(MarketInfoCache::default()),
        config,
    );
    (engine, task)
}

/// The order fields a POST body carries besides the signature envelope.
#[allow(dead_code)]
pub fn order_data(body: &Value) -> Value {
    let mut data = body.as_object().cloned().unwrap_or_default();
    for key in ["account", "agent_wallet", "signature", "timestamp", "expiry_window"] {
        data.remove(key);
    }
    Value::Object(data)
}
