use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::errors::ExchangeError;

use super::auth::AgentSigner;
use super::dispatcher::DispatcherHandle;
use super::transport::{ApiRequest, ApiResponse};
use super::types::{
    AccountSnapshot, ApiEnvelope, ApiMarket, ApiOpenOrder, ApiPosition, LimitOrder, MarketOrder,
    OrderAck,
};

const DEFAULT_EXPIRY_WINDOW_MS: u64 = 5_000;

/// Signed execution client.
///
/// Reads are plain GETs; writes are signed with the copier's agent key. All
/// calls share the dispatcher's rate budget.
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    dispatcher: DispatcherHandle,
    expiry_window_ms: u64,
}

impl ExchangeClient {
    pub fn new(dispatcher: DispatcherHandle) -> Self {
        Self {
            dispatcher,
            expiry_window_ms: DEFAULT_EXPIRY_WINDOW_MS,
        }
    }

    pub fn with_expiry_window(mut self, expiry_window_ms: u64) -> Self {
        self.expiry_window_ms = expiry_window_ms;
        self
    }

    // -- reads --------------------------------------------------------------

    pub async fn get_account(&self, account: &str) -> Result<AccountSnapshot, ExchangeError> {
        let req = ApiRequest::get("/account").query("account", account);
        self.fetch(req).await
    }

    pub async fn get_positions(&self, account: &str) -> Result<Vec<ApiPosition>, ExchangeError> {
        let req = ApiRequest::get("/positions").query("account", account);
        self.fetch_list(req).await
    }

    pub async fn get_open_orders(
        &self,
        account: &str,
        status: Option<&str>,
    ) -> Result<Vec<ApiOpenOrder>, ExchangeError> {
        let mut req = ApiRequest::get("/orders").query("account", account);
        if let Some(status) = status {
            req = req.query("status", status);
        }
        self.fetch_list(req).await
    }

    /// Market metadata for every listed symbol.
    pub async fn get_markets(&self) -> Result<Vec<ApiMarket>, ExchangeError> {
        self.fetch_list(ApiRequest::get("/info")).await
    }

    // -- writes -------------------------------------------------------------

    pub async fn create_market_order(
        &self,
        signer: &AgentSigner,
        account: &str,
        order: &MarketOrder,
    ) -> Result<OrderAck, ExchangeError> {
        let mut data = json!({
            "symbol": order.symbol,
            "amount": order.amount.normalize().to_string(),
            "side": order.side.as_str(),
            "slippage_percent": order.slippage_percent.normalize().to_string(),
            "reduce_only": order.reduce_only,
        });
        insert_client_order_id(&mut data, order.client_order_id.as_deref());

        self.submit_signed("/orders/create_market", "create_market_order", signer, account, data)
            .await
    }

    pub async fn create_limit_order(
        &self,
        signer: &AgentSigner,
        account: &str,
        order: &LimitOrder,
    ) -> Result<OrderAck, ExchangeError> {
        let tif = if order.post_only { "ALO" } else { "GTC" };
        let mut data = json!({
            "symbol": order.symbol,
            "price": order.price.normalize().to_string(),
            "amount": order.amount.normalize().to_string(),
            "side": order.side.as_str(),
            "tif": tif,
            "reduce_only": order.reduce_only,
        });
        insert_client_order_id(&mut data, order.client_order_id.as_deref());

        self.submit_signed("/orders/create", "create_order", signer, account, data)
            .await
    }

    pub async fn cancel_order(
        &self,
        signer: &AgentSigner,
        account: &str,
        symbol: &str,
        order_id: u64,
    ) -> Result<(), ExchangeError> {
        let data = json!({
            "symbol": symbol,
            "order_id": order_id,
        });
        let _: Value = self
            .submit_signed("/orders/cancel", "cancel_order", signer, account, data)
            .await?;
        Ok(())
    }

    // -- plumbing -----------------------------------------------------------

    async fn submit_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        action_type: &str,
        signer: &AgentSigner,
        account: &str,
        data: Value,
    ) -> Result<T, ExchangeError> {
        let body = self.signed_body(action_type, signer, account, data, Utc::now().timestamp_millis())?;
        self.fetch(ApiRequest::post(path, body)).await
    }

    /// Build the request body: the signed fields followed by the action data
    /// flattened to the top level.
    pub fn signed_body(
        &self,
        action_type: &str,
        signer: &AgentSigner,
        account: &str,
        data: Value,
        timestamp: i64,
    ) -> Result<Value, ExchangeError> {
        let signature = signer.sign_action(action_type, timestamp, self.expiry_window_ms, &data)?;

        let mut body = Map::new();
        body.insert("account".into(), Value::String(account.to_string()));
        body.insert("agent_wallet".into(), Value::String(signer.agent_wallet().to_string()));
        body.insert("signature".into(), Value::String(signature));
        body.insert("timestamp".into(), json!(timestamp));
        body.insert("expiry_window".into(), json!(self.expiry_window_ms));
        if let Value::Object(fields) = data {
            body.extend(fields);
        }
        Ok(Value::Object(body))
    }

    async fn fetch<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T, ExchangeError> {
        let resp = self.dispatcher.enqueue(req).await?;
        decode_envelope(&resp)
    }

    async fn fetch_list<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<Vec<T>, ExchangeError> {
        let resp = self.dispatcher.enqueue(req).await?;
        let list: Option<Vec<T>> = decode_envelope(&resp)?;
        Ok(list.unwrap_or_default())
    }
}

fn insert_client_order_id(data: &mut Value, client_order_id: Option<&str>) {
    if let (Some(id), Value::Object(map)) = (client_order_id, data) {
        map.insert("client_order_id".into(), Value::String(id.to_string()));
    }
}

/// Unwrap `{success, data, error}`. A body with `success: false` is a
/// rejection even on HTTP 200.
fn decode_envelope<T: DeserializeOwned>(resp: &ApiResponse) -> Result<T, ExchangeError> {
    let envelope: ApiEnvelope<Value> = serde_json::from_str(&resp.body)
        .map_err(|e| ExchangeError::Decode(format!("{e}: {}", truncate(&resp.body))))?;

    if envelope.success == Some(false) {
        return Err(ExchangeError::Rejected(
            envelope.error.unwrap_or_else(|| "unknown error".into()),
        ));
    }

    let data = envelope.data.unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|e| ExchangeError::Decode(e.to_string()))
}

fn truncate(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}
