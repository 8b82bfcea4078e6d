pub mod auth;
pub mod client;
pub mod dispatcher;
pub mod market_cache;
pub mod transport;
pub mod types;

pub use auth::{AgentSigner, AuthError};
pub use client::ExchangeClient;
pub use dispatcher::{spawn_dispatcher, DispatcherConfig, DispatcherHandle};
pub use market_cache::MarketInfoCache;
pub use transport::{ApiRequest, ApiResponse, HttpMethod, HttpTransport, ReqwestTransport};
pub use types::{AccountSnapshot, ApiMarket, ApiPosition, LimitOrder, MarketOrder, WsAccountTrade, WsCommand};
