use thiserror::Error;

use crate::exchange::auth::AuthError;

/// Errors surfaced by the execution client and its dispatcher.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited by exchange after retry")]
    RateLimited,

    #[error("exchange returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("exchange rejected request: {0}")]
    Rejected(String),

    #[error("signing failed: {0}")]
    Auth(#[from] AuthError),

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Short label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Transport(_) => "transport",
            ExchangeError::RateLimited => "rate_limited",
            ExchangeError::Api { .. } => "api",
            ExchangeError::Rejected(_) => "rejected",
            ExchangeError::Auth(_) => "auth",
            ExchangeError::Decode(_) => "decode",
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        ExchangeError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Decode(e.to_string())
    }
}
