//! Typed error kinds.
//!
//! `DataInsufficient` is deliberately absent here: it is a `Momentum`
//! value (see `model.rs`), not an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Connect/timeout/5xx/429 — retryable by the scheduler; bubbled to
    /// the caller only after retries are exhausted.
    #[error("transient network error talking to {exchange}: {message}")]
    NetworkTransient { exchange: String, message: String },

    /// 4xx other than 429 — fail fast, skip that symbol this round.
    #[error("permanent network error talking to {exchange}: {message}")]
    NetworkPermanent { exchange: String, message: String },

    /// Malformed upstream payload.
    #[error("failed to parse payload from {exchange}: {message}")]
    Parse { exchange: String, message: String },

    /// A 429 was observed; the scheduler pauses its queue and this call
    /// fails immediately.
    #[error("rate limited by {exchange}")]
    RateLimited { exchange: String },

    /// Shutdown or an explicit queue clear.
    #[error("operation cancelled")]
    Cancelled,

    /// Bad client input (invalid timeframe, missing fields).
    #[error("invalid request: {0}")]
    ValidationError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::NetworkTransient { .. })
    }
}
