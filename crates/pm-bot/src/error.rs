//! Error taxonomy for the arbitrage core.
//!
//! Each component handles its own class locally and re-emits a typed event;
//! only `Unrecoverable` propagates up to shutdown.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by order book maintenance.
#[derive(Debug, Error)]
pub enum BookError {
    /// Best bid at or above best ask. The token must be resynced from a
    /// fresh snapshot before evaluation resumes.
    #[error("crossed book for {token_id}: bid {bid} >= ask {ask}")]
    Crossed {
        token_id: String,
        bid: Decimal,
        ask: Decimal,
    },

    #[error("invalid price level for {token_id}: price {price}")]
    InvalidPrice { token_id: String, price: Decimal },

    #[error("negative size for {token_id} at {price}: {size}")]
    NegativeSize {
        token_id: String,
        price: Decimal,
        size: Decimal,
    },
}

/// Errors surfaced by exchange clients.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient network failure: {0}")]
    Transient(String),

    #[error("rate limited by venue")]
    RateLimited,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("unknown token: {0}")]
    UnknownToken(String),

    #[error("internal exchange client error: {0}")]
    Internal(String),
}

impl ExchangeError {
    /// Whether the caller should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient(_) | ExchangeError::RateLimited | ExchangeError::Timeout(_)
        )
    }
}

/// Errors raised by the rate limiter.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// Background-priority request refused while the window is full.
    #[error("request dropped: window full for {key}")]
    Dropped { key: String },

    /// Normal-priority request exhausted its backoff budget.
    #[error("backoff exhausted for {key} after {attempts} attempts")]
    BackoffExhausted { key: String, attempts: u32 },
}

/// Errors raised inside the engine's evaluate-and-execute critical section.
///
/// Everything except `Unrecoverable` aborts the single opportunity only.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Effective price moved adversely between detection and execution.
    #[error("slippage exceeded for {market_id}: expected {expected}, current {current}")]
    SlippageExceeded {
        market_id: String,
        expected: Decimal,
        current: Decimal,
    },

    /// One leg filled and the other did not; the filled leg was unwound.
    #[error("partial fill unwound for {market_id}: {filled_outcome} filled, loss {loss}")]
    PartialFillUnwound {
        market_id: String,
        filled_outcome: pm_common::Outcome,
        loss: Decimal,
    },

    #[error("book invariant violated")]
    Book(#[from] BookError),

    #[error("exchange error")]
    Exchange(#[from] ExchangeError),

    #[error("rate limit")]
    RateLimit(#[from] RateLimitError),

    /// Clean-shutdown class: configuration or authentication failures.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl EngineError {
    /// Only unrecoverable errors propagate to shutdown.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Unrecoverable(_) => true,
            EngineError::Exchange(ExchangeError::AuthRejected(_)) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exchange_error_transience() {
        assert!(ExchangeError::Transient("reset".into()).is_transient());
        assert!(ExchangeError::RateLimited.is_transient());
        assert!(ExchangeError::Timeout("order".into()).is_transient());
        assert!(!ExchangeError::AuthRejected("bad key".into()).is_transient());
    }

    #[test]
    fn test_engine_error_fatality() {
        let slippage = EngineError::SlippageExceeded {
            market_id: "m1".into(),
            expected: dec!(0.97),
            current: dec!(0.99),
        };
        assert!(!slippage.is_fatal());

        let auth = EngineError::Exchange(ExchangeError::AuthRejected("expired".into()));
        assert!(auth.is_fatal());

        let fatal = EngineError::Unrecoverable("bad config".into());
        assert!(fatal.is_fatal());
    }

    #[test]
    fn test_crossed_book_display() {
        let err = BookError::Crossed {
            token_id: "tok".into(),
            bid: dec!(0.55),
            ask: dec!(0.54),
        };
        let msg = err.to_string();
        assert!(msg.contains("crossed"));
        assert!(msg.contains("0.55"));
    }
}
