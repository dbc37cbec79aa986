//! Shared types for the prediction-market arbitrage core.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod types;

pub use types::{Exchange, Outcome, PriceLevel, Side, Trade};
