//! Core vocabulary types shared across the workspace.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Supported prediction-market venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Polymarket,
    Kalshi,
}

impl Exchange {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Polymarket => "polymarket",
            Exchange::Kalshi => "kalshi",
        }
    }

    /// All venues the core knows about.
    pub fn all() -> &'static [Exchange] {
        &[Exchange::Polymarket, Exchange::Kalshi]
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "polymarket" | "poly" => Ok(Exchange::Polymarket),
            "kalshi" => Ok(Exchange::Kalshi),
            _ => Err(format!("Unknown exchange: {}", s)),
        }
    }
}

/// Order side for trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Outcome token of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
}

impl Outcome {
    pub fn opposite(&self) -> Self {
        match self {
            Outcome::Yes => Outcome::No,
            Outcome::No => Outcome::Yes,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Yes => write!(f, "YES"),
            Outcome::No => write!(f, "NO"),
        }
    }
}

/// A single price level (price + size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price in collateral units (0.00 to 1.00 for binary shares).
    pub price: Decimal,
    /// Quantity available at this price.
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    /// Total notional at this level.
    #[inline]
    pub fn cost(&self) -> Decimal {
        self.price * self.size
    }
}

/// Immutable record of one executed leg.
///
/// The trade sink is idempotent on `(exchange, venue_order_id)`, so the
/// venue-assigned order id travels with every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Execution timestamp.
    pub ts: DateTime<Utc>,
    /// Market identifier on the venue.
    pub market_id: String,
    /// Token that was traded (YES or NO token id).
    pub token_id: String,
    /// Which outcome the token represents.
    pub outcome: Outcome,
    /// Buy or sell.
    pub side: Side,
    /// Fill price.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Fill size in shares.
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    /// Fee paid on this leg.
    #[serde(with = "rust_decimal::serde::str")]
    pub fee: Decimal,
    /// Venue the leg executed on.
    pub exchange: Exchange,
    /// Venue-assigned order id (idempotency key together with `exchange`).
    pub venue_order_id: String,
}

impl Trade {
    /// Notional value of the fill.
    #[inline]
    pub fn notional(&self) -> Decimal {
        self.price * self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_exchange_roundtrip() {
        assert_eq!(Exchange::Polymarket.as_str(), "polymarket");
        assert_eq!(Exchange::Kalshi.as_str(), "kalshi");
        assert_eq!("kalshi".parse::<Exchange>().unwrap(), Exchange::Kalshi);
        assert_eq!("POLY".parse::<Exchange>().unwrap(), Exchange::Polymarket);
        assert!("nyse".parse::<Exchange>().is_err());
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_outcome_opposite() {
        assert_eq!(Outcome::Yes.opposite(), Outcome::No);
        assert_eq!(Outcome::No.opposite(), Outcome::Yes);
    }

    #[test]
    fn test_price_level_cost() {
        let level = PriceLevel::new(dec!(0.45), dec!(100));
        assert_eq!(level.cost(), dec!(45));
    }

    #[test]
    fn test_trade_serialization() {
        let trade = Trade {
            ts: Utc::now(),
            market_id: "mkt-1".to_string(),
            token_id: "tok-yes".to_string(),
            outcome: Outcome::Yes,
            side: Side::Buy,
            price: dec!(0.48),
            size: dec!(20),
            fee: dec!(0.096),
            exchange: Exchange::Polymarket,
            venue_order_id: "ord-123".to_string(),
        };
        assert_eq!(trade.notional(), dec!(9.60));

        let json = serde_json::to_string(&trade).unwrap();
        let parsed: Trade = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, trade);
    }
}
