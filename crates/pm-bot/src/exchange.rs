//! Unified exchange surface consumed by the core.
//!
//! Concrete venue clients (transport, auth, wire formats) live outside this
//! crate and implement `ExchangeClient`. The core only ever sees unified
//! projections: markets with a YES/NO token pair, book event streams, and
//! FOK order results.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pm_common::{Exchange, Outcome, PriceLevel, Side, Trade};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ExchangeError;

/// Venue-agnostic market projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedMarket {
    pub exchange: Exchange,
    pub market_id: String,
    /// Human-readable market question.
    pub question: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    /// Quoted total traded volume (USD).
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    /// Closure timestamp, when the venue provides one.
    pub close_time: Option<DateTime<Utc>>,
    pub active: bool,
}

impl UnifiedMarket {
    /// Token id for an outcome.
    pub fn token_for(&self, outcome: Outcome) -> &str {
        match outcome {
            Outcome::Yes => &self.yes_token_id,
            Outcome::No => &self.no_token_id,
        }
    }

    /// Which outcome a token id represents, if it belongs to this market.
    pub fn outcome_of(&self, token_id: &str) -> Option<Outcome> {
        if token_id == self.yes_token_id {
            Some(Outcome::Yes)
        } else if token_id == self.no_token_id {
            Some(Outcome::No)
        } else {
            None
        }
    }

    /// Globally unique key across venues.
    pub fn global_id(&self) -> String {
        format!("{}:{}", self.exchange, self.market_id)
    }
}

/// Order-book stream event from a venue subscription.
///
/// Venues without native sequence numbers synthesize a per-token monotonic
/// counter before events reach the core.
#[derive(Debug, Clone)]
pub enum BookEvent {
    Snapshot {
        token_id: String,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        seq: u64,
        ts: DateTime<Utc>,
    },
    Delta {
        token_id: String,
        side: Side,
        price: Decimal,
        size: Decimal,
        seq: u64,
        ts: DateTime<Utc>,
    },
}

impl BookEvent {
    pub fn token_id(&self) -> &str {
        match self {
            BookEvent::Snapshot { token_id, .. } => token_id,
            BookEvent::Delta { token_id, .. } => token_id,
        }
    }
}

/// Time-in-force for order placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Fill entirely and immediately, or cancel in full.
    Fok,
    /// Fill what is available immediately, cancel the rest.
    Ioc,
}

/// Request to place an order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    /// Client-generated id for tracking and retries.
    pub client_order_id: String,
    pub token_id: String,
    pub side: Side,
    /// Limit price; `None` submits at the market.
    pub price: Option<Decimal>,
    pub size: Decimal,
    pub tif: TimeInForce,
}

impl OrderRequest {
    /// FOK limit buy, the entry leg shape.
    pub fn fok_buy(token_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            token_id: token_id.into(),
            side: Side::Buy,
            price: Some(price),
            size,
            tif: TimeInForce::Fok,
        }
    }

    /// IOC market sell, the defensive-unwind shape.
    pub fn market_sell(token_id: impl Into<String>, size: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            token_id: token_id.into(),
            side: Side::Sell,
            price: None,
            size,
            tif: TimeInForce::Ioc,
        }
    }

    /// IOC limit sell, the exit-retry shape.
    pub fn limit_sell(token_id: impl Into<String>, price: Decimal, size: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            token_id: token_id.into(),
            side: Side::Sell,
            price: Some(price),
            size,
            tif: TimeInForce::Ioc,
        }
    }
}

/// Result of an order submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderResult {
    Filled {
        venue_order_id: String,
        price: Decimal,
        size: Decimal,
        fee: Decimal,
    },
    Rejected {
        reason: String,
    },
    Timeout,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        matches!(self, OrderResult::Filled { .. })
    }

    pub fn filled_size(&self) -> Decimal {
        match self {
            OrderResult::Filled { size, .. } => *size,
            _ => Decimal::ZERO,
        }
    }
}

/// Capability set the core consumes from each venue.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Which venue this client talks to.
    fn exchange(&self) -> Exchange;

    /// Active binary markets above the volume floor. Rate-limit class:
    /// `Markets`.
    async fn list_markets(&self, min_volume: Decimal)
        -> Result<Vec<UnifiedMarket>, ExchangeError>;

    /// Long-lived book subscription for a token. The implementation owns
    /// reconnects (exponential backoff 5 s -> 60 s, x2, full jitter) and
    /// replays a snapshot after every reconnect.
    async fn subscribe_book(
        &self,
        token_id: &str,
    ) -> Result<mpsc::Receiver<BookEvent>, ExchangeError>;

    /// One-shot snapshot fetch, used to resync after a book invariant
    /// violation. Rate-limit class: `Markets`.
    async fn fetch_book_snapshot(&self, token_id: &str) -> Result<BookEvent, ExchangeError>;

    /// Place an order. Rate-limit class: `Orders`.
    async fn place_order(&self, request: OrderRequest) -> Result<OrderResult, ExchangeError>;

    /// Available balance in `currency`.
    async fn get_balance(&self, currency: &str) -> Result<Decimal, ExchangeError>;
}

/// Sink for executed trade records.
///
/// Implementations persist; they must be idempotent on
/// `(exchange, venue_order_id)`.
#[async_trait]
pub trait TradeSink: Send + Sync {
    async fn record(&self, trade: &Trade);
}

/// In-memory sink: the idempotency reference implementation, and the sink
/// used by tests.
#[derive(Debug, Default)]
pub struct MemoryTradeSink {
    inner: parking_lot::Mutex<MemorySinkState>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    seen: std::collections::HashSet<(Exchange, String)>,
    trades: Vec<Trade>,
}

impl MemoryTradeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.inner.lock().trades.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().trades.is_empty()
    }
}

#[async_trait]
impl TradeSink for MemoryTradeSink {
    async fn record(&self, trade: &Trade) {
        let mut inner = self.inner.lock();
        let key = (trade.exchange, trade.venue_order_id.clone());
        if inner.seen.insert(key) {
            inner.trades.push(trade.clone());
        }
    }
}
