//! Arbitrage detection and execution core for binary prediction markets.
//!
//! A YES share and its complementary NO share redeem to exactly $1.00 at
//! resolution. Whenever both asks can be crossed for less than $1.00 net of
//! fees, buying matched pairs locks a deterministic profit. This crate
//! detects those windows over live order books, sizes into them against
//! real depth, and executes both legs as simultaneous fill-or-kill buys.
//!
//! ## Architecture
//!
//! - **Depth-aware detection**: effective prices are computed by sweeping
//!   the book, never from top-of-book quotes
//! - **Gated execution**: per-market locks, cooldowns, quality scores,
//!   capital allocation, and a slippage recheck guard every order
//! - **Risk containment**: stop-loss / take-profit exits, a daily loss
//!   halt, and defensive unwinds of one-sided fills
//! - **Venue-agnostic**: exchanges plug in behind the `ExchangeClient`
//!   trait; cross-venue pairs are matched by title similarity
//!
//! ## Modules
//!
//! - `config`: typed configuration with TOML loading and env overrides
//! - `book` / `state`: sequence-gated order books behind per-token locks
//! - `impact`: effective-price math and the optimal pair-size search
//! - `engine`: the detection loop and execution critical section
//! - `risk` / `positions`: exits, daily loss gate, live P&L monitoring
//! - `matcher`: cross-venue market pairing

pub mod allocator;
pub mod book;
pub mod config;
pub mod cooldown;
pub mod engine;
pub mod error;
pub mod events;
pub mod exchange;
pub mod impact;
pub mod locks;
pub mod matcher;
pub mod opportunity;
pub mod positions;
pub mod ratelimit;
pub mod risk;
pub mod scorer;
pub mod state;

pub use allocator::{AllocationResult, CapitalAllocator};
pub use book::{DeltaApplied, OrderBook, PRICE_DP, SIZE_DP};
pub use config::{
    init_tracing, BotConfig, ExecutionConfig, MarketConfig, RiskConfig, TradingConfig,
};
pub use cooldown::CooldownManager;
pub use engine::ArbitrageEngine;
pub use error::{BookError, EngineError, ExchangeError, RateLimitError};
pub use events::{Event, EventBus, EventEnvelope, ExitReason};
pub use exchange::{
    BookEvent, ExchangeClient, MemoryTradeSink, OrderRequest, OrderResult, TimeInForce,
    TradeSink, UnifiedMarket,
};
pub use impact::{effective_cost, find_optimal_size, max_shares_under, shares_for_spend, ImpactResult};
pub use locks::{ExecutionGuard, ExecutionLocks};
pub use matcher::{jaccard, normalize_title, CrossPlatformMatcher, MarketPair};
pub use opportunity::{Opportunity, OpportunityCache};
pub use positions::{Position, PositionMonitor};
pub use ratelimit::{EndpointClass, Priority, RateLimiter};
pub use risk::{spawn_risk_task, RiskHandle, RiskManager, RiskSnapshot};
pub use scorer::{MarketScore, MarketScorer, ScoreWeights};
pub use state::{ControlFlags, MetricsCounters, MetricsSnapshot, SharedBooks};
