//! Shared mutable state: the order-book store, control flags, and metrics.
//!
//! Books are keyed by token id. Each book sits behind its own `RwLock`, so
//! the ingestion task for a venue takes the writer side per token while the
//! scorer and engine read concurrently. Tokens whose book violated an
//! invariant are paused until a fresh snapshot arrives.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use pm_common::{PriceLevel, Side};
use rust_decimal::Decimal;

use crate::book::{DeltaApplied, OrderBook};
use crate::error::BookError;

/// Concurrent store of per-token order books.
#[derive(Debug, Default, Clone)]
pub struct SharedBooks {
    books: Arc<DashMap<String, Arc<RwLock<OrderBook>>>>,
    paused: Arc<DashMap<String, ()>>,
}

impl SharedBooks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, token_id: &str) -> Arc<RwLock<OrderBook>> {
        self.books
            .entry(token_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::new(token_id))))
            .clone()
    }

    /// Apply a snapshot; a valid snapshot also unpauses the token.
    pub fn apply_snapshot(
        &self,
        token_id: &str,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        seq: u64,
        ts: DateTime<Utc>,
    ) -> Result<(), BookError> {
        let book = self.entry(token_id);
        book.write().apply_snapshot(bids, asks, seq, ts)?;
        self.paused.remove(token_id);
        Ok(())
    }

    /// Apply a delta under the token's writer lock.
    pub fn apply_delta(
        &self,
        token_id: &str,
        side: Side,
        price: Decimal,
        size: Decimal,
        seq: u64,
        ts: DateTime<Utc>,
    ) -> Result<DeltaApplied, BookError> {
        let book = self.entry(token_id);
        let result = book.write().apply_delta(side, price, size, seq, ts);
        result
    }

    /// Stop evaluating a token until a fresh snapshot lands.
    pub fn pause(&self, token_id: &str) {
        self.paused.insert(token_id.to_string(), ());
    }

    pub fn is_paused(&self, token_id: &str) -> bool {
        self.paused.contains_key(token_id)
    }

    /// Best ask under a shared read lock.
    pub fn best_ask(&self, token_id: &str) -> Option<(Decimal, Decimal)> {
        self.books.get(token_id)?.read().best_ask()
    }

    /// Best bid under a shared read lock.
    pub fn best_bid(&self, token_id: &str) -> Option<(Decimal, Decimal)> {
        self.books.get(token_id)?.read().best_bid()
    }

    /// Ask levels in best-first order, up to `depth`.
    pub fn ask_levels(&self, token_id: &str, depth: usize) -> Vec<PriceLevel> {
        match self.books.get(token_id) {
            Some(book) => book.read().walk(Side::Sell, depth),
            None => Vec::new(),
        }
    }

    /// Bid levels in best-first order, up to `depth`.
    pub fn bid_levels(&self, token_id: &str, depth: usize) -> Vec<PriceLevel> {
        match self.books.get(token_id) {
            Some(book) => book.read().walk(Side::Buy, depth),
            None => Vec::new(),
        }
    }

    /// Milliseconds since the token's last book update.
    pub fn age_ms(&self, token_id: &str, now: DateTime<Utc>) -> i64 {
        match self.books.get(token_id) {
            Some(book) => book.read().age_ms(now),
            None => i64::MAX,
        }
    }

    /// Whether the token's book is usable for evaluation right now.
    pub fn is_evaluable(&self, token_id: &str, now: DateTime<Utc>, max_age_ms: i64) -> bool {
        if self.is_paused(token_id) {
            return false;
        }
        match self.books.get(token_id) {
            Some(book) => {
                let book = book.read();
                book.is_valid() && !book.is_stale(now, max_age_ms)
            }
            None => false,
        }
    }

    pub fn tracked_tokens(&self) -> usize {
        self.books.len()
    }
}

/// Lock-free control flags: the hot path reads are two atomic loads.
#[derive(Debug, Default)]
pub struct ControlFlags {
    trading_enabled: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn enable_trading(&self) {
        self.trading_enabled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn disable_trading(&self) {
        self.trading_enabled.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_trading_enabled(&self) -> bool {
        self.trading_enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }
}

/// Relaxed counters for observability; exact counts are not load-bearing.
#[derive(Debug, Default)]
pub struct MetricsCounters {
    pub book_events: AtomicU64,
    pub opportunities_detected: AtomicU64,
    pub trades_executed: AtomicU64,
    pub fills_rejected: AtomicU64,
    pub slippage_aborts: AtomicU64,
    pub partial_unwinds: AtomicU64,
}

impl MetricsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            book_events: self.book_events.load(Ordering::Relaxed),
            opportunities_detected: self.opportunities_detected.load(Ordering::Relaxed),
            trades_executed: self.trades_executed.load(Ordering::Relaxed),
            fills_rejected: self.fills_rejected.load(Ordering::Relaxed),
            slippage_aborts: self.slippage_aborts.load(Ordering::Relaxed),
            partial_unwinds: self.partial_unwinds.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub book_events: u64,
    pub opportunities_detected: u64,
    pub trades_executed: u64,
    pub fills_rejected: u64,
    pub slippage_aborts: u64,
    pub partial_unwinds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_then_reads() {
        let books = SharedBooks::new();
        books
            .apply_snapshot(
                "tok",
                &[PriceLevel::new(dec!(0.45), dec!(100))],
                &[PriceLevel::new(dec!(0.55), dec!(150))],
                1,
                Utc::now(),
            )
            .unwrap();

        assert_eq!(books.best_bid("tok"), Some((dec!(0.45), dec!(100))));
        assert_eq!(books.best_ask("tok"), Some((dec!(0.55), dec!(150))));
        assert_eq!(books.ask_levels("tok", 5).len(), 1);
        assert_eq!(books.tracked_tokens(), 1);
    }

    #[test]
    fn test_unknown_token_reads_empty() {
        let books = SharedBooks::new();
        assert_eq!(books.best_ask("missing"), None);
        assert!(books.ask_levels("missing", 5).is_empty());
        assert_eq!(books.age_ms("missing", Utc::now()), i64::MAX);
        assert!(!books.is_evaluable("missing", Utc::now(), 2000));
    }

    #[test]
    fn test_pause_blocks_evaluation_until_snapshot() {
        let books = SharedBooks::new();
        let now = Utc::now();
        books
            .apply_snapshot(
                "tok",
                &[],
                &[PriceLevel::new(dec!(0.55), dec!(150))],
                1,
                now,
            )
            .unwrap();

        books.pause("tok");
        assert!(books.is_paused("tok"));
        assert!(!books.is_evaluable("tok", now, 2000));

        // A fresh snapshot clears the pause.
        books
            .apply_snapshot(
                "tok",
                &[PriceLevel::new(dec!(0.45), dec!(10))],
                &[PriceLevel::new(dec!(0.55), dec!(150))],
                2,
                now,
            )
            .unwrap();
        assert!(!books.is_paused("tok"));
        assert!(books.is_evaluable("tok", now, 2000));
    }

    #[test]
    fn test_stale_book_not_evaluable() {
        let books = SharedBooks::new();
        let old = Utc::now() - chrono::Duration::seconds(10);
        books
            .apply_snapshot(
                "tok",
                &[PriceLevel::new(dec!(0.45), dec!(10))],
                &[PriceLevel::new(dec!(0.55), dec!(150))],
                1,
                old,
            )
            .unwrap();
        assert!(!books.is_evaluable("tok", Utc::now(), 2000));
    }

    #[test]
    fn test_delta_routes_to_book() {
        let books = SharedBooks::new();
        let now = Utc::now();
        books
            .apply_snapshot("tok", &[], &[PriceLevel::new(dec!(0.55), dec!(150))], 1, now)
            .unwrap();
        books
            .apply_delta("tok", Side::Sell, dec!(0.54), dec!(25), 2, now)
            .unwrap();
        assert_eq!(books.best_ask("tok"), Some((dec!(0.54), dec!(25))));
    }

    #[test]
    fn test_control_flags() {
        let flags = ControlFlags::new();
        assert!(!flags.is_trading_enabled());
        assert!(!flags.is_shutdown_requested());

        flags.enable_trading();
        assert!(flags.is_trading_enabled());
        flags.disable_trading();
        assert!(!flags.is_trading_enabled());

        flags.request_shutdown();
        assert!(flags.is_shutdown_requested());
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = MetricsCounters::new();
        MetricsCounters::incr(&metrics.trades_executed);
        MetricsCounters::incr(&metrics.trades_executed);
        MetricsCounters::incr(&metrics.slippage_aborts);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.trades_executed, 2);
        assert_eq!(snapshot.slippage_aborts, 1);
        assert_eq!(snapshot.fills_rejected, 0);
    }
}
