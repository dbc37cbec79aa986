//! Per-token order book with sequence-gated delta application.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.
//!
//! Prices are normalized to 6 decimal places and sizes to 4 on ingest.
//! Deltas carry sequence numbers; anything at or below the stored sequence
//! is dropped without touching state. A crossed book is rejected so the
//! engine can pause the token and request a fresh snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pm_common::{PriceLevel, Side};
use rust_decimal::Decimal;

use crate::error::BookError;

/// Price resolution in decimal places.
pub const PRICE_DP: u32 = 6;
/// Size resolution in decimal places.
pub const SIZE_DP: u32 = 4;

/// Outcome of applying a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaApplied {
    /// The delta mutated the book.
    Applied,
    /// The delta carried a stale sequence number and was dropped.
    StaleSeq,
}

/// In-memory order book for a single token.
#[derive(Debug, Clone)]
pub struct OrderBook {
    /// Token this book belongs to.
    pub token_id: String,
    /// Bid levels (price -> size). Iterated in reverse for best-first order.
    bids: BTreeMap<Decimal, Decimal>,
    /// Ask levels (price -> size). Iterated forward for best-first order.
    asks: BTreeMap<Decimal, Decimal>,
    /// Monotonically non-decreasing sequence number.
    seq: u64,
    /// Last successful update.
    last_update: Option<DateTime<Utc>>,
}

impl OrderBook {
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            seq: 0,
            last_update: None,
        }
    }

    /// Current sequence number.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Last update timestamp.
    #[inline]
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Milliseconds since the last update, `i64::MAX` if never updated.
    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        match self.last_update {
            Some(ts) => (now - ts).num_milliseconds(),
            None => i64::MAX,
        }
    }

    /// True when the book has not been updated within `max_age_ms`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age_ms: i64) -> bool {
        self.age_ms(now) > max_age_ms
    }

    /// Replace both sides from a snapshot and set the sequence number.
    ///
    /// Duplicate prices within a side are merged. Zero-size levels are
    /// skipped. Rejects crossed snapshots without clearing the error state:
    /// the caller resubscribes and the next snapshot overwrites everything.
    pub fn apply_snapshot(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        seq: u64,
        ts: DateTime<Utc>,
    ) -> Result<(), BookError> {
        let mut new_bids = BTreeMap::new();
        let mut new_asks = BTreeMap::new();

        for level in bids {
            let (price, size) = self.normalize(level.price, level.size)?;
            if size > Decimal::ZERO {
                *new_bids.entry(price).or_insert(Decimal::ZERO) += size;
            }
        }
        for level in asks {
            let (price, size) = self.normalize(level.price, level.size)?;
            if size > Decimal::ZERO {
                *new_asks.entry(price).or_insert(Decimal::ZERO) += size;
            }
        }

        if let (Some((&bid, _)), Some((&ask, _))) =
            (new_bids.iter().next_back(), new_asks.iter().next())
        {
            if bid >= ask {
                return Err(BookError::Crossed {
                    token_id: self.token_id.clone(),
                    bid,
                    ask,
                });
            }
        }

        self.bids = new_bids;
        self.asks = new_asks;
        self.seq = seq;
        self.last_update = Some(ts);
        Ok(())
    }

    /// Apply a single-level delta.
    ///
    /// A delta with `seq <= current_seq` is dropped silently. A size of
    /// zero deletes the level. A delta that would cross the book is
    /// rejected after being rolled back.
    pub fn apply_delta(
        &mut self,
        side: Side,
        price: Decimal,
        size: Decimal,
        seq: u64,
        ts: DateTime<Utc>,
    ) -> Result<DeltaApplied, BookError> {
        if seq <= self.seq {
            return Ok(DeltaApplied::StaleSeq);
        }
        let (price, size) = self.normalize(price, size)?;

        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let previous = if size.is_zero() {
            levels.remove(&price)
        } else {
            levels.insert(price, size)
        };

        if let (Some((&bid, _)), Some((&ask, _))) =
            (self.bids.iter().next_back(), self.asks.iter().next())
        {
            if bid >= ask {
                // Roll back so observable state is unchanged by the bad delta.
                let levels = match side {
                    Side::Buy => &mut self.bids,
                    Side::Sell => &mut self.asks,
                };
                match previous {
                    Some(old) => {
                        levels.insert(price, old);
                    }
                    None => {
                        levels.remove(&price);
                    }
                }
                return Err(BookError::Crossed {
                    token_id: self.token_id.clone(),
                    bid,
                    ask,
                });
            }
        }

        self.seq = seq;
        self.last_update = Some(ts);
        Ok(DeltaApplied::Applied)
    }

    fn normalize(&self, price: Decimal, size: Decimal) -> Result<(Decimal, Decimal), BookError> {
        let price = price.round_dp(PRICE_DP);
        let size = size.round_dp(SIZE_DP);
        if price <= Decimal::ZERO || price > Decimal::ONE {
            return Err(BookError::InvalidPrice {
                token_id: self.token_id.clone(),
                price,
            });
        }
        if size < Decimal::ZERO {
            return Err(BookError::NegativeSize {
                token_id: self.token_id.clone(),
                price,
                size,
            });
        }
        Ok((price, size))
    }

    /// Best level of a side as (price, size).
    pub fn best(&self, side: Side) -> Option<(Decimal, Decimal)> {
        match side {
            Side::Buy => self.bids.iter().next_back().map(|(p, s)| (*p, *s)),
            Side::Sell => self.asks.iter().next().map(|(p, s)| (*p, *s)),
        }
    }

    /// Best bid (price, size).
    #[inline]
    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.best(Side::Buy)
    }

    /// Best ask (price, size).
    #[inline]
    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.best(Side::Sell)
    }

    /// Up to `max_levels` levels in directional order: bids descending,
    /// asks ascending.
    pub fn walk(&self, side: Side, max_levels: usize) -> Vec<PriceLevel> {
        match side {
            Side::Buy => self
                .bids
                .iter()
                .rev()
                .take(max_levels)
                .map(|(p, s)| PriceLevel::new(*p, *s))
                .collect(),
            Side::Sell => self
                .asks
                .iter()
                .take(max_levels)
                .map(|(p, s)| PriceLevel::new(*p, *s))
                .collect(),
        }
    }

    /// Bid-ask spread, when both sides are present.
    pub fn spread(&self) -> Option<Decimal> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some(ask - bid)
    }

    /// True when both sides have at least one level.
    pub fn is_valid(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// True when neither side has any levels.
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc::now()
    }

    fn snapshot_book() -> OrderBook {
        let mut book = OrderBook::new("tok");
        book.apply_snapshot(
            &[
                PriceLevel::new(dec!(0.45), dec!(100)),
                PriceLevel::new(dec!(0.44), dec!(200)),
            ],
            &[
                PriceLevel::new(dec!(0.55), dec!(150)),
                PriceLevel::new(dec!(0.56), dec!(250)),
            ],
            10,
            ts(),
        )
        .unwrap();
        book
    }

    #[test]
    fn test_snapshot_sets_state() {
        let book = snapshot_book();
        assert_eq!(book.seq(), 10);
        assert_eq!(book.best_bid(), Some((dec!(0.45), dec!(100))));
        assert_eq!(book.best_ask(), Some((dec!(0.55), dec!(150))));
        assert!(book.is_valid());
    }

    #[test]
    fn test_snapshot_merges_duplicate_prices() {
        let mut book = OrderBook::new("tok");
        book.apply_snapshot(
            &[],
            &[
                PriceLevel::new(dec!(0.50), dec!(100)),
                PriceLevel::new(dec!(0.50), dec!(50)),
            ],
            1,
            ts(),
        )
        .unwrap();
        assert_eq!(book.best_ask(), Some((dec!(0.50), dec!(150))));
        assert_eq!(book.walk(Side::Sell, 10).len(), 1);
    }

    #[test]
    fn test_crossed_snapshot_rejected() {
        let mut book = OrderBook::new("tok");
        let result = book.apply_snapshot(
            &[PriceLevel::new(dec!(0.55), dec!(100))],
            &[PriceLevel::new(dec!(0.54), dec!(100))],
            1,
            ts(),
        );
        assert!(matches!(result, Err(BookError::Crossed { .. })));
    }

    #[test]
    fn test_delta_updates_and_deletes() {
        let mut book = snapshot_book();

        // Update existing bid level.
        book.apply_delta(Side::Buy, dec!(0.45), dec!(120), 11, ts())
            .unwrap();
        assert_eq!(book.best_bid(), Some((dec!(0.45), dec!(120))));

        // Zero size deletes.
        book.apply_delta(Side::Buy, dec!(0.45), dec!(0), 12, ts())
            .unwrap();
        assert_eq!(book.best_bid(), Some((dec!(0.44), dec!(200))));
    }

    #[test]
    fn test_stale_seq_dropped_silently() {
        let mut book = snapshot_book();
        let result = book
            .apply_delta(Side::Buy, dec!(0.46), dec!(500), 10, ts())
            .unwrap();
        assert_eq!(result, DeltaApplied::StaleSeq);
        // Observable state unchanged.
        assert_eq!(book.best_bid(), Some((dec!(0.45), dec!(100))));
        assert_eq!(book.seq(), 10);
    }

    #[test]
    fn test_crossing_delta_rejected_and_rolled_back() {
        let mut book = snapshot_book();
        let result = book.apply_delta(Side::Buy, dec!(0.55), dec!(10), 11, ts());
        assert!(matches!(result, Err(BookError::Crossed { .. })));
        // Book state and seq untouched.
        assert_eq!(book.best_bid(), Some((dec!(0.45), dec!(100))));
        assert_eq!(book.seq(), 10);
    }

    #[test]
    fn test_walk_directional_order() {
        let book = snapshot_book();

        let bids = book.walk(Side::Buy, 10);
        assert_eq!(bids[0].price, dec!(0.45));
        assert_eq!(bids[1].price, dec!(0.44));

        let asks = book.walk(Side::Sell, 10);
        assert_eq!(asks[0].price, dec!(0.55));
        assert_eq!(asks[1].price, dec!(0.56));

        assert_eq!(book.walk(Side::Sell, 1).len(), 1);
    }

    #[test]
    fn test_invalid_price_rejected() {
        let mut book = OrderBook::new("tok");
        let result = book.apply_delta(Side::Sell, dec!(1.5), dec!(10), 1, ts());
        assert!(matches!(result, Err(BookError::InvalidPrice { .. })));

        let result = book.apply_delta(Side::Sell, dec!(0), dec!(10), 1, ts());
        assert!(matches!(result, Err(BookError::InvalidPrice { .. })));
    }

    #[test]
    fn test_negative_size_rejected() {
        let mut book = OrderBook::new("tok");
        let result = book.apply_delta(Side::Sell, dec!(0.5), dec!(-1), 1, ts());
        assert!(matches!(result, Err(BookError::NegativeSize { .. })));
    }

    #[test]
    fn test_fixed_point_normalization() {
        let mut book = OrderBook::new("tok");
        book.apply_delta(Side::Sell, dec!(0.1234567), dec!(10.00009), 1, ts())
            .unwrap();
        let (price, size) = book.best_ask().unwrap();
        assert_eq!(price, dec!(0.123457));
        assert_eq!(size, dec!(10.0001));
    }

    #[test]
    fn test_staleness() {
        let mut book = OrderBook::new("tok");
        assert!(book.is_stale(ts(), 2000));

        let old = ts() - chrono::Duration::seconds(5);
        book.apply_snapshot(&[], &[PriceLevel::new(dec!(0.5), dec!(10))], 1, old)
            .unwrap();
        assert!(book.is_stale(ts(), 2000));
        assert!(!book.is_stale(old + chrono::Duration::seconds(1), 2000));
    }

    #[test]
    fn test_monotone_seq_property() {
        // Property 1: out-of-order deltas never change observable state.
        let mut book = snapshot_book();
        let before = book.walk(Side::Sell, 20);
        for seq in [9, 10, 5, 0] {
            let r = book
                .apply_delta(Side::Sell, dec!(0.60), dec!(99), seq, ts())
                .unwrap();
            assert_eq!(r, DeltaApplied::StaleSeq);
        }
        assert_eq!(book.walk(Side::Sell, 20), before);
    }
}
