//! Arbitrage opportunity records and the ranked live cache.
//!
//! The cache keeps the single best opportunity per market, with hysteresis
//! so the entry is only replaced by a meaningfully better one (or once the
//! incumbent is old enough that "better" is moot).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use pm_common::Exchange;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Minimum ROI improvement ratio required to displace a fresh entry.
const REPLACE_HYSTERESIS: Decimal = Decimal::from_parts(105, 0, 0, false, 2); // 1.05
/// Entries older than this are replaced without the hysteresis test.
const REPLACE_AGE_SECS: i64 = 2;

/// A detected arbitrage opportunity at a specific size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Market id; for cross-venue pairs, the synthetic pair id.
    pub market_id: String,
    /// Venue of the YES leg.
    pub yes_exchange: Exchange,
    /// Venue of the NO leg.
    pub no_exchange: Exchange,
    pub yes_token_id: String,
    pub no_token_id: String,
    /// Depth-weighted YES price at `shares`.
    #[serde(with = "rust_decimal::serde::str")]
    pub eff_yes: Decimal,
    /// Depth-weighted NO price at `shares`.
    #[serde(with = "rust_decimal::serde::str")]
    pub eff_no: Decimal,
    /// Ask levels consumed on the YES side.
    pub yes_levels: usize,
    /// Ask levels consumed on the NO side.
    pub no_levels: usize,
    /// Optimal pair size from the depth search.
    #[serde(with = "rust_decimal::serde::str")]
    pub shares: Decimal,
    /// `shares * (eff_yes + eff_no)`.
    #[serde(with = "rust_decimal::serde::str")]
    pub gross_cost: Decimal,
    /// Total fees across both legs.
    #[serde(with = "rust_decimal::serde::str")]
    pub fees: Decimal,
    /// `shares - gross_cost - fees` (each pair redeems for $1.00).
    #[serde(with = "rust_decimal::serde::str")]
    pub net_profit: Decimal,
    /// `net_profit / (gross_cost + fees)`, as a fraction.
    #[serde(with = "rust_decimal::serde::str")]
    pub roi: Decimal,
    /// Quality score of the underlying market at detection time.
    #[serde(with = "rust_decimal::serde::str")]
    pub score: Decimal,
    pub observed_at: DateTime<Utc>,
}

impl Opportunity {
    /// Combined effective cost per pair, before fees.
    #[inline]
    pub fn combined_cost(&self) -> Decimal {
        self.eff_yes + self.eff_no
    }

    /// True when both legs trade on the same venue.
    #[inline]
    pub fn is_single_venue(&self) -> bool {
        self.yes_exchange == self.no_exchange
    }

    /// Total capital required including fees.
    #[inline]
    pub fn capital_required(&self) -> Decimal {
        self.gross_cost + self.fees
    }

    /// Age of the observation.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.observed_at
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    opportunity: Opportunity,
    executed: bool,
}

/// Ranked, deduped live opportunity set, keyed by market.
///
/// All access goes through one exclusive lock; the hot path touches this
/// map a handful of times per tick, never per book delta.
#[derive(Debug, Default)]
pub struct OpportunityCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl OpportunityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for the opportunity's market.
    ///
    /// An existing entry survives unless the newcomer improves ROI by the
    /// hysteresis factor or the incumbent is older than 2 s. Returns true
    /// when the cache was updated.
    pub fn insert(&self, opportunity: Opportunity, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&opportunity.market_id) {
            Some(existing) => {
                let stale =
                    (now - existing.opportunity.observed_at).num_seconds() >= REPLACE_AGE_SECS;
                let better =
                    opportunity.roi > existing.opportunity.roi * REPLACE_HYSTERESIS;
                if stale || better {
                    entries.insert(
                        opportunity.market_id.clone(),
                        CacheEntry {
                            opportunity,
                            executed: false,
                        },
                    );
                    true
                } else {
                    false
                }
            }
            None => {
                entries.insert(
                    opportunity.market_id.clone(),
                    CacheEntry {
                        opportunity,
                        executed: false,
                    },
                );
                true
            }
        }
    }

    /// The `k` highest-ROI live opportunities, descending, executed
    /// entries excluded.
    pub fn top_k(&self, k: usize) -> Vec<Opportunity> {
        let entries = self.entries.lock();
        let mut live: Vec<Opportunity> = entries
            .values()
            .filter(|e| !e.executed)
            .map(|e| e.opportunity.clone())
            .collect();
        live.sort_by(|a, b| b.roi.cmp(&a.roi));
        live.truncate(k);
        live
    }

    /// Fetch the entry for a market, executed or not.
    pub fn get(&self, market_id: &str) -> Option<Opportunity> {
        self.entries
            .lock()
            .get(market_id)
            .map(|e| e.opportunity.clone())
    }

    /// Keep an executed entry out of `top_k` until it is superseded.
    pub fn mark_executed(&self, market_id: &str) {
        if let Some(entry) = self.entries.lock().get_mut(market_id) {
            entry.executed = true;
        }
    }

    /// Drop the entry for a market outright.
    pub fn remove(&self, market_id: &str) {
        self.entries.lock().remove(market_id);
    }

    /// Drop entries whose underlying book the caller reports stale.
    pub fn purge_if(&self, mut is_stale: impl FnMut(&str) -> bool) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|market_id, _| !is_stale(market_id));
        before - entries.len()
    }

    /// Drop entries observed more than `max_age` ago.
    pub fn clear_stale(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now - e.opportunity.observed_at <= max_age);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
