//! Market quality scoring for subscription prioritization.
//!
//! Four normalized sub-scores (volume, liquidity, spread, time-to-resolve)
//! weighted 0.35 / 0.30 / 0.20 / 0.15 into a 0-100 total. Markets under the
//! configured threshold are not subscribed. Scores rank markets and shade
//! allocation; they never touch fill math, so the log scaling runs in f64
//! and only the final score crosses back into `Decimal`.

use chrono::{DateTime, Utc};
use pm_common::Side;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::book::OrderBook;

/// Volume at which the volume sub-score saturates (USD).
const VOLUME_REF: f64 = 100_000.0;
/// Top-5-level liquidity (shares, both tokens, both sides) at saturation.
const LIQUIDITY_REF: f64 = 5_000.0;
/// Combined deviation from $1.00 at or under which spread scores full.
const SPREAD_OPTIMAL: f64 = 0.02;
/// Combined deviation at or above which spread scores zero.
const SPREAD_MAX: f64 = 0.10;
/// Lower edge of the optimal resolution window (hours).
const TIME_OPTIMAL_MIN_HOURS: f64 = 1.0;
/// Upper edge of the optimal resolution window (30 days, hours).
const TIME_OPTIMAL_MAX_HOURS: f64 = 720.0;
/// Beyond this horizon (90 days) the time score floors.
const TIME_MAX_HOURS: f64 = 2160.0;
/// Depth considered per side when summing liquidity.
const LIQUIDITY_LEVELS: usize = 5;

/// Sub-score weights. Must sum to 1.
#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub volume: f64,
    pub liquidity: f64,
    pub spread: f64,
    pub time: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            volume: 0.35,
            liquidity: 0.30,
            spread: 0.20,
            time: 0.15,
        }
    }
}

/// Score breakdown for a single market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketScore {
    pub market_id: String,
    pub volume_score: f64,
    pub liquidity_score: f64,
    pub spread_score: f64,
    pub time_score: f64,
    /// Weighted total in [0, 100].
    #[serde(with = "rust_decimal::serde::str")]
    pub total: Decimal,
}

impl MarketScore {
    /// Whether the market clears the subscription threshold.
    pub fn is_tradeable(&self, min_score: Decimal) -> bool {
        self.total >= min_score
    }
}

/// Market scorer with configurable weights.
#[derive(Debug, Clone, Default)]
pub struct MarketScorer {
    weights: ScoreWeights,
}

impl MarketScorer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    /// Score one market from its quoted volume, closure time, and both
    /// outcome books.
    pub fn score(
        &self,
        market_id: &str,
        volume: Decimal,
        close_time: Option<DateTime<Utc>>,
        yes_book: &OrderBook,
        no_book: &OrderBook,
        now: DateTime<Utc>,
    ) -> MarketScore {
        let volume_score = volume_subscore(volume);
        let liquidity_score = liquidity_subscore(yes_book, no_book);
        let spread_score = spread_subscore(yes_book, no_book);
        let time_score = time_subscore(close_time, now);

        let total = self.weights.volume * volume_score
            + self.weights.liquidity * liquidity_score
            + self.weights.spread * spread_score
            + self.weights.time * time_score;

        MarketScore {
            market_id: market_id.to_string(),
            volume_score,
            liquidity_score,
            spread_score,
            time_score,
            total: Decimal::from_f64(total)
                .unwrap_or(Decimal::ZERO)
                .round_dp(2)
                .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED),
        }
    }
}

/// Log-scaled volume against the reference, 0-100.
fn volume_subscore(volume: Decimal) -> f64 {
    let v = volume.to_f64().unwrap_or(0.0).max(0.0);
    let scaled = (1.0 + v).ln() / (1.0 + VOLUME_REF).ln();
    (scaled.clamp(0.0, 1.0)) * 100.0
}

/// Sum of top-5 bid+ask sizes on both tokens against the reference, 0-100.
fn liquidity_subscore(yes_book: &OrderBook, no_book: &OrderBook) -> f64 {
    let mut total = Decimal::ZERO;
    for book in [yes_book, no_book] {
        for side in [Side::Buy, Side::Sell] {
            for level in book.walk(side, LIQUIDITY_LEVELS) {
                total += level.size;
            }
        }
    }
    let t = total.to_f64().unwrap_or(0.0);
    (t / LIQUIDITY_REF).clamp(0.0, 1.0) * 100.0
}

/// Inverted combined deviation from $1.00, 0-100. Tighter scores higher.
fn spread_subscore(yes_book: &OrderBook, no_book: &OrderBook) -> f64 {
    let yes_ask = yes_book.best_ask().map(|(p, _)| p);
    let no_ask = no_book.best_ask().map(|(p, _)| p);
    let (Some(yes), Some(no)) = (yes_ask, no_ask) else {
        return 0.0;
    };

    let deviation = ((yes + no) - Decimal::ONE)
        .abs()
        .to_f64()
        .unwrap_or(SPREAD_MAX);
    if deviation >= SPREAD_MAX {
        return 0.0;
    }
    if deviation <= SPREAD_OPTIMAL {
        return 100.0;
    }
    (SPREAD_MAX - deviation) / (SPREAD_MAX - SPREAD_OPTIMAL) * 100.0
}

/// Bell-shaped time-to-resolution score, 0-100.
///
/// Penalizes markets closing inside an hour (no time to work the exit) and
/// markets more than 30 days out (capital parked too long).
fn time_subscore(close_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let Some(close) = close_time else {
        return 50.0;
    };
    let hours = (close - now).num_minutes() as f64 / 60.0;

    if hours <= 0.0 {
        0.0
    } else if hours < TIME_OPTIMAL_MIN_HOURS {
        hours / TIME_OPTIMAL_MIN_HOURS * 100.0
    } else if hours <= TIME_OPTIMAL_MAX_HOURS {
        100.0
    } else if hours <= TIME_MAX_HOURS {
        let decay = (TIME_MAX_HOURS - hours) / (TIME_MAX_HOURS - TIME_OPTIMAL_MAX_HOURS);
        25.0 + decay * 75.0
    } else {
        25.0
    }
}
