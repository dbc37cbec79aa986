//! Cross-venue market pairing by title similarity.
//!
//! Titles are normalized (lowercased, punctuation stripped, stopwords
//! removed) and tokenized; two markets from distinct venues pair when the
//! Jaccard similarity of their token sets reaches 0.80 and their closure
//! times sit within 24 hours of each other.

use std::collections::BTreeSet;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::exchange::UnifiedMarket;

/// Similarity threshold for forming a pair.
pub const MIN_SIMILARITY: f64 = 0.80;
/// Maximum distance between the two markets' close times.
const MAX_CLOSE_SKEW_HOURS: i64 = 24;

/// Words that carry no meaning for market identity.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "at", "be", "by", "for", "in", "is", "of", "on", "or", "the", "to",
    "will",
];

/// A matched pair of markets on distinct venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketPair {
    pub market_a: UnifiedMarket,
    pub market_b: UnifiedMarket,
    /// Jaccard similarity of the normalized titles, in [0, 1].
    pub similarity: f64,
}

impl MarketPair {
    /// Stable id used for the pair's execution lock and cooldown key.
    pub fn pair_id(&self) -> String {
        format!("{}|{}", self.market_a.global_id(), self.market_b.global_id())
    }
}

/// Normalize a title into its token set.
pub fn normalize_title(title: &str) -> BTreeSet<String> {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|word| !STOPWORDS.contains(word))
        .map(|word| word.to_string())
        .collect()
}

/// Jaccard similarity of two token sets.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Pairs markets from two venues by title similarity.
#[derive(Debug, Clone)]
pub struct CrossPlatformMatcher {
    min_similarity: f64,
}

impl Default for CrossPlatformMatcher {
    fn default() -> Self {
        Self {
            min_similarity: MIN_SIMILARITY,
        }
    }
}

impl CrossPlatformMatcher {
    pub fn new(min_similarity: f64) -> Self {
        Self { min_similarity }
    }

    /// Match each market of venue A to its best-scoring counterpart on
    /// venue B. A pair forms when similarity clears the threshold and both
    /// markets close within 24 h of each other.
    pub fn match_markets(
        &self,
        venue_a: &[UnifiedMarket],
        venue_b: &[UnifiedMarket],
    ) -> Vec<MarketPair> {
        let mut pairs = Vec::new();

        let b_tokens: Vec<BTreeSet<String>> = venue_b
            .iter()
            .map(|m| normalize_title(&m.question))
            .collect();

        for a in venue_a {
            let a_tokens = normalize_title(&a.question);
            let mut best: Option<(usize, f64)> = None;

            for (idx, b) in venue_b.iter().enumerate() {
                if a.exchange == b.exchange {
                    continue;
                }
                if !close_times_compatible(a, b) {
                    continue;
                }
                let similarity = jaccard(&a_tokens, &b_tokens[idx]);
                if similarity < self.min_similarity {
                    continue;
                }
                if best.map(|(_, s)| similarity > s).unwrap_or(true) {
                    best = Some((idx, similarity));
                }
            }

            if let Some((idx, similarity)) = best {
                pairs.push(MarketPair {
                    market_a: a.clone(),
                    market_b: venue_b[idx].clone(),
                    similarity,
                });
            }
        }

        pairs
    }
}

/// Both close times known and within the skew window.
fn close_times_compatible(a: &UnifiedMarket, b: &UnifiedMarket) -> bool {
    match (a.close_time, b.close_time) {
        (Some(ca), Some(cb)) => (ca - cb).abs() <= Duration::hours(MAX_CLOSE_SKEW_HOURS),
        _ => false,
    }
}
