//! Per-market minimum inter-trade interval.
//!
//! Recorded after every execution attempt regardless of fill outcome, so a
//! market that just rejected us is not immediately hammered again.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Tracks the last execution attempt per market.
#[derive(Debug)]
pub struct CooldownManager {
    last_trade: DashMap<String, DateTime<Utc>>,
    cooldown: Duration,
}

impl CooldownManager {
    pub fn new(cooldown_secs: u64) -> Self {
        Self {
            last_trade: DashMap::new(),
            cooldown: Duration::seconds(cooldown_secs as i64),
        }
    }

    /// True when at least the cooldown interval has passed since the last
    /// recorded attempt on this market.
    pub fn can_trade(&self, market_id: &str, now: DateTime<Utc>) -> bool {
        match self.last_trade.get(market_id) {
            Some(last) => now - *last >= self.cooldown,
            None => true,
        }
    }

    /// Record an execution attempt. Call immediately after every attempt,
    /// filled or not.
    pub fn record(&self, market_id: &str, now: DateTime<Utc>) {
        self.last_trade.insert(market_id.to_string(), now);
    }

    /// Seconds remaining in the cooldown, zero when tradeable.
    pub fn time_remaining(&self, market_id: &str, now: DateTime<Utc>) -> Duration {
        match self.last_trade.get(market_id) {
            Some(last) => {
                let elapsed = now - *last;
                if elapsed >= self.cooldown {
                    Duration::zero()
                } else {
                    self.cooldown - elapsed
                }
            }
            None => Duration::zero(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_market_can_trade() {
        let manager = CooldownManager::new(30);
        assert!(manager.can_trade("m1", Utc::now()));
        assert_eq!(manager.time_remaining("m1", Utc::now()), Duration::zero());
    }

    #[test]
    fn test_cooldown_blocks_until_elapsed() {
        let manager = CooldownManager::new(30);
        let t0 = Utc::now();
        manager.record("m1", t0);

        assert!(!manager.can_trade("m1", t0));
        assert!(!manager.can_trade("m1", t0 + Duration::seconds(29)));
        // Exactly at the boundary is allowed (>=).
        assert!(manager.can_trade("m1", t0 + Duration::seconds(30)));
        assert!(manager.can_trade("m1", t0 + Duration::seconds(31)));
    }

    #[test]
    fn test_time_remaining_counts_down() {
        let manager = CooldownManager::new(30);
        let t0 = Utc::now();
        manager.record("m1", t0);

        assert_eq!(
            manager.time_remaining("m1", t0 + Duration::seconds(10)),
            Duration::seconds(20)
        );
        assert_eq!(
            manager.time_remaining("m1", t0 + Duration::seconds(45)),
            Duration::zero()
        );
    }

    #[test]
    fn test_markets_independent() {
        let manager = CooldownManager::new(30);
        let t0 = Utc::now();
        manager.record("m1", t0);

        assert!(!manager.can_trade("m1", t0));
        assert!(manager.can_trade("m2", t0));
    }

    #[test]
    fn test_rerecord_resets_window() {
        let manager = CooldownManager::new(30);
        let t0 = Utc::now();
        manager.record("m1", t0);
        manager.record("m1", t0 + Duration::seconds(25));

        assert!(!manager.can_trade("m1", t0 + Duration::seconds(40)));
        assert!(manager.can_trade("m1", t0 + Duration::seconds(55)));
    }
}
