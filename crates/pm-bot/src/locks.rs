//! Per-market execution locks.
//!
//! Strictly try-acquire: an evaluator that loses the race skips the market
//! silently rather than queueing behind the winner. The guard releases on
//! drop, so the lock cannot leak across early returns or panics.

use std::sync::Arc;

use dashmap::DashMap;

/// Registry of markets currently inside an evaluate-and-execute section.
#[derive(Debug, Default, Clone)]
pub struct ExecutionLocks {
    executing: Arc<DashMap<String, ()>>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to enter the critical section for a market.
    ///
    /// Returns `None` when another task already holds the lock.
    pub fn try_acquire(&self, market_id: &str) -> Option<ExecutionGuard> {
        use dashmap::mapref::entry::Entry;

        match self.executing.entry(market_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(ExecutionGuard {
                    registry: Arc::clone(&self.executing),
                    market_id: market_id.to_string(),
                })
            }
        }
    }

    /// Whether a market is currently locked.
    pub fn is_executing(&self, market_id: &str) -> bool {
        self.executing.contains_key(market_id)
    }

    /// Number of markets currently locked.
    pub fn active(&self) -> usize {
        self.executing.len()
    }
}

/// RAII handle for one market's execution lock.
#[derive(Debug)]
pub struct ExecutionGuard {
    registry: Arc<DashMap<String, ()>>,
    market_id: String,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.market_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let locks = ExecutionLocks::new();

        let guard = locks.try_acquire("m1").unwrap();
        assert!(locks.is_executing("m1"));
        assert_eq!(locks.active(), 1);

        drop(guard);
        assert!(!locks.is_executing("m1"));
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let locks = ExecutionLocks::new();
        let _guard = locks.try_acquire("m1").unwrap();
        assert!(locks.try_acquire("m1").is_none());
    }

    #[test]
    fn test_reacquire_after_release() {
        let locks = ExecutionLocks::new();
        drop(locks.try_acquire("m1").unwrap());
        assert!(locks.try_acquire("m1").is_some());
    }

    #[test]
    fn test_markets_independent() {
        let locks = ExecutionLocks::new();
        let _a = locks.try_acquire("m1").unwrap();
        let _b = locks.try_acquire("m2").unwrap();
        assert_eq!(locks.active(), 2);
    }

    #[test]
    fn test_released_on_panic() {
        let locks = ExecutionLocks::new();
        let cloned = locks.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_acquire("m1").unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!locks.is_executing("m1"));
    }
}
