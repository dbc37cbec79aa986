//! Sliding-window throttle for exchange calls.
//!
//! Windows are keyed by `(exchange, endpoint class)`. What happens on a
//! full window depends on the request's priority: order placement blocks
//! until a slot frees, market fetches back off with jittered exponential
//! delay, metadata is simply dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use pm_common::Exchange;
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::error::RateLimitError;

/// Endpoint classes with distinct limits and refusal behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Order placement. Never dropped; blocks for a slot.
    Orders,
    /// Market and book fetches. Backs off with jitter.
    Markets,
    /// Metadata. Dropped when the window is full.
    Metadata,
}

impl EndpointClass {
    /// Requests admitted per window.
    fn max_requests(&self) -> usize {
        match self {
            EndpointClass::Orders => 5,
            EndpointClass::Markets => 10,
            EndpointClass::Metadata => 10,
        }
    }

    /// Refusal priority for this class.
    pub fn priority(&self) -> Priority {
        match self {
            EndpointClass::Orders => Priority::Critical,
            EndpointClass::Markets => Priority::Normal,
            EndpointClass::Metadata => Priority::Background,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Orders => "orders",
            EndpointClass::Markets => "markets",
            EndpointClass::Metadata => "metadata",
        }
    }
}

/// What a caller is willing to suffer when the window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Block until a slot frees.
    Critical,
    /// Jittered exponential backoff, bounded attempts.
    Normal,
    /// Drop the request.
    Background,
}

/// Window length for all classes.
const WINDOW: Duration = Duration::from_secs(1);
/// First backoff delay.
const BACKOFF_BASE: Duration = Duration::from_secs(5);
/// Backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Backoff attempts before giving up.
const BACKOFF_MAX_ATTEMPTS: u32 = 6;

/// One sliding window.
#[derive(Debug)]
struct SlidingWindow {
    max_requests: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    fn new(max_requests: usize) -> Self {
        Self {
            max_requests,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Admit the request now if a slot is free.
    fn try_acquire(&self, now: Instant) -> bool {
        let mut timestamps = self.timestamps.lock();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= WINDOW {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() < self.max_requests {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the oldest request leaves the window.
    fn time_until_available(&self, now: Instant) -> Duration {
        let timestamps = self.timestamps.lock();
        if timestamps.len() < self.max_requests {
            return Duration::ZERO;
        }
        match timestamps.front() {
            Some(front) => (*front + WINDOW).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    fn usage(&self, now: Instant) -> usize {
        let mut timestamps = self.timestamps.lock();
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= WINDOW {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        timestamps.len()
    }
}

/// Current usage of one window, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    pub in_window: usize,
    pub max_requests: usize,
}

/// Multi-key rate limiter over `(exchange, endpoint class)`.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<(Exchange, EndpointClass), Arc<SlidingWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, exchange: Exchange, class: EndpointClass) -> Arc<SlidingWindow> {
        self.windows
            .entry((exchange, class))
            .or_insert_with(|| Arc::new(SlidingWindow::new(class.max_requests())))
            .clone()
    }

    /// Acquire a slot, honoring the class's refusal behavior.
    pub async fn acquire(
        &self,
        exchange: Exchange,
        class: EndpointClass,
    ) -> Result<(), RateLimitError> {
        let window = self.window(exchange, class);
        if window.try_acquire(Instant::now()) {
            return Ok(());
        }

        let key = format!("{}/{}", exchange, class.as_str());
        match class.priority() {
            Priority::Critical => {
                // Order placement never drops; wait out the window.
                loop {
                    let wait = window.time_until_available(Instant::now());
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    if window.try_acquire(Instant::now()) {
                        return Ok(());
                    }
                }
            }
            Priority::Normal => {
                let mut delay = BACKOFF_BASE;
                for attempt in 1..=BACKOFF_MAX_ATTEMPTS {
                    let jittered = full_jitter(delay);
                    debug!(
                        key = %key,
                        attempt,
                        delay_ms = jittered.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(jittered).await;
                    if window.try_acquire(Instant::now()) {
                        return Ok(());
                    }
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
                Err(RateLimitError::BackoffExhausted {
                    key,
                    attempts: BACKOFF_MAX_ATTEMPTS,
                })
            }
            Priority::Background => Err(RateLimitError::Dropped { key }),
        }
    }

    /// Non-blocking admission check used by tests and introspection.
    pub fn try_acquire(&self, exchange: Exchange, class: EndpointClass) -> bool {
        self.window(exchange, class).try_acquire(Instant::now())
    }

    /// Usage snapshot for one key.
    pub fn status(&self, exchange: Exchange, class: EndpointClass) -> WindowStatus {
        let window = self.window(exchange, class);
        WindowStatus {
            in_window: window.usage(Instant::now()),
            max_requests: window.max_requests,
        }
    }
}

/// Full jitter: uniform in `[0, delay]`, never below 100 ms so a burst of
/// backers-off does not synchronize on zero.
fn full_jitter(delay: Duration) -> Duration {
    let max_ms = delay.as_millis().max(1) as u64;
    let ms = rand::thread_rng().gen_range(0..=max_ms);
    Duration::from_millis(ms.max(100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admits_up_to_limit() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.try_acquire(Exchange::Polymarket, EndpointClass::Orders));
        }
        assert!(!limiter.try_acquire(Exchange::Polymarket, EndpointClass::Orders));
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            assert!(limiter.try_acquire(Exchange::Polymarket, EndpointClass::Orders));
        }
        // A different exchange and a different class both still admit.
        assert!(limiter.try_acquire(Exchange::Kalshi, EndpointClass::Orders));
        assert!(limiter.try_acquire(Exchange::Polymarket, EndpointClass::Markets));
    }

    #[tokio::test]
    async fn test_background_drops_when_full() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter
                .acquire(Exchange::Polymarket, EndpointClass::Metadata)
                .await
                .unwrap();
        }
        let result = limiter
            .acquire(Exchange::Polymarket, EndpointClass::Metadata)
            .await;
        assert!(matches!(result, Err(RateLimitError::Dropped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.try_acquire(Exchange::Polymarket, EndpointClass::Markets));
        }
        assert!(!limiter.try_acquire(Exchange::Polymarket, EndpointClass::Markets));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.try_acquire(Exchange::Polymarket, EndpointClass::Markets));
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_blocks_until_slot() {
        let limiter = Arc::new(RateLimiter::new());
        for _ in 0..5 {
            assert!(limiter.try_acquire(Exchange::Polymarket, EndpointClass::Orders));
        }

        // With the window full, a critical acquire must eventually succeed
        // rather than error. Paused time auto-advances through the sleep.
        limiter
            .acquire(Exchange::Polymarket, EndpointClass::Orders)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_backs_off_then_succeeds() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.try_acquire(Exchange::Polymarket, EndpointClass::Markets));
        }

        // After the first backoff sleep (>= 100 ms, <= 5 s) the one-second
        // window has a fair chance of having slid; the bounded retry loop
        // must succeed well before exhausting six attempts.
        limiter
            .acquire(Exchange::Polymarket, EndpointClass::Markets)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_reports_usage() {
        let limiter = RateLimiter::new();
        limiter.try_acquire(Exchange::Kalshi, EndpointClass::Markets);
        limiter.try_acquire(Exchange::Kalshi, EndpointClass::Markets);

        let status = limiter.status(Exchange::Kalshi, EndpointClass::Markets);
        assert_eq!(status.in_window, 2);
        assert_eq!(status.max_requests, 10);
    }

    #[test]
    fn test_full_jitter_bounds() {
        for _ in 0..100 {
            let d = full_jitter(Duration::from_secs(5));
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_class_priorities() {
        assert_eq!(EndpointClass::Orders.priority(), Priority::Critical);
        assert_eq!(EndpointClass::Markets.priority(), Priority::Normal);
        assert_eq!(EndpointClass::Metadata.priority(), Priority::Background);
    }
}
