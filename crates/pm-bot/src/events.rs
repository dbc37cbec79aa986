//! Structured events emitted by the core.
//!
//! Components publish to a broadcast hub instead of holding back-pointers;
//! the engine subscribes to risk events, external observers subscribe to
//! everything. Publishing never blocks and drops are counted, so a slow
//! subscriber cannot stall the trading path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pm_common::{Exchange, Outcome};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::opportunity::Opportunity;

/// Why a position is being exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::Manual => write!(f, "manual"),
        }
    }
}

/// Structured event stream of the core.
#[derive(Debug, Clone)]
pub enum Event {
    /// A profitable opportunity entered the cache.
    OpportunityDetected(Opportunity),

    /// Opportunity sized below the minimum dollar profit; not traded.
    BelowMinProfit {
        market_id: String,
        net_profit: Decimal,
    },

    /// Both legs filled.
    TradeExecuted {
        market_id: String,
        shares: Decimal,
        gross_cost: Decimal,
        net_profit: Decimal,
    },

    /// One leg filled, the other rejected; the filled leg was sold off.
    PartialFillUnwound {
        market_id: String,
        filled_outcome: Outcome,
        shares: Decimal,
        loss: Decimal,
    },

    /// Effective prices moved adversely between detect and execute.
    SlippageExceeded {
        market_id: String,
        expected_cost: Decimal,
        current_cost: Decimal,
    },

    /// Neither FOK leg filled.
    FillRejected { market_id: String },

    /// Daily loss limit reached; new entries stop until rollover.
    RiskHalted {
        daily_pnl: Decimal,
        limit: Decimal,
    },

    /// A position should be exited.
    ExitSignal {
        market_id: String,
        reason: ExitReason,
    },

    /// A new arbitrage position was opened (or augmented).
    PositionOpened {
        market_id: String,
        shares: Decimal,
        entry_cost: Decimal,
    },

    /// A position was fully exited.
    PositionClosed {
        market_id: String,
        realized_pnl: Decimal,
        reason: ExitReason,
    },

    /// An exit left residual shares after the retry window.
    ExitIncomplete {
        market_id: String,
        residual_yes: Decimal,
        residual_no: Decimal,
    },

    /// A token's book was invalidated and a fresh snapshot requested.
    BookReset {
        exchange: Exchange,
        token_id: String,
    },
}

impl Event {
    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Event::OpportunityDetected(_) => "opportunity_detected",
            Event::BelowMinProfit { .. } => "below_min_profit",
            Event::TradeExecuted { .. } => "trade_executed",
            Event::PartialFillUnwound { .. } => "partial_fill_unwound",
            Event::SlippageExceeded { .. } => "slippage_exceeded",
            Event::FillRejected { .. } => "fill_rejected",
            Event::RiskHalted { .. } => "risk_halted",
            Event::ExitSignal { .. } => "exit_signal",
            Event::PositionOpened { .. } => "position_opened",
            Event::PositionClosed { .. } => "position_closed",
            Event::ExitIncomplete { .. } => "exit_incomplete",
            Event::BookReset { .. } => "book_reset",
        }
    }
}

/// Timestamped envelope delivered to subscribers.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub ts: DateTime<Utc>,
    pub event: Event,
}

/// Broadcast hub for core events.
///
/// Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    dropped: Arc<AtomicU64>,
}

/// Default buffer; slow subscribers past this lag lose oldest events.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Never blocks; counts sends with no listeners.
    pub fn publish(&self, event: Event) {
        debug!(event = event.name(), "core event");
        let envelope = EventEnvelope {
            ts: Utc::now(),
            event,
        };
        if self.tx.send(envelope).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Subscribe to the full event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Number of events published with no live subscriber.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(Event::FillRejected {
            market_id: "m1".to_string(),
        });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.name(), "fill_rejected");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_counts_drops() {
        let bus = EventBus::default();
        bus.publish(Event::FillRejected {
            market_id: "m1".to_string(),
        });
        assert_eq!(bus.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_same_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::RiskHalted {
            daily_pnl: dec!(-50),
            limit: dec!(50),
        });

        assert_eq!(a.recv().await.unwrap().event.name(), "risk_halted");
        assert_eq!(b.recv().await.unwrap().event.name(), "risk_halted");
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(ExitReason::StopLoss.to_string(), "stop_loss");
        assert_eq!(ExitReason::TakeProfit.to_string(), "take_profit");
        assert_eq!(ExitReason::Manual.to_string(), "manual");
    }
}
