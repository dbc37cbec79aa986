//! Risk management: position exits and the daily loss gate.
//!
//! `RiskManager` is a pure state machine (easy to test); `spawn_risk_task`
//! wraps it in a single-writer worker so every state transition is
//! serialized against the trade sequence that produced it. The engine's
//! hot-path gate reads one atomic; the allocator reads a watch-published
//! snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::events::{Event, EventBus, ExitReason};

/// Copyable view of the rolling risk state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    #[serde(with = "rust_decimal::serde::str")]
    pub daily_pnl: Decimal,
    pub daily_trade_count: u32,
    pub daily_date: NaiveDate,
    pub halted: bool,
}

impl RiskSnapshot {
    /// Loss budget left before the halt trips.
    pub fn remaining_daily_budget(&self, max_daily_loss: Decimal) -> Decimal {
        (max_daily_loss + self.daily_pnl).max(Decimal::ZERO)
    }
}

/// Pure risk state machine: daily P&L gate plus per-position exit rules.
#[derive(Debug)]
pub struct RiskManager {
    config: RiskConfig,
    daily_pnl: Decimal,
    daily_trade_count: u32,
    daily_date: NaiveDate,
    halted: bool,
    /// Per-position high-water mark of observed value.
    high_water: HashMap<String, Decimal>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, now: DateTime<Utc>) -> Self {
        Self {
            config,
            daily_pnl: Decimal::ZERO,
            daily_trade_count: 0,
            daily_date: now.date_naive(),
            halted: false,
            high_water: HashMap::new(),
        }
    }

    /// Reset rolling totals at UTC midnight. Halts persist only until the
    /// rollover.
    fn check_rollover(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.daily_date {
            info!(
                previous_pnl = %self.daily_pnl,
                trades = self.daily_trade_count,
                "daily risk rollover"
            );
            self.daily_pnl = Decimal::ZERO;
            self.daily_trade_count = 0;
            self.daily_date = today;
            self.halted = false;
        }
    }

    /// Record realized P&L from a closed trade (or defensive unwind).
    ///
    /// Returns true when this trade newly tripped the daily halt.
    pub fn record_trade(&mut self, pnl: Decimal, now: DateTime<Utc>) -> bool {
        self.check_rollover(now);
        self.daily_pnl += pnl;
        self.daily_trade_count += 1;

        if !self.halted && self.daily_pnl <= -self.config.max_daily_loss {
            self.halted = true;
            warn!(
                daily_pnl = %self.daily_pnl,
                limit = %self.config.max_daily_loss,
                "daily loss limit reached, halting new entries"
            );
            return true;
        }
        false
    }

    /// Evaluate a position's unrealized P&L against the exit thresholds.
    pub fn evaluate_position(
        &mut self,
        market_id: &str,
        entry_cost: Decimal,
        current_value: Decimal,
        now: DateTime<Utc>,
    ) -> Option<ExitReason> {
        self.check_rollover(now);
        if entry_cost <= Decimal::ZERO {
            return None;
        }

        let mark = self
            .high_water
            .entry(market_id.to_string())
            .or_insert(current_value);
        if current_value > *mark {
            *mark = current_value;
        }

        let pnl_ratio = (current_value - entry_cost) / entry_cost;
        if pnl_ratio <= -self.config.stop_loss {
            return Some(ExitReason::StopLoss);
        }
        if pnl_ratio >= self.config.take_profit {
            return Some(ExitReason::TakeProfit);
        }
        None
    }

    /// Forget per-position state once a position is gone.
    pub fn position_closed(&mut self, market_id: &str) {
        self.high_water.remove(market_id);
    }

    /// Whether new entries are gated off.
    pub fn is_halted(&mut self, now: DateTime<Utc>) -> bool {
        self.check_rollover(now);
        self.halted
    }

    /// High-water mark observed for a position, if any.
    pub fn high_water(&self, market_id: &str) -> Option<Decimal> {
        self.high_water.get(market_id).copied()
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            daily_pnl: self.daily_pnl,
            daily_trade_count: self.daily_trade_count,
            daily_date: self.daily_date,
            halted: self.halted,
        }
    }
}

/// Commands consumed by the single-writer risk task.
#[derive(Debug)]
pub enum RiskCommand {
    /// Realized P&L from an executed pair or a defensive unwind.
    TradeClosed { market_id: String, pnl: Decimal },
    /// Position value tick from the monitor.
    PositionTick {
        market_id: String,
        entry_cost: Decimal,
        current_value: Decimal,
    },
    /// User-driven exit request.
    ManualExit { market_id: String },
    /// Position fully exited; clear its per-position state.
    PositionClosed { market_id: String },
}

/// Cheap handle onto the risk task.
#[derive(Debug, Clone)]
pub struct RiskHandle {
    tx: mpsc::UnboundedSender<RiskCommand>,
    halted: Arc<AtomicBool>,
    snapshot_rx: watch::Receiver<RiskSnapshot>,
}

impl RiskHandle {
    /// Hot-path gate: one atomic load.
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> RiskSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn trade_closed(&self, market_id: &str, pnl: Decimal) {
        let _ = self.tx.send(RiskCommand::TradeClosed {
            market_id: market_id.to_string(),
            pnl,
        });
    }

    pub fn position_tick(&self, market_id: &str, entry_cost: Decimal, current_value: Decimal) {
        let _ = self.tx.send(RiskCommand::PositionTick {
            market_id: market_id.to_string(),
            entry_cost,
            current_value,
        });
    }

    pub fn manual_exit(&self, market_id: &str) {
        let _ = self.tx.send(RiskCommand::ManualExit {
            market_id: market_id.to_string(),
        });
    }

    pub fn position_closed(&self, market_id: &str) {
        let _ = self.tx.send(RiskCommand::PositionClosed {
            market_id: market_id.to_string(),
        });
    }
}

/// Spawn the single-writer risk worker.
///
/// All transitions flow through the returned handle's queue; `RiskHalted`
/// and `ExitSignal` events are published on the bus. Exit signals are
/// deduplicated per position until it closes so a 1 s tick cadence does not
/// flood the exit path.
pub fn spawn_risk_task(
    mut manager: RiskManager,
    events: EventBus,
) -> (RiskHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<RiskCommand>();
    let halted = Arc::new(AtomicBool::new(false));
    let (snapshot_tx, snapshot_rx) = watch::channel(manager.snapshot());

    let handle = RiskHandle {
        tx,
        halted: Arc::clone(&halted),
        snapshot_rx,
    };

    let limit = manager.config.max_daily_loss;
    let task = tokio::spawn(async move {
        let mut signaled: HashSet<String> = HashSet::new();
        // Rollover must fire even when no commands arrive, otherwise a halt
        // would outlive midnight on a quiet book.
        let mut rollover = tokio::time::interval(Duration::from_secs(1));
        rollover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let publish = |manager: &RiskManager| {
                halted.store(manager.snapshot().halted, Ordering::Release);
                let _ = snapshot_tx.send(manager.snapshot());
            };

            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    let now = Utc::now();
                    match command {
                        RiskCommand::TradeClosed { market_id, pnl } => {
                            let newly_halted = manager.record_trade(pnl, now);
                            if newly_halted {
                                events.publish(Event::RiskHalted {
                                    daily_pnl: manager.snapshot().daily_pnl,
                                    limit,
                                });
                            }
                            tracing::debug!(
                                market_id = %market_id,
                                pnl = %pnl,
                                daily_pnl = %manager.snapshot().daily_pnl,
                                "trade pnl recorded"
                            );
                        }
                        RiskCommand::PositionTick {
                            market_id,
                            entry_cost,
                            current_value,
                        } => {
                            if let Some(reason) = manager.evaluate_position(
                                &market_id,
                                entry_cost,
                                current_value,
                                now,
                            ) {
                                if signaled.insert(market_id.clone()) {
                                    events.publish(Event::ExitSignal { market_id, reason });
                                }
                            }
                        }
                        RiskCommand::ManualExit { market_id } => {
                            if signaled.insert(market_id.clone()) {
                                events.publish(Event::ExitSignal {
                                    market_id,
                                    reason: ExitReason::Manual,
                                });
                            }
                        }
                        RiskCommand::PositionClosed { market_id } => {
                            manager.position_closed(&market_id);
                            signaled.remove(&market_id);
                        }
                    }
                    publish(&manager);
                }
                _ = rollover.tick() => {
                    manager.is_halted(Utc::now());
                    publish(&manager);
                }
            }
        }
    });

    (handle, task)
}
