//! Open-position tracking, live P&L, and exit execution.
//!
//! The monitor values every open position against best bids once per
//! second and forwards the ticks to the risk manager. When an exit signal
//! comes back over the event bus it sells both legs into available bid
//! depth, retrying any residual at progressively lower limits for up to
//! 30 seconds before reporting the exit incomplete.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pm_common::{Exchange, Outcome, Side, Trade};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, ExitReason};
use crate::exchange::{ExchangeClient, OrderRequest, OrderResult, TradeSink};
use crate::ratelimit::{EndpointClass, RateLimiter};
use crate::risk::RiskHandle;
use crate::state::{ControlFlags, SharedBooks};

/// Price decrement applied per exit retry.
const EXIT_RETRY_TICK: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01
/// Floor for retry limit prices.
const MIN_SELL_PRICE: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01
/// Total time allowed for an exit before it is reported incomplete.
const EXIT_WINDOW: Duration = Duration::from_secs(30);
/// Pause between exit retries.
const EXIT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// An open arbitrage position (matched YES/NO pair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub market_id: String,
    pub yes_exchange: Exchange,
    pub no_exchange: Exchange,
    pub yes_token_id: String,
    pub no_token_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub yes_shares: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub no_shares: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub yes_avg_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub no_avg_price: Decimal,
    pub opened_at: DateTime<Utc>,
    #[serde(with = "rust_decimal::serde::str")]
    pub realized_pnl: Decimal,
}

impl Position {
    /// Cost basis of the open shares.
    pub fn entry_cost(&self) -> Decimal {
        self.yes_shares * self.yes_avg_price + self.no_shares * self.no_avg_price
    }

    /// Arbitrage positions hold matched pairs.
    pub fn is_balanced(&self) -> bool {
        self.yes_shares == self.no_shares
    }

    /// Both legs fully exited.
    pub fn is_closed(&self) -> bool {
        self.yes_shares.is_zero() && self.no_shares.is_zero()
    }

    /// Value at the given best bids.
    pub fn value_at(&self, yes_bid: Decimal, no_bid: Decimal) -> Decimal {
        self.yes_shares * yes_bid + self.no_shares * no_bid
    }

    /// Fold a new matched entry into the running averages.
    fn add_entry(&mut self, shares: Decimal, yes_price: Decimal, no_price: Decimal) {
        let new_yes = self.yes_shares + shares;
        let new_no = self.no_shares + shares;
        if new_yes > Decimal::ZERO {
            self.yes_avg_price =
                (self.yes_shares * self.yes_avg_price + shares * yes_price) / new_yes;
        }
        if new_no > Decimal::ZERO {
            self.no_avg_price =
                (self.no_shares * self.no_avg_price + shares * no_price) / new_no;
        }
        self.yes_shares = new_yes;
        self.no_shares = new_no;
    }

    /// Reduce a leg after a sell fill and realize the difference against
    /// basis. Returns the realized P&L of the fill.
    fn record_sell(&mut self, outcome: Outcome, size: Decimal, net_proceeds: Decimal) -> Decimal {
        let (shares, avg) = match outcome {
            Outcome::Yes => (&mut self.yes_shares, self.yes_avg_price),
            Outcome::No => (&mut self.no_shares, self.no_avg_price),
        };
        let sold = size.min(*shares);
        let basis = sold * avg;
        *shares -= sold;
        let realized = net_proceeds - basis;
        self.realized_pnl += realized;
        realized
    }
}

/// Tracks open positions and drives exits.
pub struct PositionMonitor {
    positions: DashMap<String, Position>,
    exits_in_flight: DashMap<String, ()>,
    books: SharedBooks,
    clients: HashMap<Exchange, Arc<dyn ExchangeClient>>,
    limiter: Arc<RateLimiter>,
    risk: RiskHandle,
    sink: Arc<dyn TradeSink>,
    events: EventBus,
    book_depth: usize,
    order_timeout: Duration,
}

impl PositionMonitor {
    pub fn new(
        books: SharedBooks,
        clients: HashMap<Exchange, Arc<dyn ExchangeClient>>,
        limiter: Arc<RateLimiter>,
        risk: RiskHandle,
        sink: Arc<dyn TradeSink>,
        events: EventBus,
        book_depth: usize,
        order_timeout: Duration,
    ) -> Self {
        Self {
            positions: DashMap::new(),
            exits_in_flight: DashMap::new(),
            books,
            clients,
            limiter,
            risk,
            sink,
            events,
            book_depth,
            order_timeout,
        }
    }

    /// Open a new position or augment an existing one with a matched pair
    /// entry.
    pub fn record_entry(
        &self,
        market_id: &str,
        yes_exchange: Exchange,
        no_exchange: Exchange,
        yes_token_id: &str,
        no_token_id: &str,
        shares: Decimal,
        yes_price: Decimal,
        no_price: Decimal,
    ) {
        let mut position = self
            .positions
            .entry(market_id.to_string())
            .or_insert_with(|| Position {
                market_id: market_id.to_string(),
                yes_exchange,
                no_exchange,
                yes_token_id: yes_token_id.to_string(),
                no_token_id: no_token_id.to_string(),
                yes_shares: Decimal::ZERO,
                no_shares: Decimal::ZERO,
                yes_avg_price: Decimal::ZERO,
                no_avg_price: Decimal::ZERO,
                opened_at: Utc::now(),
                realized_pnl: Decimal::ZERO,
            });
        position.add_entry(shares, yes_price, no_price);
        let entry_cost = position.entry_cost();
        drop(position);

        self.events.publish(Event::PositionOpened {
            market_id: market_id.to_string(),
            shares,
            entry_cost,
        });
        info!(market_id, %shares, %entry_cost, "position opened");
    }

    pub fn position(&self, market_id: &str) -> Option<Position> {
        self.positions.get(market_id).map(|p| p.clone())
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.iter().map(|p| p.clone()).collect()
    }

    /// Value every open position at best bids and forward ticks to risk.
    pub fn poll_once(&self) {
        for entry in self.positions.iter() {
            let position = entry.value();
            let yes_bid = self.books.best_bid(&position.yes_token_id).map(|(p, _)| p);
            let no_bid = self.books.best_bid(&position.no_token_id).map(|(p, _)| p);
            let (Some(yes_bid), Some(no_bid)) = (yes_bid, no_bid) else {
                continue;
            };

            let current_value = position.value_at(yes_bid, no_bid);
            let entry_cost = position.entry_cost();
            self.risk
                .position_tick(&position.market_id, entry_cost, current_value);
            debug!(
                market_id = %position.market_id,
                %current_value,
                unrealized = %(current_value - entry_cost),
                "position tick"
            );
        }
    }

    /// Run the 1 s valuation loop and react to exit signals until shutdown.
    pub async fn run(self: Arc<Self>, control: Arc<ControlFlags>) {
        let mut events_rx = self.events.subscribe();
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if control.is_shutdown_requested() {
                break;
            }
            tokio::select! {
                _ = tick.tick() => self.poll_once(),
                received = events_rx.recv() => match received {
                    Ok(envelope) => {
                        if let Event::ExitSignal { market_id, reason } = envelope.event {
                            let monitor = Arc::clone(&self);
                            tokio::spawn(async move {
                                monitor.dispatch_exit(&market_id, reason).await;
                            });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "position monitor lagged on event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("position monitor stopped");
    }

    /// Sell both legs of a position into available bids.
    ///
    /// The first pass sells at the market up to visible bid depth; residual
    /// shares are retried once a second at a limit one tick lower each
    /// time. After 30 s whatever remains is reported as `ExitIncomplete`.
    pub async fn dispatch_exit(&self, market_id: &str, reason: ExitReason) {
        use dashmap::mapref::entry::Entry;
        match self.exits_in_flight.entry(market_id.to_string()) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let result = self.run_exit(market_id, reason).await;
        self.exits_in_flight.remove(market_id);

        if let Some(realized) = result {
            self.risk.trade_closed(market_id, realized);
            self.risk.position_closed(market_id);
            self.positions.remove(market_id);
            self.events.publish(Event::PositionClosed {
                market_id: market_id.to_string(),
                realized_pnl: realized,
                reason,
            });
            info!(market_id, %realized, %reason, "position closed");
        }
    }

    /// Returns total realized P&L when the position fully exits, `None`
    /// when residual shares remain after the window.
    async fn run_exit(&self, market_id: &str, reason: ExitReason) -> Option<Decimal> {
        let deadline = Instant::now() + EXIT_WINDOW;
        let mut attempt: u32 = 0;
        info!(market_id, %reason, "dispatching position exit");

        loop {
            let Some(position) = self.position(market_id) else {
                return None;
            };
            if position.is_closed() {
                return Some(position.realized_pnl);
            }

            for outcome in [Outcome::Yes, Outcome::No] {
                let (exchange, token_id, residual) = match outcome {
                    Outcome::Yes => (
                        position.yes_exchange,
                        position.yes_token_id.as_str(),
                        position.yes_shares,
                    ),
                    Outcome::No => (
                        position.no_exchange,
                        position.no_token_id.as_str(),
                        position.no_shares,
                    ),
                };
                if residual <= Decimal::ZERO {
                    continue;
                }
                self.exit_leg(market_id, exchange, token_id, outcome, residual, attempt)
                    .await;
            }

            if let Some(position) = self.position(market_id) {
                if position.is_closed() {
                    return Some(position.realized_pnl);
                }
                if Instant::now() >= deadline {
                    self.events.publish(Event::ExitIncomplete {
                        market_id: market_id.to_string(),
                        residual_yes: position.yes_shares,
                        residual_no: position.no_shares,
                    });
                    warn!(
                        market_id,
                        residual_yes = %position.yes_shares,
                        residual_no = %position.no_shares,
                        "exit incomplete after retry window"
                    );
                    return None;
                }
            }

            attempt += 1;
            tokio::time::sleep(EXIT_RETRY_INTERVAL).await;
        }
    }

    /// Sell one leg: market order into bid depth on the first attempt,
    /// lower-limit retries afterwards.
    async fn exit_leg(
        &self,
        market_id: &str,
        exchange: Exchange,
        token_id: &str,
        outcome: Outcome,
        residual: Decimal,
        attempt: u32,
    ) {
        let Some(client) = self.clients.get(&exchange) else {
            warn!(market_id, %exchange, "no client for exit leg");
            return;
        };

        let bids = self.books.bid_levels(token_id, self.book_depth);
        let Some(best) = bids.first() else {
            debug!(market_id, token_id, "no bids to exit into");
            return;
        };

        let request = if attempt == 0 {
            let depth: Decimal = bids.iter().map(|l| l.size).sum();
            OrderRequest::market_sell(token_id, residual.min(depth))
        } else {
            let limit = (best.price - EXIT_RETRY_TICK * Decimal::from(attempt))
                .max(MIN_SELL_PRICE);
            OrderRequest::limit_sell(token_id, limit, residual)
        };
        if request.size <= Decimal::ZERO {
            return;
        }

        if self
            .limiter
            .acquire(exchange, EndpointClass::Orders)
            .await
            .is_err()
        {
            return;
        }

        let submitted =
            tokio::time::timeout(self.order_timeout, client.place_order(request)).await;
        match submitted {
            Ok(Ok(OrderResult::Filled {
                venue_order_id,
                price,
                size,
                fee,
            })) => {
                if let Some(mut position) = self.positions.get_mut(market_id) {
                    let realized =
                        position.record_sell(outcome, size, price * size - fee);
                    debug!(market_id, %outcome, %size, %price, %realized, "exit leg filled");
                }
                self.sink
                    .record(&Trade {
                        ts: Utc::now(),
                        market_id: market_id.to_string(),
                        token_id: token_id.to_string(),
                        outcome,
                        side: Side::Sell,
                        price,
                        size,
                        fee,
                        exchange,
                        venue_order_id,
                    })
                    .await;
            }
            Ok(Ok(OrderResult::Rejected { reason })) => {
                debug!(market_id, %outcome, reason, "exit leg rejected");
            }
            Ok(Ok(OrderResult::Timeout)) | Err(_) => {
                debug!(market_id, %outcome, "exit leg timed out");
            }
            Ok(Err(error)) => {
                warn!(market_id, %outcome, %error, "exit leg errored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position() -> Position {
        Position {
            market_id: "m1".to_string(),
            yes_exchange: Exchange::Polymarket,
            no_exchange: Exchange::Polymarket,
            yes_token_id: "yes".to_string(),
            no_token_id: "no".to_string(),
            yes_shares: dec!(50),
            no_shares: dec!(50),
            yes_avg_price: dec!(0.40),
            no_avg_price: dec!(0.45),
            opened_at: Utc::now(),
            realized_pnl: Decimal::ZERO,
        }
    }

    #[test]
    fn test_entry_cost_and_parity() {
        let position = position();
        // 50 * 0.40 + 50 * 0.45 = 42.5
        assert_eq!(position.entry_cost(), dec!(42.5));
        assert!(position.is_balanced());
        assert!(!position.is_closed());
    }

    #[test]
    fn test_value_at_bids() {
        let position = position();
        // 50 * 0.42 + 50 * 0.46 = 44
        assert_eq!(position.value_at(dec!(0.42), dec!(0.46)), dec!(44));
    }

    #[test]
    fn test_add_entry_weighted_average() {
        let mut position = position();
        position.add_entry(dec!(50), dec!(0.50), dec!(0.47));

        assert_eq!(position.yes_shares, dec!(100));
        assert_eq!(position.no_shares, dec!(100));
        // (50*0.40 + 50*0.50) / 100 = 0.45
        assert_eq!(position.yes_avg_price, dec!(0.45));
        // (50*0.45 + 50*0.47) / 100 = 0.46
        assert_eq!(position.no_avg_price, dec!(0.46));
        assert!(position.is_balanced());
    }

    #[test]
    fn test_record_sell_realizes_pnl() {
        let mut position = position();
        // Sell 50 YES at 0.39 for 19.50 net: basis 20, realized -0.50.
        let realized = position.record_sell(Outcome::Yes, dec!(50), dec!(19.50));
        assert_eq!(realized, dec!(-0.50));
        assert_eq!(position.yes_shares, Decimal::ZERO);
        assert_eq!(position.realized_pnl, dec!(-0.50));
        assert!(!position.is_balanced());
    }

    #[test]
    fn test_record_sell_caps_at_held_shares() {
        let mut position = position();
        position.record_sell(Outcome::No, dec!(80), dec!(22.5));
        assert_eq!(position.no_shares, Decimal::ZERO);
    }

    #[test]
    fn test_unrealized_formula_matches_parity_form() {
        // For a balanced position the general form reduces to
        // shares * (bb_yes + bb_no - yes_avg - no_avg).
        let position = position();
        let yes_bid = dec!(0.41);
        let no_bid = dec!(0.46);
        let unrealized = position.value_at(yes_bid, no_bid) - position.entry_cost();
        let parity_form = dec!(50)
            * (yes_bid + no_bid - position.yes_avg_price - position.no_avg_price);
        assert_eq!(unrealized, parity_form);
    }
}
