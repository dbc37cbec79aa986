//! The arbitrage engine: detection loop and execution critical section.
//!
//! A 250 ms tick walks the top-scored markets (and cross-venue pairs) and
//! fans evaluation out over a bounded worker pool. Each evaluation runs the
//! full critical section under the market's execution lock: depth-aware
//! detection, size search, quality gates, allocation, a slippage recheck
//! against fresh books, then two simultaneous fill-or-kill buys. One-sided
//! fills are defensively unwound into the bids.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pm_common::{Exchange, Outcome, Side, Trade};
use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::allocator::CapitalAllocator;
use crate::config::BotConfig;
use crate::cooldown::CooldownManager;
use crate::error::EngineError;
use crate::events::{Event, EventBus};
use crate::exchange::{
    BookEvent, ExchangeClient, OrderRequest, OrderResult, TradeSink, UnifiedMarket,
};
use crate::impact::{self, effective_cost};
use crate::locks::ExecutionLocks;
use crate::matcher::{CrossPlatformMatcher, MarketPair};
use crate::opportunity::{Opportunity, OpportunityCache};
use crate::positions::PositionMonitor;
use crate::ratelimit::{EndpointClass, RateLimiter};
use crate::risk::{spawn_risk_task, RiskHandle, RiskManager};
use crate::scorer::{MarketScore, MarketScorer};
use crate::state::{ControlFlags, MetricsCounters, MetricsSnapshot, SharedBooks};

/// Venue tick size used when rounding limit prices.
const PRICE_TICK: Decimal = Decimal::from_parts(1, 0, 0, false, 2); // 0.01
/// Opportunities whose books are older than this are purged from the cache.
const STALE_BOOK_SECS: i64 = 10;
/// Upper bound on the share search, independent of balance.
const MAX_SEARCH_SHARES: u64 = 100_000;

/// One leg of a (possibly cross-venue) opportunity.
#[derive(Debug, Clone)]
struct Leg {
    exchange: Exchange,
    token_id: String,
}

/// The detection and execution core.
pub struct ArbitrageEngine {
    config: BotConfig,
    clients: HashMap<Exchange, Arc<dyn ExchangeClient>>,
    books: SharedBooks,
    markets: DashMap<String, UnifiedMarket>,
    scores: DashMap<String, MarketScore>,
    pairs: parking_lot::RwLock<Vec<MarketPair>>,
    subscribed: DashMap<String, ()>,
    scorer: MarketScorer,
    cache: OpportunityCache,
    cooldowns: CooldownManager,
    locks: ExecutionLocks,
    limiter: Arc<RateLimiter>,
    allocator: CapitalAllocator,
    risk: RiskHandle,
    monitor: Arc<PositionMonitor>,
    sink: Arc<dyn TradeSink>,
    events: EventBus,
    control: Arc<ControlFlags>,
    metrics: Arc<MetricsCounters>,
    eval_permits: Arc<Semaphore>,
}

impl ArbitrageEngine {
    /// Assemble the engine and its collaborators. Spawns the single-writer
    /// risk task; the position monitor loop starts with [`Self::run`].
    pub fn new(
        config: BotConfig,
        clients: HashMap<Exchange, Arc<dyn ExchangeClient>>,
        sink: Arc<dyn TradeSink>,
        events: EventBus,
    ) -> Result<Arc<Self>, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Unrecoverable(e.to_string()))?;
        for exchange in &config.enabled_platforms {
            if !clients.contains_key(exchange) {
                return Err(EngineError::Unrecoverable(format!(
                    "no client for enabled platform {exchange}"
                )));
            }
        }

        let books = SharedBooks::new();
        let limiter = Arc::new(RateLimiter::new());
        let control = Arc::new(ControlFlags::new());

        let risk_manager = RiskManager::new(config.risk.clone(), Utc::now());
        let (risk, _risk_task) = spawn_risk_task(risk_manager, events.clone());

        let monitor = Arc::new(PositionMonitor::new(
            books.clone(),
            clients.clone(),
            Arc::clone(&limiter),
            risk.clone(),
            Arc::clone(&sink),
            events.clone(),
            config.markets.max_order_book_depth,
            Duration::from_secs(config.execution.order_timeout_secs),
        ));

        let workers = config.risk.max_concurrent_positions.min(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        );

        let allocator = CapitalAllocator::new(
            config.trading.capital_per_trade,
            config.risk.max_daily_loss,
        );
        let cooldowns = CooldownManager::new(config.execution.cooldown_secs);

        Ok(Arc::new(Self {
            clients,
            books,
            markets: DashMap::new(),
            scores: DashMap::new(),
            pairs: parking_lot::RwLock::new(Vec::new()),
            subscribed: DashMap::new(),
            scorer: MarketScorer::default(),
            cache: OpportunityCache::new(),
            cooldowns,
            locks: ExecutionLocks::new(),
            limiter,
            allocator,
            risk,
            monitor,
            sink,
            events,
            control,
            metrics: Arc::new(MetricsCounters::new()),
            eval_permits: Arc::new(Semaphore::new(workers)),
            config,
        }))
    }

    /// Shutdown token shared with embedders.
    pub fn control(&self) -> Arc<ControlFlags> {
        Arc::clone(&self.control)
    }

    /// Live opportunity cache.
    pub fn opportunities(&self) -> &OpportunityCache {
        &self.cache
    }

    /// Position monitor handle.
    pub fn monitor(&self) -> Arc<PositionMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Risk handle (manual exits, snapshots).
    pub fn risk(&self) -> RiskHandle {
        self.risk.clone()
    }

    /// Metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared book store (ingestion writes; tests seed through this).
    pub fn books(&self) -> SharedBooks {
        self.books.clone()
    }

    /// Run until shutdown is requested.
    pub async fn run(self: Arc<Self>) -> Result<(), EngineError> {
        info!(
            platforms = self.config.enabled_platforms.len(),
            cross = self.config.cross_platform_arbitrage,
            "starting arbitrage engine"
        );

        self.refresh_markets().await;

        let monitor_task = tokio::spawn(Arc::clone(&self.monitor).run(self.control()));

        self.control.enable_trading();
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.execution.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let refresh_every = Duration::from_secs(self.config.markets.market_refresh_secs);
        let mut last_refresh = tokio::time::Instant::now();

        while !self.control.is_shutdown_requested() {
            tick.tick().await;
            if last_refresh.elapsed() >= refresh_every {
                self.refresh_markets().await;
                last_refresh = tokio::time::Instant::now();
            }
            self.purge_stale_opportunities();
            self.rescore_subscribed();
            Arc::clone(&self).evaluate_tick().await;
        }

        self.control.disable_trading();
        let _ = monitor_task.await;
        let metrics = self.metrics.snapshot();
        info!(
            trades = metrics.trades_executed,
            opportunities = metrics.opportunities_detected,
            slippage_aborts = metrics.slippage_aborts,
            partial_unwinds = metrics.partial_unwinds,
            "engine stopped"
        );
        Ok(())
    }

    /// Request a clean shutdown. In-flight FOK legs are awaited, not
    /// canceled.
    pub fn shutdown(&self) {
        self.control.request_shutdown();
    }

    // ------------------------------------------------------------------
    // Market discovery and ingestion
    // ------------------------------------------------------------------

    /// Fetch market lists from every venue, rescore, resubscribe, and
    /// rebuild cross-venue pairs.
    pub async fn refresh_markets(&self) {
        for exchange in self.config.enabled_platforms.clone() {
            let Some(client) = self.clients.get(&exchange).cloned() else {
                continue;
            };
            if self
                .limiter
                .acquire(exchange, EndpointClass::Markets)
                .await
                .is_err()
            {
                warn!(%exchange, "market refresh rate limited out");
                continue;
            }
            let fetched = tokio::time::timeout(
                Duration::from_secs(self.config.execution.snapshot_timeout_secs),
                client.list_markets(self.config.markets.min_market_volume),
            )
            .await;
            match fetched {
                Ok(Ok(markets)) => {
                    debug!(%exchange, count = markets.len(), "markets refreshed");
                    for market in markets.into_iter().filter(|m| m.active) {
                        self.markets.insert(market.global_id(), market);
                    }
                }
                Ok(Err(error)) => warn!(%exchange, %error, "market list fetch failed"),
                Err(_) => warn!(%exchange, "market list fetch timed out"),
            }
        }

        self.rescore_subscribed();
        self.subscribe_top_markets().await;
        self.rebuild_pairs();
    }

    /// Subscribe the best-scoring markets until the token budget is spent.
    async fn subscribe_top_markets(&self) {
        let mut ranked: Vec<(Decimal, UnifiedMarket)> = self
            .markets
            .iter()
            .map(|entry| {
                let market = entry.value().clone();
                let score = self
                    .scores
                    .get(&market.global_id())
                    .map(|s| s.total)
                    .unwrap_or_else(|| self.preliminary_score(&market));
                (score, market)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let budget = self.config.markets.max_tokens_monitor;
        let mut used = self.subscribed.len();

        for (_score, market) in ranked {
            if used + 2 > budget {
                break;
            }
            // The quality threshold only applies once books have produced a
            // real score; a volume/time-only preliminary score must not
            // starve a market of the subscription that would score it.
            if let Some(scored) = self.scores.get(&market.global_id()) {
                if scored.total < self.config.markets.min_market_quality_score {
                    continue;
                }
            }
            for token_id in [&market.yes_token_id, &market.no_token_id] {
                if self.subscribed.contains_key(token_id) {
                    continue;
                }
                let Some(client) = self.clients.get(&market.exchange).cloned() else {
                    continue;
                };
                match client.subscribe_book(token_id).await {
                    Ok(rx) => {
                        self.subscribed.insert(token_id.clone(), ());
                        used += 1;
                        let ingestor = self.ingestor(market.exchange, client);
                        tokio::spawn(ingestor.run(rx));
                    }
                    Err(error) => {
                        warn!(%token_id, %error, "book subscription failed");
                    }
                }
            }
        }
    }

    fn ingestor(&self, exchange: Exchange, client: Arc<dyn ExchangeClient>) -> BookIngestor {
        BookIngestor {
            exchange,
            client,
            books: self.books.clone(),
            events: self.events.clone(),
            limiter: Arc::clone(&self.limiter),
            metrics: Arc::clone(&self.metrics),
            control: Arc::clone(&self.control),
            snapshot_timeout: Duration::from_secs(self.config.execution.snapshot_timeout_secs),
        }
    }

    /// Volume/time-only score used before any book data exists.
    fn preliminary_score(&self, market: &UnifiedMarket) -> Decimal {
        let empty_yes = crate::book::OrderBook::new(&market.yes_token_id);
        let empty_no = crate::book::OrderBook::new(&market.no_token_id);
        self.scorer
            .score(
                &market.global_id(),
                market.volume,
                market.close_time,
                &empty_yes,
                &empty_no,
                Utc::now(),
            )
            .total
    }

    /// Re-score every subscribed market against current books.
    fn rescore_subscribed(&self) {
        let now = Utc::now();
        for entry in self.markets.iter() {
            let market = entry.value();
            if !self.subscribed.contains_key(&market.yes_token_id) {
                continue;
            }
            let yes_book = self.snapshot_book(&market.yes_token_id);
            let no_book = self.snapshot_book(&market.no_token_id);
            let score = self.scorer.score(
                &market.global_id(),
                market.volume,
                market.close_time,
                &yes_book,
                &no_book,
                now,
            );
            self.scores.insert(market.global_id(), score);
        }
    }

    /// Cached score for a market, computed from current books on a miss.
    fn live_score(&self, market: &UnifiedMarket) -> Decimal {
        if let Some(score) = self.scores.get(&market.global_id()) {
            return score.total;
        }
        let yes_book = self.snapshot_book(&market.yes_token_id);
        let no_book = self.snapshot_book(&market.no_token_id);
        self.scorer
            .score(
                &market.global_id(),
                market.volume,
                market.close_time,
                &yes_book,
                &no_book,
                Utc::now(),
            )
            .total
    }

    /// Point-in-time copy of a shared book for scoring.
    fn snapshot_book(&self, token_id: &str) -> crate::book::OrderBook {
        let depth = self.config.markets.max_order_book_depth;
        let mut book = crate::book::OrderBook::new(token_id);
        let bids = self.books.bid_levels(token_id, depth);
        let asks = self.books.ask_levels(token_id, depth);
        let _ = book.apply_snapshot(&bids, &asks, 1, Utc::now());
        book
    }

    /// Rebuild cross-venue pairs from the current market set.
    fn rebuild_pairs(&self) {
        if !self.config.cross_platform_arbitrage {
            return;
        }
        let mut by_venue: HashMap<Exchange, Vec<UnifiedMarket>> = HashMap::new();
        for entry in self.markets.iter() {
            by_venue
                .entry(entry.value().exchange)
                .or_default()
                .push(entry.value().clone());
        }

        let matcher = CrossPlatformMatcher::default();
        let mut pairs = Vec::new();
        let venues: Vec<Exchange> = by_venue.keys().copied().collect();
        for (i, a) in venues.iter().enumerate() {
            for b in venues.iter().skip(i + 1) {
                pairs.extend(matcher.match_markets(&by_venue[a], &by_venue[b]));
            }
        }
        if !pairs.is_empty() {
            info!(count = pairs.len(), "cross-venue pairs matched");
        }
        *self.pairs.write() = pairs;
    }

    fn purge_stale_opportunities(&self) {
        let now = Utc::now();
        let horizon_ms = STALE_BOOK_SECS * 1000;
        self.cache.purge_if(|market_id| {
            let Some(market) = self.markets.get(market_id) else {
                // Pair ids and delisted markets age out on observation time.
                return false;
            };
            self.books.age_ms(&market.yes_token_id, now) > horizon_ms
                || self.books.age_ms(&market.no_token_id, now) > horizon_ms
        });
        self.cache
            .clear_stale(now, chrono::Duration::seconds(STALE_BOOK_SECS));
    }

    // ------------------------------------------------------------------
    // Detection tick
    // ------------------------------------------------------------------

    /// Evaluate the top-K markets (and cross pairs) in parallel, bounded by
    /// the worker pool.
    pub async fn evaluate_tick(self: Arc<Self>) {
        let mut ranked: Vec<(Decimal, UnifiedMarket)> = self
            .markets
            .iter()
            .filter(|entry| self.subscribed.contains_key(&entry.value().yes_token_id))
            .map(|entry| {
                let market = entry.value().clone();
                let score = self
                    .scores
                    .get(&market.global_id())
                    .map(|s| s.total)
                    .unwrap_or(Decimal::ZERO);
                (score, market)
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.truncate(self.config.top_k_markets());

        let mut tasks = JoinSet::new();
        for (score, market) in ranked {
            let engine = Arc::clone(&self);
            tasks.spawn(async move {
                let Ok(_permit) = engine.eval_permits.clone().acquire_owned().await else {
                    return;
                };
                engine.evaluate_market(&market, score).await;
            });
        }

        if self.config.cross_platform_arbitrage {
            let pairs = self.pairs.read().clone();
            for pair in pairs {
                let engine = Arc::clone(&self);
                tasks.spawn(async move {
                    let Ok(_permit) = engine.eval_permits.clone().acquire_owned().await else {
                        return;
                    };
                    engine.evaluate_pair(&pair).await;
                });
            }
        }

        while tasks.join_next().await.is_some() {}
    }

    /// Evaluate one single-venue market under its execution lock.
    pub async fn evaluate_market(&self, market: &UnifiedMarket, score: Decimal) {
        let market_id = market.global_id();
        let Some(_guard) = self.locks.try_acquire(&market_id) else {
            return;
        };
        let yes = Leg {
            exchange: market.exchange,
            token_id: market.yes_token_id.clone(),
        };
        let no = Leg {
            exchange: market.exchange,
            token_id: market.no_token_id.clone(),
        };
        self.evaluate_legs(&market_id, yes, no, score).await;
    }

    /// Evaluate a cross-venue pair in both leg directions under the pair's
    /// execution lock.
    pub async fn evaluate_pair(&self, pair: &MarketPair) {
        let pair_id = pair.pair_id();
        let Some(_guard) = self.locks.try_acquire(&pair_id) else {
            return;
        };
        let score = self.live_score(&pair.market_a).min(self.live_score(&pair.market_b));

        // A.YES + B.NO, then the reverse coupling.
        let forward = (
            Leg {
                exchange: pair.market_a.exchange,
                token_id: pair.market_a.yes_token_id.clone(),
            },
            Leg {
                exchange: pair.market_b.exchange,
                token_id: pair.market_b.no_token_id.clone(),
            },
        );
        let reverse = (
            Leg {
                exchange: pair.market_b.exchange,
                token_id: pair.market_b.yes_token_id.clone(),
            },
            Leg {
                exchange: pair.market_a.exchange,
                token_id: pair.market_a.no_token_id.clone(),
            },
        );

        for (yes, no) in [forward, reverse] {
            if self.evaluate_legs(&pair_id, yes, no, score).await {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // The critical section
    // ------------------------------------------------------------------

    /// Detect, size, gate, and execute one YES/NO coupling. Returns true
    /// when an execution attempt happened (filled or not).
    async fn evaluate_legs(&self, market_id: &str, yes: Leg, no: Leg, score: Decimal) -> bool {
        let now = Utc::now();
        let max_age = self.config.execution.max_book_age_ms;

        // Detect: both books present, fresh, and unpaused.
        if !self.books.is_evaluable(&yes.token_id, now, max_age)
            || !self.books.is_evaluable(&no.token_id, now, max_age)
        {
            return false;
        }
        let depth = self.config.markets.max_order_book_depth;
        let yes_asks = self.books.ask_levels(&yes.token_id, depth);
        let no_asks = self.books.ask_levels(&no.token_id, depth);
        let (Some(best_yes), Some(best_no)) = (yes_asks.first(), no_asks.first()) else {
            return false;
        };

        let fee_rate = self.config.trading.trading_fee_percent;
        let ceiling = Decimal::ONE - self.config.trading.min_profit_margin;

        // Cheap top-of-book reject before any balance traffic.
        if (best_yes.price + best_no.price) * (Decimal::ONE + fee_rate) > ceiling {
            return false;
        }

        // Quality gates, cheapest first.
        if self.risk.is_halted() {
            debug!(market_id, "skipped: risk halted");
            return false;
        }
        if !self.control.is_trading_enabled() {
            return false;
        }
        if !self.cooldowns.can_trade(market_id, now) {
            return false;
        }
        if score < self.config.markets.min_market_quality_score {
            return false;
        }
        if self.monitor.position(market_id).is_none()
            && self.monitor.open_count() >= self.config.risk.max_concurrent_positions
        {
            debug!(market_id, "skipped: position limit");
            return false;
        }

        // Size search bounded by what the balance can afford.
        let balance = self.available_balance(yes.exchange, no.exchange).await;
        let per_share_floor = (best_yes.price + best_no.price) * (Decimal::ONE + fee_rate);
        let max_affordable: u64 = (balance / per_share_floor)
            .floor()
            .min(Decimal::from(MAX_SEARCH_SHARES))
            .try_into()
            .unwrap_or(0);
        let Some((search_shares, eff_yes, eff_no)) =
            impact::find_optimal_size(&yes_asks, &no_asks, fee_rate, ceiling, max_affordable)
        else {
            return false;
        };

        let yes_impact = effective_cost(&yes_asks, search_shares);
        let no_impact = effective_cost(&no_asks, search_shares);

        // Allocate, then settle on the final whole-share size.
        let per_share_cost = (eff_yes + eff_no) * (Decimal::ONE + fee_rate);
        let sizing_opportunity = self.build_opportunity(
            market_id,
            &yes,
            &no,
            search_shares,
            eff_yes,
            eff_no,
            yes_impact.levels_consumed,
            no_impact.levels_consumed,
            score,
            fee_rate,
            now,
        );

        let top_depth = best_yes.size.min(best_no.size);
        let depth_consumption = if top_depth > Decimal::ZERO {
            search_shares / top_depth
        } else {
            Decimal::ONE
        };
        let allocation = self.allocator.allocate(
            &sizing_opportunity,
            self.risk.snapshot().daily_pnl,
            balance,
            depth_consumption,
            now,
        );
        let alloc_shares = (allocation.allocated / per_share_cost).floor();
        let final_shares = search_shares.min(alloc_shares);
        if final_shares < Decimal::ONE {
            return false;
        }

        let profit_per_share = Decimal::ONE - per_share_cost;
        let net_profit = final_shares * profit_per_share;
        if net_profit < self.config.trading.min_profit_dollars {
            self.events.publish(Event::BelowMinProfit {
                market_id: market_id.to_string(),
                net_profit,
            });
            debug!(market_id, %net_profit, "skipped: below minimum dollar profit");
            return false;
        }

        let opportunity = self.build_opportunity(
            market_id,
            &yes,
            &no,
            final_shares,
            eff_yes,
            eff_no,
            yes_impact.levels_consumed,
            no_impact.levels_consumed,
            score,
            fee_rate,
            now,
        );
        if self.cache.insert(opportunity.clone(), now) {
            MetricsCounters::incr(&self.metrics.opportunities_detected);
            self.events.publish(Event::OpportunityDetected(opportunity));
        }

        // Slippage recheck against freshly read books.
        let fresh_yes =
            effective_cost(&self.books.ask_levels(&yes.token_id, depth), final_shares);
        let fresh_no =
            effective_cost(&self.books.ask_levels(&no.token_id, depth), final_shares);
        let expected_cost = eff_yes + eff_no;
        let current_cost = fresh_yes.effective_price + fresh_no.effective_price;
        let slippage_breached = fresh_yes.depth_exhausted
            || fresh_no.depth_exhausted
            || adverse_move(eff_yes, fresh_yes.effective_price)
                > self.config.trading.max_slippage
            || adverse_move(eff_no, fresh_no.effective_price)
                > self.config.trading.max_slippage
            || current_cost * (Decimal::ONE + fee_rate) > ceiling;
        if slippage_breached {
            MetricsCounters::incr(&self.metrics.slippage_aborts);
            self.cooldowns.record(market_id, Utc::now());
            self.events.publish(Event::SlippageExceeded {
                market_id: market_id.to_string(),
                expected_cost,
                current_cost,
            });
            warn!(market_id, %expected_cost, %current_cost, "slippage abort");
            return true;
        }

        // Execute both FOK legs and reconcile.
        self.execute(
            market_id,
            &yes,
            &no,
            final_shares,
            fresh_yes.effective_price,
            fresh_no.effective_price,
        )
        .await;
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn build_opportunity(
        &self,
        market_id: &str,
        yes: &Leg,
        no: &Leg,
        shares: Decimal,
        eff_yes: Decimal,
        eff_no: Decimal,
        yes_levels: usize,
        no_levels: usize,
        score: Decimal,
        fee_rate: Decimal,
        now: DateTime<Utc>,
    ) -> Opportunity {
        let gross_cost = shares * (eff_yes + eff_no);
        let fees = gross_cost * fee_rate;
        let net_profit = shares - gross_cost - fees;
        let capital = gross_cost + fees;
        let roi = if capital > Decimal::ZERO {
            net_profit / capital
        } else {
            Decimal::ZERO
        };
        Opportunity {
            market_id: market_id.to_string(),
            yes_exchange: yes.exchange,
            no_exchange: no.exchange,
            yes_token_id: yes.token_id.clone(),
            no_token_id: no.token_id.clone(),
            eff_yes,
            eff_no,
            yes_levels,
            no_levels,
            shares,
            gross_cost,
            fees,
            net_profit,
            roi,
            score,
            observed_at: now,
        }
    }

    /// Dispatch both FOK buys concurrently and reconcile the outcome.
    async fn execute(
        &self,
        market_id: &str,
        yes: &Leg,
        no: &Leg,
        shares: Decimal,
        eff_yes: Decimal,
        eff_no: Decimal,
    ) {
        let (Some(yes_client), Some(no_client)) = (
            self.clients.get(&yes.exchange).cloned(),
            self.clients.get(&no.exchange).cloned(),
        ) else {
            return;
        };

        // Limit prices: effective price rounded up one tick.
        let yes_limit = round_up_tick(eff_yes);
        let no_limit = round_up_tick(eff_no);

        // Order placement is critical priority: this blocks, never drops.
        let _ = self
            .limiter
            .acquire(yes.exchange, EndpointClass::Orders)
            .await;
        let _ = self
            .limiter
            .acquire(no.exchange, EndpointClass::Orders)
            .await;

        let deadline = Duration::from_secs(self.config.execution.order_timeout_secs);
        let yes_request = OrderRequest::fok_buy(&yes.token_id, yes_limit, shares);
        let no_request = OrderRequest::fok_buy(&no.token_id, no_limit, shares);

        info!(market_id, %shares, %yes_limit, %no_limit, "dispatching paired FOK buys");
        let (yes_result, no_result) = tokio::join!(
            tokio::time::timeout(deadline, yes_client.place_order(yes_request)),
            tokio::time::timeout(deadline, no_client.place_order(no_request)),
        );
        let yes_result = flatten_order_result(yes_result);
        let no_result = flatten_order_result(no_result);

        self.cooldowns.record(market_id, Utc::now());

        match (yes_result, no_result) {
            (
                OrderResult::Filled {
                    venue_order_id: yes_order,
                    price: yes_price,
                    size: yes_size,
                    fee: yes_fee,
                },
                OrderResult::Filled {
                    venue_order_id: no_order,
                    price: no_price,
                    size: no_size,
                    fee: no_fee,
                },
            ) => {
                self.record_fill(
                    market_id, yes, Outcome::Yes, yes_price, yes_size, yes_fee, &yes_order,
                )
                .await;
                self.record_fill(
                    market_id, no, Outcome::No, no_price, no_size, no_fee, &no_order,
                )
                .await;
                let paired = yes_size.min(no_size);
                self.monitor.record_entry(
                    market_id,
                    yes.exchange,
                    no.exchange,
                    &yes.token_id,
                    &no.token_id,
                    paired,
                    yes_price,
                    no_price,
                );
                let gross = yes_price * yes_size + no_price * no_size;
                let net_profit = paired - gross - (yes_fee + no_fee);
                MetricsCounters::incr(&self.metrics.trades_executed);
                self.cache.mark_executed(market_id);
                self.events.publish(Event::TradeExecuted {
                    market_id: market_id.to_string(),
                    shares: paired,
                    gross_cost: gross,
                    net_profit,
                });
                info!(market_id, %gross, %net_profit, "pair executed");
            }
            (
                OrderResult::Filled {
                    venue_order_id,
                    price,
                    size,
                    fee,
                },
                other,
            ) => {
                debug!(market_id, ?other, "NO leg did not fill");
                self.record_fill(market_id, yes, Outcome::Yes, price, size, fee, &venue_order_id)
                    .await;
                self.unwind_leg(market_id, yes, Outcome::Yes, price, size, fee)
                    .await;
            }
            (
                other,
                OrderResult::Filled {
                    venue_order_id,
                    price,
                    size,
                    fee,
                },
            ) => {
                debug!(market_id, ?other, "YES leg did not fill");
                self.record_fill(market_id, no, Outcome::No, price, size, fee, &venue_order_id)
                    .await;
                self.unwind_leg(market_id, no, Outcome::No, price, size, fee)
                    .await;
            }
            (yes_other, no_other) => {
                MetricsCounters::incr(&self.metrics.fills_rejected);
                debug!(market_id, ?yes_other, ?no_other, "both legs rejected");
                self.events.publish(Event::FillRejected {
                    market_id: market_id.to_string(),
                });
            }
        }
    }

    /// Persist one filled entry leg.
    #[allow(clippy::too_many_arguments)]
    async fn record_fill(
        &self,
        market_id: &str,
        leg: &Leg,
        outcome: Outcome,
        price: Decimal,
        size: Decimal,
        fee: Decimal,
        venue_order_id: &str,
    ) {
        self.sink
            .record(&Trade {
                ts: Utc::now(),
                market_id: market_id.to_string(),
                token_id: leg.token_id.clone(),
                outcome,
                side: Side::Buy,
                price,
                size,
                fee,
                exchange: leg.exchange,
                venue_order_id: venue_order_id.to_string(),
            })
            .await;
    }

    /// Defensive exit of a one-sided fill: market-sell the filled leg into
    /// available bid depth and book the realized loss.
    async fn unwind_leg(
        &self,
        market_id: &str,
        leg: &Leg,
        outcome: Outcome,
        fill_price: Decimal,
        fill_size: Decimal,
        fill_fee: Decimal,
    ) {
        MetricsCounters::incr(&self.metrics.partial_unwinds);
        let Some(client) = self.clients.get(&leg.exchange).cloned() else {
            return;
        };

        let bids = self
            .books
            .bid_levels(&leg.token_id, self.config.markets.max_order_book_depth);
        let bid_depth: Decimal = bids.iter().map(|l| l.size).sum();
        let sell_size = fill_size.min(bid_depth);

        let mut proceeds = Decimal::ZERO;
        if sell_size > Decimal::ZERO {
            let _ = self
                .limiter
                .acquire(leg.exchange, EndpointClass::Orders)
                .await;
            let request = OrderRequest::market_sell(&leg.token_id, sell_size);
            let deadline = Duration::from_secs(self.config.execution.order_timeout_secs);
            match tokio::time::timeout(deadline, client.place_order(request)).await {
                Ok(Ok(OrderResult::Filled {
                    venue_order_id,
                    price,
                    size,
                    fee,
                })) => {
                    proceeds = price * size - fee;
                    self.sink
                        .record(&Trade {
                            ts: Utc::now(),
                            market_id: market_id.to_string(),
                            token_id: leg.token_id.clone(),
                            outcome,
                            side: Side::Sell,
                            price,
                            size,
                            fee,
                            exchange: leg.exchange,
                            venue_order_id,
                        })
                        .await;
                }
                Ok(Ok(other)) => {
                    error!(market_id, ?other, "unwind sell did not fill");
                }
                Ok(Err(error)) => {
                    error!(market_id, %error, "unwind sell errored");
                }
                Err(_) => {
                    error!(market_id, "unwind sell timed out");
                }
            }
        } else {
            error!(market_id, "no bid depth to unwind into");
        }

        let loss = (fill_price * fill_size + fill_fee) - proceeds;
        self.risk.trade_closed(market_id, -loss);
        self.events.publish(Event::PartialFillUnwound {
            market_id: market_id.to_string(),
            filled_outcome: outcome,
            shares: fill_size,
            loss,
        });
        warn!(market_id, %outcome, %loss, "partial fill unwound");
    }

    /// Minimum usable balance across the legs' venues, with the configured
    /// fallback when a query times out or is throttled.
    async fn available_balance(&self, yes_exchange: Exchange, no_exchange: Exchange) -> Decimal {
        let mut balance = Decimal::MAX;
        let mut venues = vec![yes_exchange];
        if no_exchange != yes_exchange {
            venues.push(no_exchange);
        }
        for exchange in venues {
            let venue_balance = match self.clients.get(&exchange) {
                Some(client) if self.limiter.try_acquire(exchange, EndpointClass::Markets) => {
                    let deadline =
                        Duration::from_secs(self.config.execution.balance_timeout_secs);
                    match tokio::time::timeout(deadline, client.get_balance("USDC")).await {
                        Ok(Ok(b)) => b,
                        _ => self.config.trading.fallback_balance,
                    }
                }
                _ => self.config.trading.fallback_balance,
            };
            balance = balance.min(venue_balance);
        }
        if balance == Decimal::MAX {
            self.config.trading.fallback_balance
        } else {
            balance
        }
    }
}

/// Applies one token's book event stream to the shared store, recovering
/// from invariant violations with a fresh snapshot.
struct BookIngestor {
    exchange: Exchange,
    client: Arc<dyn ExchangeClient>,
    books: SharedBooks,
    events: EventBus,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCounters>,
    control: Arc<ControlFlags>,
    snapshot_timeout: Duration,
}

impl BookIngestor {
    async fn run(self, mut rx: tokio::sync::mpsc::Receiver<BookEvent>) {
        while let Some(event) = rx.recv().await {
            if self.control.is_shutdown_requested() {
                break;
            }
            MetricsCounters::incr(&self.metrics.book_events);
            let token = event.token_id().to_string();
            let outcome = match event {
                BookEvent::Snapshot {
                    ref token_id,
                    ref bids,
                    ref asks,
                    seq,
                    ts,
                } => self.books.apply_snapshot(token_id, bids, asks, seq, ts),
                BookEvent::Delta {
                    ref token_id,
                    side,
                    price,
                    size,
                    seq,
                    ts,
                } => self
                    .books
                    .apply_delta(token_id, side, price, size, seq, ts)
                    .map(|_| ()),
            };
            if let Err(error) = outcome {
                warn!(token_id = %token, %error, "book invariant violated, resyncing");
                self.books.pause(&token);
                self.events.publish(Event::BookReset {
                    exchange: self.exchange,
                    token_id: token.clone(),
                });
                self.resync(&token).await;
            }
        }
        debug!("book stream ended");
    }

    /// Fetch and apply a fresh snapshot for a paused token.
    async fn resync(&self, token_id: &str) {
        if self
            .limiter
            .acquire(self.exchange, EndpointClass::Markets)
            .await
            .is_err()
        {
            return;
        }
        let fetched = tokio::time::timeout(
            self.snapshot_timeout,
            self.client.fetch_book_snapshot(token_id),
        )
        .await;
        match fetched {
            Ok(Ok(BookEvent::Snapshot {
                token_id,
                bids,
                asks,
                seq,
                ts,
            })) => {
                if let Err(error) = self.books.apply_snapshot(&token_id, &bids, &asks, seq, ts) {
                    warn!(token_id = %token_id, %error, "resync snapshot still invalid");
                }
            }
            Ok(Ok(BookEvent::Delta { .. })) => {
                warn!(token_id = %token_id, "venue returned a delta for a snapshot fetch");
            }
            Ok(Err(error)) => warn!(token_id = %token_id, %error, "snapshot fetch failed"),
            Err(_) => warn!(token_id = %token_id, "snapshot fetch timed out"),
        }
    }
}

/// Relative adverse move of `current` above `expected`.
fn adverse_move(expected: Decimal, current: Decimal) -> Decimal {
    if expected <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((current - expected) / expected).max(Decimal::ZERO)
}

/// Round a price up to the next venue tick.
fn round_up_tick(price: Decimal) -> Decimal {
    (price / PRICE_TICK).ceil() * PRICE_TICK
}

/// Collapse a timed-out submission into `OrderResult::Timeout`.
fn flatten_order_result(
    result: Result<Result<OrderResult, crate::error::ExchangeError>, tokio::time::error::Elapsed>,
) -> OrderResult {
    match result {
        Ok(Ok(order_result)) => order_result,
        Ok(Err(error)) => OrderResult::Rejected {
            reason: error.to_string(),
        },
        Err(_) => OrderResult::Timeout,
    }
}
