//! Configuration for the arbitrage core.
//!
//! Supports loading from a TOML file with environment variable overrides.
//! Every tunable the engine consults is defined here with its default.

use std::path::Path;

use anyhow::{bail, Context, Result};
use pm_common::Exchange;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level configuration for the arbitrage core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Venues to trade on.
    pub enabled_platforms: Vec<Exchange>,

    /// Evaluate matched pairs across venues.
    pub cross_platform_arbitrage: bool,

    /// Logging filter (tracing `EnvFilter` syntax).
    pub log_level: String,

    /// Trading parameters.
    pub trading: TradingConfig,

    /// Risk management parameters.
    pub risk: RiskConfig,

    /// Market monitoring parameters.
    pub markets: MarketConfig,

    /// Execution parameters.
    pub execution: ExecutionConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            enabled_platforms: vec![Exchange::Polymarket],
            cross_platform_arbitrage: false,
            log_level: "info".to_string(),
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            markets: MarketConfig::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

/// Trading parameters for detection and sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    /// Base capital per trade (USDC).
    pub capital_per_trade: Decimal,

    /// Minimum profit margin below $1.00 to trade (0.02 = 2%).
    pub min_profit_margin: Decimal,

    /// Minimum absolute profit per trade pair (USDC).
    pub min_profit_dollars: Decimal,

    /// Taker fee per leg as a fraction of notional (0.01 = 1%).
    pub trading_fee_percent: Decimal,

    /// Maximum tolerated adverse move between detect and execute (0.005 = 0.5%).
    pub max_slippage: Decimal,

    /// Balance assumed when the venue balance query fails (USDC).
    pub fallback_balance: Decimal,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            capital_per_trade: Decimal::new(10, 0),
            min_profit_margin: Decimal::new(2, 2),    // 0.02
            min_profit_dollars: Decimal::ONE,
            trading_fee_percent: Decimal::new(1, 2),  // 0.01
            max_slippage: Decimal::new(5, 3),         // 0.005
            fallback_balance: Decimal::new(1000, 0),
        }
    }
}

/// Risk management parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Exit a position once its unrealized loss ratio reaches this (0.05 = 5%).
    pub stop_loss: Decimal,

    /// Exit a position once its unrealized gain ratio reaches this (0.10 = 10%).
    pub take_profit: Decimal,

    /// Halt new entries once daily P&L reaches minus this many dollars.
    pub max_daily_loss: Decimal,

    /// Maximum simultaneously open positions.
    pub max_concurrent_positions: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss: Decimal::new(5, 2),      // 0.05
            take_profit: Decimal::new(10, 2),   // 0.10
            max_daily_loss: Decimal::new(50, 0),
            max_concurrent_positions: 10,
        }
    }
}

/// Market monitoring parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Minimum quoted volume for a market to be considered.
    pub min_market_volume: Decimal,

    /// Maximum token subscriptions held at once (two per market).
    pub max_tokens_monitor: usize,

    /// Maximum book depth returned by walks.
    pub max_order_book_depth: usize,

    /// Minimum quality score for a market to be subscribed.
    pub min_market_quality_score: Decimal,

    /// Seconds between market list refreshes.
    pub market_refresh_secs: u64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            min_market_volume: Decimal::new(5000, 0),
            max_tokens_monitor: 20,
            max_order_book_depth: 20,
            min_market_quality_score: Decimal::new(50, 0),
            market_refresh_secs: 300,
        }
    }
}

/// Execution parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Minimum seconds between execution attempts on the same market.
    pub cooldown_secs: u64,

    /// Detection loop tick interval (milliseconds).
    pub tick_interval_ms: u64,

    /// Maximum age of a book before detection skips it (milliseconds).
    pub max_book_age_ms: i64,

    /// Overall deadline for the paired FOK submission (seconds).
    pub order_timeout_secs: u64,

    /// Deadline for balance queries (seconds).
    pub balance_timeout_secs: u64,

    /// Deadline for book snapshot fetches (seconds).
    pub snapshot_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            tick_interval_ms: 250,
            max_book_age_ms: 2000,
            order_timeout_secs: 3,
            balance_timeout_secs: 5,
            snapshot_timeout_secs: 10,
        }
    }
}

impl BotConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;
        let mut config: BotConfig =
            toml::from_str(&raw).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from defaults plus environment overrides only.
    pub fn from_env() -> Result<Self> {
        let mut config = BotConfig::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PM_*` environment variable overrides for the common knobs.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("PM_CAPITAL_PER_TRADE") {
            self.trading.capital_per_trade =
                v.parse().context("PM_CAPITAL_PER_TRADE must be a decimal")?;
        }
        if let Ok(v) = std::env::var("PM_MIN_PROFIT_MARGIN") {
            self.trading.min_profit_margin =
                v.parse().context("PM_MIN_PROFIT_MARGIN must be a decimal")?;
        }
        if let Ok(v) = std::env::var("PM_MAX_DAILY_LOSS") {
            self.risk.max_daily_loss =
                v.parse().context("PM_MAX_DAILY_LOSS must be a decimal")?;
        }
        if let Ok(v) = std::env::var("PM_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("PM_ENABLED_PLATFORMS") {
            let mut platforms = Vec::new();
            for part in v.split(',').filter(|p| !p.trim().is_empty()) {
                platforms.push(
                    part.trim()
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))
                        .context("PM_ENABLED_PLATFORMS")?,
                );
            }
            self.enabled_platforms = platforms;
        }
        Ok(())
    }

    /// Validate parameter ranges. Invalid configuration is unrecoverable.
    pub fn validate(&self) -> Result<()> {
        if self.enabled_platforms.is_empty() {
            bail!("enabled_platforms must name at least one venue");
        }
        if self.cross_platform_arbitrage && self.enabled_platforms.len() < 2 {
            bail!("cross_platform_arbitrage requires at least two venues");
        }
        if self.trading.capital_per_trade <= Decimal::ZERO {
            bail!("capital_per_trade must be positive");
        }
        if self.trading.min_profit_margin <= Decimal::ZERO
            || self.trading.min_profit_margin >= Decimal::ONE
        {
            bail!("min_profit_margin must be in (0, 1)");
        }
        if self.trading.trading_fee_percent < Decimal::ZERO
            || self.trading.trading_fee_percent >= Decimal::ONE
        {
            bail!("trading_fee_percent must be in [0, 1)");
        }
        if self.trading.max_slippage <= Decimal::ZERO {
            bail!("max_slippage must be positive");
        }
        if self.risk.max_daily_loss <= Decimal::ZERO {
            bail!("max_daily_loss must be positive");
        }
        if self.risk.max_concurrent_positions == 0 {
            bail!("max_concurrent_positions must be at least 1");
        }
        if self.markets.max_order_book_depth == 0 {
            bail!("max_order_book_depth must be at least 1");
        }
        if self.execution.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be positive");
        }
        Ok(())
    }

    /// How many markets the detection loop evaluates per tick.
    ///
    /// Each market consumes two token subscriptions.
    pub fn top_k_markets(&self) -> usize {
        (self.markets.max_tokens_monitor / 2).max(1)
    }
}

/// Initialize the global tracing subscriber from the configured filter.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(filter: &str) {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_parameters() {
        let config = BotConfig::default();
        assert_eq!(config.trading.capital_per_trade, dec!(10));
        assert_eq!(config.trading.min_profit_margin, dec!(0.02));
        assert_eq!(config.trading.min_profit_dollars, dec!(1.0));
        assert_eq!(config.trading.trading_fee_percent, dec!(0.01));
        assert_eq!(config.trading.max_slippage, dec!(0.005));
        assert_eq!(config.trading.fallback_balance, dec!(1000));
        assert_eq!(config.risk.stop_loss, dec!(0.05));
        assert_eq!(config.risk.take_profit, dec!(0.10));
        assert_eq!(config.risk.max_daily_loss, dec!(50));
        assert_eq!(config.risk.max_concurrent_positions, 10);
        assert_eq!(config.markets.min_market_volume, dec!(5000));
        assert_eq!(config.markets.max_tokens_monitor, 20);
        assert_eq!(config.markets.max_order_book_depth, 20);
        assert_eq!(config.markets.min_market_quality_score, dec!(50));
        assert_eq!(config.execution.cooldown_secs, 30);
    }

    #[test]
    fn test_default_validates() {
        assert!(BotConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_margin() {
        let mut config = BotConfig::default();
        config.trading.min_profit_margin = dec!(1.5);
        assert!(config.validate().is_err());

        config.trading.min_profit_margin = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_cross_platform_single_venue() {
        let mut config = BotConfig::default();
        config.cross_platform_arbitrage = true;
        assert!(config.validate().is_err());

        config.enabled_platforms = vec![Exchange::Polymarket, Exchange::Kalshi];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_platforms() {
        let mut config = BotConfig::default();
        config.enabled_platforms.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_top_k_markets() {
        let config = BotConfig::default();
        // 20 tokens -> 10 markets
        assert_eq!(config.top_k_markets(), 10);

        let mut small = BotConfig::default();
        small.markets.max_tokens_monitor = 1;
        assert_eq!(small.top_k_markets(), 1);
    }

    #[test]
    fn test_toml_section_parse() {
        let raw = r#"
            enabled_platforms = ["polymarket", "kalshi"]
            cross_platform_arbitrage = true

            [trading]
            capital_per_trade = "25"
            min_profit_margin = "0.03"

            [risk]
            max_daily_loss = "100"
        "#;
        let config: BotConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.enabled_platforms.len(), 2);
        assert!(config.cross_platform_arbitrage);
        assert_eq!(config.trading.capital_per_trade, dec!(25));
        assert_eq!(config.trading.min_profit_margin, dec!(0.03));
        assert_eq!(config.risk.max_daily_loss, dec!(100));
        // Untouched sections keep defaults.
        assert_eq!(config.markets.max_tokens_monitor, 20);
        assert!(config.validate().is_ok());
    }
}
