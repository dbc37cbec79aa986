//! Dynamic per-trade capital allocation.
//!
//! Starts from the configured base stake and shades it by opportunity ROI,
//! market quality, the day's P&L, the UTC trading hour, and how many book
//! levels the fill would chew through. The result is then bounded by the
//! available balance less a buffer that widens as the trade consumes more
//! of the top of book.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::opportunity::Opportunity;

/// ROI at which the ROI multiplier is exactly 1.0.
const ROI_PIVOT: Decimal = Decimal::from_parts(2, 0, 0, false, 2); // 0.02
/// Quality score at which the quality multiplier is exactly 1.0.
const QUALITY_PIVOT: Decimal = Decimal::from_parts(50, 0, 0, false, 0);

/// Result of one allocation decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    /// Dollars to deploy on this trade (both legs, fees included).
    #[serde(with = "rust_decimal::serde::str")]
    pub allocated: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub roi_multiplier: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub quality_multiplier: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub pnl_multiplier: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub time_multiplier: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub depth_multiplier: Decimal,
    /// Balance fraction held back.
    #[serde(with = "rust_decimal::serde::str")]
    pub buffer: Decimal,
}

/// Dynamic per-trade sizer.
#[derive(Debug, Clone)]
pub struct CapitalAllocator {
    /// Base capital per trade.
    base_capital: Decimal,
    /// Daily loss limit used to scale the P&L multiplier.
    max_daily_loss: Decimal,
}

impl CapitalAllocator {
    pub fn new(base_capital: Decimal, max_daily_loss: Decimal) -> Self {
        Self {
            base_capital,
            max_daily_loss,
        }
    }

    /// Compute the dollar allocation for an opportunity.
    ///
    /// `depth_consumption` is the fraction of top-of-book depth the
    /// intended size would consume, used to scale the balance buffer.
    pub fn allocate(
        &self,
        opportunity: &Opportunity,
        daily_pnl: Decimal,
        available_balance: Decimal,
        depth_consumption: Decimal,
        now: DateTime<Utc>,
    ) -> AllocationResult {
        let roi_multiplier = (opportunity.roi / ROI_PIVOT)
            .clamp(Decimal::new(5, 1), Decimal::new(2, 0));
        let quality_multiplier = (opportunity.score / QUALITY_PIVOT)
            .clamp(Decimal::new(5, 1), Decimal::new(15, 1));
        let pnl_multiplier = self.pnl_multiplier(daily_pnl);
        let time_multiplier = time_multiplier(now);
        let depth_multiplier =
            depth_multiplier(opportunity.yes_levels.max(opportunity.no_levels));

        let size = self.base_capital
            * roi_multiplier
            * quality_multiplier
            * pnl_multiplier
            * time_multiplier
            * depth_multiplier;

        let buffer = dynamic_buffer(depth_consumption);
        let ceiling = (available_balance * (Decimal::ONE - buffer)).max(Decimal::ZERO);

        AllocationResult {
            allocated: size.min(ceiling).round_dp(2),
            roi_multiplier,
            quality_multiplier,
            pnl_multiplier,
            time_multiplier,
            depth_multiplier,
            buffer,
        }
    }

    /// 1.0 when flat or up on the day, scaling linearly down to 0.5 at half
    /// the daily loss limit and below.
    fn pnl_multiplier(&self, daily_pnl: Decimal) -> Decimal {
        if daily_pnl >= Decimal::ZERO {
            return Decimal::ONE;
        }
        if self.max_daily_loss <= Decimal::ZERO {
            return Decimal::ONE;
        }
        let half_limit = self.max_daily_loss / Decimal::TWO;
        if daily_pnl < -half_limit {
            return Decimal::new(5, 1);
        }
        // daily_pnl in [-half_limit, 0): 1.0 at 0 down to 0.5 at -half_limit.
        Decimal::ONE + daily_pnl / self.max_daily_loss
    }
}

/// 1.2 in peak hours (14:00-20:00 UTC), 0.6 overnight (00:00-08:00 UTC),
/// 1.0 otherwise.
fn time_multiplier(now: DateTime<Utc>) -> Decimal {
    let hour = now.hour();
    if (14..20).contains(&hour) {
        Decimal::new(12, 1)
    } else if hour < 8 {
        Decimal::new(6, 1)
    } else {
        Decimal::ONE
    }
}

/// Shades allocation by how many ask levels the fill sweeps.
fn depth_multiplier(levels: usize) -> Decimal {
    match levels {
        0 | 1 => Decimal::ONE,
        2 | 3 => Decimal::new(95, 2),
        4 | 5 => Decimal::new(90, 2),
        _ => Decimal::new(85, 2),
    }
}

/// 2% below a quarter of top-of-book depth, scaling linearly to 10% at
/// full consumption.
fn dynamic_buffer(depth_consumption: Decimal) -> Decimal {
    let quarter = Decimal::new(25, 2);
    if depth_consumption < quarter {
        return Decimal::new(2, 2);
    }
    let capped = depth_consumption.min(Decimal::ONE);
    let scale = (capped - quarter) / Decimal::new(75, 2);
    Decimal::new(2, 2) + scale * Decimal::new(8, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pm_common::Exchange;
    use rust_decimal_macros::dec;

    fn opportunity(roi: Decimal, score: Decimal, levels: usize) -> Opportunity {
        Opportunity {
            market_id: "m1".to_string(),
            yes_exchange: Exchange::Polymarket,
            no_exchange: Exchange::Polymarket,
            yes_token_id: "yes".to_string(),
            no_token_id: "no".to_string(),
            eff_yes: dec!(0.48),
            eff_no: dec!(0.49),
            yes_levels: levels,
            no_levels: 1,
            shares: dec!(100),
            gross_cost: dec!(97),
            fees: dec!(0.97),
            net_profit: dec!(2.03),
            roi,
            score,
            observed_at: Utc::now(),
        }
    }

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, hour, 30, 0).unwrap()
    }

    fn allocator() -> CapitalAllocator {
        CapitalAllocator::new(dec!(10), dec!(50))
    }

    #[test]
    fn test_neutral_allocation() {
        // 2% ROI, score 50, flat P&L, mid-day off-peak, single level:
        // every multiplier is exactly 1.0.
        let result = allocator().allocate(
            &opportunity(dec!(0.02), dec!(50), 1),
            Decimal::ZERO,
            dec!(1000),
            dec!(0.10),
            at_hour(10),
        );
        assert_eq!(result.roi_multiplier, dec!(1));
        assert_eq!(result.quality_multiplier, dec!(1));
        assert_eq!(result.pnl_multiplier, dec!(1));
        assert_eq!(result.time_multiplier, dec!(1));
        assert_eq!(result.depth_multiplier, dec!(1));
        assert_eq!(result.allocated, dec!(10.00));
    }

    #[test]
    fn test_roi_multiplier_clamps() {
        let a = allocator();
        // 10% ROI: 0.10 / 0.02 = 5, clamped to 2.
        let high = a.allocate(
            &opportunity(dec!(0.10), dec!(50), 1),
            Decimal::ZERO,
            dec!(1000),
            dec!(0.1),
            at_hour(10),
        );
        assert_eq!(high.roi_multiplier, dec!(2));

        // 0.5% ROI: 0.25, clamped up to 0.5.
        let low = a.allocate(
            &opportunity(dec!(0.005), dec!(50), 1),
            Decimal::ZERO,
            dec!(1000),
            dec!(0.1),
            at_hour(10),
        );
        assert_eq!(low.roi_multiplier, dec!(0.5));
    }

    #[test]
    fn test_quality_multiplier_clamps() {
        let a = allocator();
        let top = a.allocate(
            &opportunity(dec!(0.02), dec!(100), 1),
            Decimal::ZERO,
            dec!(1000),
            dec!(0.1),
            at_hour(10),
        );
        assert_eq!(top.quality_multiplier, dec!(1.5));

        let bottom = a.allocate(
            &opportunity(dec!(0.02), dec!(10), 1),
            Decimal::ZERO,
            dec!(1000),
            dec!(0.1),
            at_hour(10),
        );
        assert_eq!(bottom.quality_multiplier, dec!(0.5));
    }

    #[test]
    fn test_pnl_multiplier_interpolation() {
        let a = allocator();
        // Flat or winning: full size.
        assert_eq!(a.pnl_multiplier(dec!(5)), dec!(1));
        assert_eq!(a.pnl_multiplier(Decimal::ZERO), dec!(1));
        // Down $10 of a $50 limit: 1 - 10/50 = 0.8.
        assert_eq!(a.pnl_multiplier(dec!(-10)), dec!(0.8));
        // At half the limit: floor.
        assert_eq!(a.pnl_multiplier(dec!(-25)), dec!(0.5));
        // Beyond half the limit: still the floor.
        assert_eq!(a.pnl_multiplier(dec!(-40)), dec!(0.5));
    }

    #[test]
    fn test_time_multiplier_bands() {
        assert_eq!(time_multiplier(at_hour(15)), dec!(1.2));
        assert_eq!(time_multiplier(at_hour(14)), dec!(1.2));
        assert_eq!(time_multiplier(at_hour(19)), dec!(1.2));
        assert_eq!(time_multiplier(at_hour(20)), dec!(1));
        assert_eq!(time_multiplier(at_hour(3)), dec!(0.6));
        assert_eq!(time_multiplier(at_hour(7)), dec!(0.6));
        assert_eq!(time_multiplier(at_hour(8)), dec!(1));
        assert_eq!(time_multiplier(at_hour(10)), dec!(1));
    }

    #[test]
    fn test_depth_multiplier_tiers() {
        assert_eq!(depth_multiplier(1), dec!(1));
        assert_eq!(depth_multiplier(3), dec!(0.95));
        assert_eq!(depth_multiplier(5), dec!(0.90));
        assert_eq!(depth_multiplier(8), dec!(0.85));
    }

    #[test]
    fn test_dynamic_buffer_scaling() {
        assert_eq!(dynamic_buffer(dec!(0.10)), dec!(0.02));
        assert_eq!(dynamic_buffer(dec!(0.25)), dec!(0.02));
        // Midpoint: 62.5% consumption -> 6% buffer.
        assert_eq!(dynamic_buffer(dec!(0.625)), dec!(0.06));
        assert_eq!(dynamic_buffer(dec!(1.0)), dec!(0.10));
        // Over-consumption clamps at the 10% ceiling.
        assert_eq!(dynamic_buffer(dec!(1.8)), dec!(0.10));
    }

    #[test]
    fn test_balance_ceiling_binds() {
        // Rich multipliers but only $20 of balance at a 2% buffer.
        let result = allocator().allocate(
            &opportunity(dec!(0.10), dec!(100), 1),
            Decimal::ZERO,
            dec!(20),
            dec!(0.10),
            at_hour(15),
        );
        // Unbounded would be 10 * 2 * 1.5 * 1 * 1.2 = 36.
        assert_eq!(result.allocated, dec!(19.60));
    }

    #[test]
    fn test_losing_day_shrinks_size() {
        let result = allocator().allocate(
            &opportunity(dec!(0.02), dec!(50), 1),
            dec!(-25),
            dec!(1000),
            dec!(0.10),
            at_hour(10),
        );
        assert_eq!(result.pnl_multiplier, dec!(0.5));
        assert_eq!(result.allocated, dec!(5.00));
    }
}
