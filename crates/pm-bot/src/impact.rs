//! Depth-aware effective price math.
//!
//! Top-of-book quotes lie: buying any real size sweeps multiple levels, and
//! the average fill price is what decides whether a YES/NO pair is still
//! below $1.00. Everything here consumes ask levels greedily from the best
//! price outward.
//!
//! CRITICAL: All prices and quantities use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use pm_common::PriceLevel;
use rust_decimal::Decimal;

use crate::book::SIZE_DP;

/// Result of sweeping a book side for a target size or spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImpactResult {
    /// Shares actually obtainable.
    pub shares: Decimal,
    /// Depth-weighted average price per share.
    pub effective_price: Decimal,
    /// Total notional for `shares`.
    pub total_cost: Decimal,
    /// Number of levels consumed.
    pub levels_consumed: usize,
    /// True when the request exceeded available depth.
    pub depth_exhausted: bool,
}

impl ImpactResult {
    fn empty(depth_exhausted: bool) -> Self {
        Self {
            shares: Decimal::ZERO,
            effective_price: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            levels_consumed: 0,
            depth_exhausted,
        }
    }
}

/// Average price to buy `shares` by sweeping `asks` from the best level.
///
/// If the book is shallower than the request, the result carries the
/// available shares and their effective price, flagged `depth_exhausted`.
pub fn effective_cost(asks: &[PriceLevel], shares: Decimal) -> ImpactResult {
    if shares <= Decimal::ZERO || asks.is_empty() {
        return ImpactResult::empty(asks.is_empty());
    }

    let mut remaining = shares;
    let mut total_cost = Decimal::ZERO;
    let mut filled = Decimal::ZERO;
    let mut levels = 0usize;

    for level in asks {
        if remaining <= Decimal::ZERO {
            break;
        }
        if level.size <= Decimal::ZERO {
            continue;
        }
        let take = remaining.min(level.size);
        total_cost += take * level.price;
        filled += take;
        remaining -= take;
        levels += 1;
    }

    if filled <= Decimal::ZERO {
        return ImpactResult::empty(true);
    }

    ImpactResult {
        shares: filled,
        effective_price: total_cost / filled,
        total_cost,
        levels_consumed: levels,
        depth_exhausted: remaining > Decimal::ZERO,
    }
}

/// Shares obtainable for a fixed spend, sweeping until the spend or the
/// book is exhausted.
pub fn shares_for_spend(asks: &[PriceLevel], spend: Decimal) -> ImpactResult {
    if spend <= Decimal::ZERO || asks.is_empty() {
        return ImpactResult::empty(asks.is_empty());
    }

    let mut budget = spend;
    let mut total_cost = Decimal::ZERO;
    let mut filled = Decimal::ZERO;
    let mut levels = 0usize;
    let mut book_exhausted = true;

    for level in asks {
        if level.size <= Decimal::ZERO {
            continue;
        }
        let level_cost = level.cost();
        if level_cost <= budget {
            total_cost += level_cost;
            filled += level.size;
            budget -= level_cost;
            levels += 1;
        } else {
            let take = (budget / level.price).round_dp_with_strategy(
                SIZE_DP,
                rust_decimal::RoundingStrategy::ToZero,
            );
            if take > Decimal::ZERO {
                total_cost += take * level.price;
                filled += take;
                levels += 1;
            }
            book_exhausted = false;
            break;
        }
    }

    if filled <= Decimal::ZERO {
        return ImpactResult::empty(book_exhausted);
    }

    ImpactResult {
        shares: filled,
        effective_price: total_cost / filled,
        total_cost,
        levels_consumed: levels,
        depth_exhausted: book_exhausted,
    }
}

/// Largest share count whose effective price stays at or under `price_cap`.
///
/// Walks levels with the closed form: with cumulative cost `C` over `S`
/// shares, taking `x` more at price `p` keeps the average under the cap
/// while `x <= (cap * S - C) / (p - cap)` whenever `p > cap`.
pub fn max_shares_under(asks: &[PriceLevel], price_cap: Decimal) -> Decimal {
    if price_cap <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut shares = Decimal::ZERO;
    let mut cost = Decimal::ZERO;

    for level in asks {
        if level.size <= Decimal::ZERO {
            continue;
        }
        if level.price <= price_cap {
            shares += level.size;
            cost += level.cost();
        } else {
            let headroom = price_cap * shares - cost;
            if headroom <= Decimal::ZERO {
                break;
            }
            let take = (headroom / (level.price - price_cap)).round_dp_with_strategy(
                SIZE_DP,
                rust_decimal::RoundingStrategy::ToZero,
            );
            shares += take.min(level.size);
            break;
        }
    }

    shares
}

/// Optimal pair size search.
///
/// Binary-searches whole shares `n` in `[1, max_shares]` for the largest
/// size where the fee-adjusted combined effective cost stays under
/// `cost_ceiling`:
///
/// `(eff_yes(n) + eff_no(n)) * (1 + fee_rate) <= cost_ceiling`
///
/// `effective_price` is non-decreasing in `n`, so the feasible set is a
/// prefix and binary search is sound. Returns the chosen size and both
/// effective prices, or `None` when not even one share clears the ceiling.
pub fn find_optimal_size(
    yes_asks: &[PriceLevel],
    no_asks: &[PriceLevel],
    fee_rate: Decimal,
    cost_ceiling: Decimal,
    max_shares: u64,
) -> Option<(Decimal, Decimal, Decimal)> {
    if max_shares == 0 {
        return None;
    }

    let feasible = |n: u64| -> Option<(Decimal, Decimal)> {
        let shares = Decimal::from(n);
        let yes = effective_cost(yes_asks, shares);
        let no = effective_cost(no_asks, shares);
        if yes.depth_exhausted || no.depth_exhausted {
            return None;
        }
        let combined = (yes.effective_price + no.effective_price) * (Decimal::ONE + fee_rate);
        if combined <= cost_ceiling {
            Some((yes.effective_price, no.effective_price))
        } else {
            None
        }
    };

    feasible(1)?;

    let mut lo = 1u64;
    let mut hi = max_shares;
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if feasible(mid).is_some() {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    let (eff_yes, eff_no) = feasible(lo)?;
    Some((Decimal::from(lo), eff_yes, eff_no))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn levels(raw: &[(f64, f64)]) -> Vec<PriceLevel> {
        raw.iter()
            .map(|(p, s)| {
                PriceLevel::new(
                    Decimal::try_from(*p).unwrap(),
                    Decimal::try_from(*s).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_effective_cost_single_level() {
        let asks = levels(&[(0.50, 100.0)]);
        let result = effective_cost(&asks, dec!(60));
        assert_eq!(result.shares, dec!(60));
        assert_eq!(result.effective_price, dec!(0.50));
        assert_eq!(result.total_cost, dec!(30));
        assert_eq!(result.levels_consumed, 1);
        assert!(!result.depth_exhausted);
    }

    #[test]
    fn test_effective_cost_multi_level() {
        let asks = levels(&[(0.50, 100.0), (0.51, 100.0), (0.52, 100.0)]);
        // 150 shares: 100 @ 0.50 + 50 @ 0.51 = 75.5
        let result = effective_cost(&asks, dec!(150));
        assert_eq!(result.shares, dec!(150));
        assert_eq!(result.total_cost, dec!(75.5));
        assert_eq!(result.levels_consumed, 2);
        assert!(result.effective_price > dec!(0.503));
        assert!(result.effective_price < dec!(0.504));
    }

    #[test]
    fn test_effective_cost_depth_exhausted() {
        let asks = levels(&[(0.50, 100.0)]);
        let result = effective_cost(&asks, dec!(250));
        assert_eq!(result.shares, dec!(100));
        assert_eq!(result.effective_price, dec!(0.50));
        assert!(result.depth_exhausted);
    }

    #[test]
    fn test_effective_cost_empty_inputs() {
        assert_eq!(effective_cost(&[], dec!(10)).shares, Decimal::ZERO);
        let asks = levels(&[(0.50, 100.0)]);
        assert_eq!(effective_cost(&asks, Decimal::ZERO).shares, Decimal::ZERO);
    }

    #[test]
    fn test_effective_price_monotone() {
        // Property 3: effective_price(n) is non-decreasing in n.
        let asks = levels(&[(0.40, 50.0), (0.42, 100.0), (0.45, 200.0)]);
        let mut last = Decimal::ZERO;
        for n in 1..=350 {
            let result = effective_cost(&asks, Decimal::from(n));
            assert!(
                result.effective_price >= last,
                "effective price decreased at n={}",
                n
            );
            last = result.effective_price;
        }
    }

    #[test]
    fn test_shares_for_spend_exact_levels() {
        let asks = levels(&[(0.50, 100.0), (0.51, 100.0)]);
        // $50 buys exactly the first level.
        let result = shares_for_spend(&asks, dec!(50));
        assert_eq!(result.shares, dec!(100));
        assert_eq!(result.total_cost, dec!(50));
        assert!(!result.depth_exhausted);
    }

    #[test]
    fn test_shares_for_spend_partial_level() {
        let asks = levels(&[(0.50, 100.0), (0.51, 100.0)]);
        // $75.5 = level one ($50) + $25.50 at 0.51 -> 50 shares more.
        let result = shares_for_spend(&asks, dec!(75.5));
        assert_eq!(result.shares, dec!(150));
        assert_eq!(result.levels_consumed, 2);
    }

    #[test]
    fn test_shares_for_spend_book_exhausted() {
        let asks = levels(&[(0.50, 10.0)]);
        let result = shares_for_spend(&asks, dec!(1000));
        assert_eq!(result.shares, dec!(10));
        assert!(result.depth_exhausted);
    }

    #[test]
    fn test_max_shares_under_all_below_cap() {
        let asks = levels(&[(0.40, 50.0), (0.42, 100.0)]);
        assert_eq!(max_shares_under(&asks, dec!(0.45)), dec!(150));
    }

    #[test]
    fn test_max_shares_under_partial_expensive_level() {
        // 50 @ 0.40, then 0.50 level. Cap 0.45:
        // headroom = 0.45*50 - 20 = 2.5; take = 2.5 / (0.50-0.45) = 50.
        let asks = levels(&[(0.40, 50.0), (0.50, 100.0)]);
        assert_eq!(max_shares_under(&asks, dec!(0.45)), dec!(100));
    }

    #[test]
    fn test_max_shares_under_first_level_too_expensive() {
        let asks = levels(&[(0.60, 100.0)]);
        assert_eq!(max_shares_under(&asks, dec!(0.45)), Decimal::ZERO);
    }

    #[test]
    fn test_max_shares_under_consistency() {
        // The returned size must actually satisfy the cap.
        let asks = levels(&[(0.40, 30.0), (0.47, 80.0), (0.55, 40.0)]);
        let cap = dec!(0.48);
        let n = max_shares_under(&asks, cap);
        assert!(n > Decimal::ZERO);
        let result = effective_cost(&asks, n);
        assert!(result.effective_price <= cap);
    }

    #[test]
    fn test_find_optimal_size_deep_book() {
        // Scenario S2 books: YES [(0.40,50),(0.42,100)], NO [(0.45,50),(0.47,100)].
        // Fee 0.5%, margin 1% -> ceiling 0.99.
        let yes = levels(&[(0.40, 50.0), (0.42, 100.0)]);
        let no = levels(&[(0.45, 50.0), (0.47, 100.0)]);
        let (shares, eff_yes, eff_no) =
            find_optimal_size(&yes, &no, dec!(0.005), dec!(0.99), 150).unwrap();
        // At 50 shares: 0.40 + 0.45 = 0.85; fee-adjusted 0.85425 <= 0.99.
        // Deeper sizes stay under 0.99 until depth runs out at 150.
        assert_eq!(shares, dec!(150));
        let combined = (eff_yes + eff_no) * dec!(1.005);
        assert!(combined <= dec!(0.99));
    }

    #[test]
    fn test_find_optimal_size_ceiling_binds() {
        // Make the ceiling bind before depth runs out.
        let yes = levels(&[(0.40, 50.0), (0.58, 100.0)]);
        let no = levels(&[(0.45, 50.0), (0.47, 100.0)]);
        let (shares, _, _) =
            find_optimal_size(&yes, &no, Decimal::ZERO, dec!(0.90), 150).unwrap();
        // Beyond 50 the YES side sweeps 0.58s and the combined average
        // crosses 0.90 well before 150.
        assert!(shares >= dec!(50));
        assert!(shares < dec!(150));
        let check = |n: Decimal| {
            effective_cost(&yes, n).effective_price + effective_cost(&no, n).effective_price
        };
        assert!(check(shares) <= dec!(0.90));
        assert!(check(shares + Decimal::ONE) > dec!(0.90));
    }

    #[test]
    fn test_find_optimal_size_unprofitable() {
        let yes = levels(&[(0.55, 100.0)]);
        let no = levels(&[(0.50, 100.0)]);
        assert!(find_optimal_size(&yes, &no, dec!(0.01), dec!(0.98), 100).is_none());
    }

    #[test]
    fn test_find_optimal_size_empty_book() {
        let yes = levels(&[(0.40, 100.0)]);
        assert!(find_optimal_size(&yes, &[], dec!(0.01), dec!(0.98), 100).is_none());
        assert!(find_optimal_size(&yes, &yes, dec!(0.01), dec!(0.98), 0).is_none());
    }
}
