//! Size scaling and venue-tick arithmetic. Sizes round half-away-from-zero to
//! the coin's size decimals; prices pass through a five-significant-figure
//! intermediate before snapping to the allowed decimal count, matching the
//! venue's tick rules.

use tracing::warn;

use crate::models::Side;

/// Aggression applied to the mid when pricing a marketable taker order.
const MARKETABLE_BUY_FACTOR: f64 = 1.08;
const MARKETABLE_SELL_FACTOR: f64 = 0.92;

/// Follower-to-leader size multiplier: equity ratio times the per-coin risk
/// multiplier. Any degenerate input yields 0, which suppresses every outgoing
/// order derived from it on this tick.
pub fn scale_factor(leader_account_value: f64, follower_account_value: f64, risk: f64) -> f64 {
    if leader_account_value <= 0.0 || follower_account_value <= 0.0 {
        warn!(
            leader = leader_account_value,
            follower = follower_account_value,
            "scale factor degenerate account value, suppressing orders"
        );
        return 0.0;
    }
    (follower_account_value / leader_account_value) * risk
}

/// Half-away-from-zero rounding to `decimals` places.
pub fn round_to_precision(value: f64, decimals: u32) -> f64 {
    let pow = 10f64.powi(decimals as i32);
    (value * pow).round() / pow
}

pub fn round2(value: f64) -> f64 {
    round_to_precision(value, 2)
}

/// Snap a price to the venue tick for a coin with `sz_decimals` size decimals:
/// prices at or above 100k round to whole dollars, everything else is coerced
/// to 5 significant figures and then rounded to `6 - sz_decimals` decimals.
pub fn snap_price(px: f64, sz_decimals: u32) -> f64 {
    if px <= 0.0 {
        warn!(px, "snap_price non-positive input");
        return px;
    }
    if px >= 100_000.0 {
        return px.round();
    }
    let px_decimals = 6u32.saturating_sub(sz_decimals);
    // Five-significant-figure intermediate via the exponential formatter; the
    // round-trip mirrors the venue's own string handling near tick boundaries.
    let five_sig: f64 = match format!("{:.4e}", px).parse() {
        Ok(v) => v,
        Err(_) => px,
    };
    round_to_precision(five_sig, px_decimals)
}

/// Aggressive limit price for a taker order: pad the mid by 8% in the
/// direction of the trade, then snap to the tick.
pub fn marketable_price(mid: f64, side: Side, sz_decimals: u32) -> f64 {
    let padded = match side {
        Side::Bid => mid * MARKETABLE_BUY_FACTOR,
        Side::Ask => mid * MARKETABLE_SELL_FACTOR,
    };
    snap_price(padded, sz_decimals)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_factor_is_equity_ratio_times_risk() {
        assert_eq!(scale_factor(100.0, 200.0, 2.0), 4.0);
        assert_eq!(scale_factor(1000.0, 100.0, 1.0), 0.1);
    }

    #[test]
    fn scale_factor_degenerate_inputs_yield_zero() {
        assert_eq!(scale_factor(0.0, 200.0, 2.0), 0.0);
        assert_eq!(scale_factor(100.0, 0.0, 2.0), 0.0);
        assert_eq!(scale_factor(-5.0, 200.0, 2.0), 0.0);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_to_precision(0.125, 2), 0.13);
        assert_eq!(round_to_precision(-0.125, 2), -0.13);
        assert_eq!(round_to_precision(2.5, 0), 3.0);
        assert_eq!(round_to_precision(2.4, 0), 2.0);
    }

    #[test]
    fn snap_rounds_large_prices_to_whole_dollars() {
        assert_eq!(snap_price(100_000.4, 5), 100_000.0);
        assert_eq!(snap_price(123_456.7, 0), 123_457.0);
    }

    #[test]
    fn snap_applies_five_sig_figs_then_decimals() {
        // 5 sig figs first: 2161.39 -> 2161.4, then 6-4=2 decimals is a no-op.
        assert_eq!(snap_price(2161.39, 4), 2161.4);
        // 0 sz decimals allows 6 price decimals but sig figs dominate.
        assert_eq!(snap_price(0.0123456, 0), 0.012346);
        // decimals clamp: sz_decimals 5 -> 1 allowed decimal.
        assert_eq!(snap_price(12.34, 5), 12.3);
    }

    #[test]
    fn snap_is_idempotent() {
        for px in [0.0123456, 1.2345678, 99.99999, 2161.39, 54321.5, 123_456.7] {
            for dec in 0..=5u32 {
                let once = snap_price(px, dec);
                assert_eq!(snap_price(once, dec), once, "px={px} dec={dec}");
            }
        }
    }

    #[test]
    fn snap_passes_through_non_positive() {
        assert_eq!(snap_price(0.0, 2), 0.0);
        assert_eq!(snap_price(-1.5, 2), -1.5);
    }

    #[test]
    fn marketable_price_pads_and_snaps() {
        // Buy: 100 * 1.08 = 108, snap with sz_decimals 4 -> 2 decimals.
        assert_eq!(marketable_price(100.0, Side::Bid, 4), 108.0);
        // Sell: 100 * 0.92 = 92.
        assert_eq!(marketable_price(100.0, Side::Ask, 4), 92.0);
    }
}
