//! Funding-differential arithmetic: pair scoring, long/short routing, lot
//! sizing and the pre-trade PnL estimate.
//!
//! All rates and fees are percentages unless a function says otherwise.

use rust_decimal::Decimal;

use crate::exchanges::VenueName;
use crate::models::PositionSide;

/// Funding-rate differential between two venues, net of a round trip of
/// taker fees on both (each leg opens and closes once, hence the factor 2).
///
/// Sign cases follow the settlement mechanics: with both rates negative the
/// magnitudes partially cancel; with opposite signs they add. A rate of
/// exactly zero matches no case and yields a raw delta of zero, so fees
/// alone push the pair below any sane threshold.
pub fn calculate_delta(
    funding_1: Decimal,
    funding_2: Decimal,
    fee_1: Decimal,
    fee_2: Decimal,
) -> Decimal {
    let zero = Decimal::ZERO;
    let delta = if funding_1 < zero && funding_2 < zero {
        (funding_1.abs() - funding_2.abs()).abs()
    } else if (funding_1 > zero && funding_2 < zero) || (funding_1 < zero && funding_2 > zero) {
        (funding_1 - funding_2).abs()
    } else if funding_1 > zero && funding_2 > zero {
        (funding_1 - funding_2).abs()
    } else {
        zero
    };
    delta - (fee_1 + fee_2) * Decimal::TWO
}

/// Which venue takes which side: the venue with the higher funding rate is
/// shorted (it receives the funding payment), the other goes long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeRoutes {
    pub long: VenueName,
    pub short: VenueName,
}

impl ExchangeRoutes {
    pub fn side_for(&self, venue: VenueName) -> PositionSide {
        if venue == self.short {
            PositionSide::Short
        } else {
            PositionSide::Long
        }
    }
}

pub fn route_sides(
    ex_1: VenueName,
    funding_1: Decimal,
    ex_2: VenueName,
    funding_2: Decimal,
) -> ExchangeRoutes {
    if funding_1 > funding_2 {
        ExchangeRoutes {
            long: ex_2,
            short: ex_1,
        }
    } else {
        ExchangeRoutes {
            long: ex_1,
            short: ex_2,
        }
    }
}

/// Round `value` down to a whole multiple of `step`.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step.is_zero() {
        return value;
    }
    (value / step).floor() * step
}

/// Base quantity both venues can execute identically for `usdt_amount` of
/// notional: quantize both venues' raw quantities down to the coarser lot
/// step and take the minimum. `None` when either raw quantity is already
/// below its venue's minimum lot.
pub fn crypto_amount_for_usdt(
    price_1: Decimal,
    price_2: Decimal,
    usdt_amount: Decimal,
    multiplier_1: Decimal,
    multiplier_2: Decimal,
) -> Option<Decimal> {
    let qty_1 = usdt_amount / price_1;
    let qty_2 = usdt_amount / price_2;
    if qty_1 < multiplier_1 || qty_2 < multiplier_2 {
        return None;
    }
    let step = multiplier_1.max(multiplier_2);
    Some(floor_to_step(qty_1, step).min(floor_to_step(qty_2, step)))
}

/// Leverage actually used for the pair: the configured value when both
/// venues allow it, otherwise the smaller bracket cap floored to the
/// coarser leverage step.
pub fn used_leverage(
    configured: Decimal,
    bracket_1: (Decimal, Decimal),
    bracket_2: (Decimal, Decimal),
) -> Decimal {
    let (max_1, step_1) = bracket_1;
    let (max_2, step_2) = bracket_2;
    if configured < max_1 && configured < max_2 {
        configured
    } else {
        floor_to_step(max_1.min(max_2), step_1.max(step_2))
    }
}

/// Estimated net PnL of the whole arbitrage as a percent of the margin
/// committed. Funding rates and fees here are fractions (already divided
/// by 100); notionals are leveraged position values.
///
/// Returns `None` when one leg's funding fee is exactly zero and the
/// estimate is undefined.
#[allow(clippy::too_many_arguments)]
pub fn estimate_pnl_percent(
    funding_1: Decimal,
    funding_2: Decimal,
    notional_1: Decimal,
    notional_2: Decimal,
    fee_1: Decimal,
    fee_2: Decimal,
    qty: Decimal,
    price_long: Decimal,
    price_short: Decimal,
    leverage: Decimal,
) -> Option<Decimal> {
    let zero = Decimal::ZERO;
    let ff_1 = funding_1 * notional_1;
    let ff_2 = funding_2 * notional_2;

    let fund_component = if (ff_1 < zero && ff_2 < zero) || (ff_1 > zero && ff_2 > zero) {
        (ff_1.abs() - ff_2.abs()).abs()
    } else if (ff_1 < zero && ff_2 > zero) || (ff_1 > zero && ff_2 < zero) {
        ff_1.abs() + ff_2.abs()
    } else {
        return None;
    };

    let fees_component = Decimal::TWO * (fee_1 * notional_1) + Decimal::TWO * (fee_2 * notional_2);
    let price_component = qty * (price_short - price_long);
    let pnl_usdt = fund_component - fees_component + price_component;
    let margin = (notional_1 + notional_2) / leverage;
    Some(pnl_usdt / margin * Decimal::ONE_HUNDRED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn threshold_drops_thin_spread() {
        // Funding 0.08% vs -0.05%, fees 0.04%/0.04%:
        // |0.08 - (-0.05)| - 2*(0.04+0.04) = 0.13 - 0.16 = -0.03.
        let net = calculate_delta(dec!(0.08), dec!(-0.05), dec!(0.04), dec!(0.04));
        assert_eq!(net, dec!(-0.03));
        assert!(net <= dec!(0.1));
    }

    #[test]
    fn higher_funding_venue_is_shorted() {
        let routes = route_sides(VenueName::Binance, dec!(0.20), VenueName::Bybit, dec!(0.05));
        assert_eq!(routes.short, VenueName::Binance);
        assert_eq!(routes.long, VenueName::Bybit);
        assert_eq!(routes.side_for(VenueName::Binance), PositionSide::Short);
        assert_eq!(routes.side_for(VenueName::Bybit), PositionSide::Long);

        // Equal rates fall through to the second venue short.
        let routes = route_sides(VenueName::Binance, dec!(0.05), VenueName::Bybit, dec!(0.05));
        assert_eq!(routes.short, VenueName::Bybit);
    }

    #[test]
    fn delta_cases_by_sign() {
        // Both negative: magnitudes cancel.
        assert_eq!(
            calculate_delta(dec!(-0.03), dec!(-0.01), Decimal::ZERO, Decimal::ZERO),
            dec!(0.02)
        );
        // Both positive.
        assert_eq!(
            calculate_delta(dec!(0.05), dec!(0.02), Decimal::ZERO, Decimal::ZERO),
            dec!(0.03)
        );
        // Opposite signs: magnitudes add.
        assert_eq!(
            calculate_delta(dec!(0.05), dec!(-0.02), Decimal::ZERO, Decimal::ZERO),
            dec!(0.07)
        );
        // Exactly-zero rate: raw delta zero, only fees remain.
        assert_eq!(
            calculate_delta(Decimal::ZERO, dec!(0.05), dec!(0.04), dec!(0.04)),
            dec!(-0.16)
        );
    }

    #[test]
    fn delta_is_non_increasing_in_fee() {
        let mut last = calculate_delta(dec!(0.2), dec!(-0.1), Decimal::ZERO, Decimal::ZERO);
        for k in 1..10 {
            let fee = Decimal::new(k, 2); // 0.01 .. 0.09
            let net = calculate_delta(dec!(0.2), dec!(-0.1), fee, fee);
            assert!(net < last);
            last = net;
        }
    }

    #[test]
    fn sizing_floors_both_to_coarser_step() {
        let qty = crypto_amount_for_usdt(
            dec!(20000),
            dec!(20010),
            dec!(1000),
            dec!(0.001),
            dec!(0.0001),
        )
        .unwrap();
        assert_eq!(qty, dec!(0.049));
        // Feasibility: a whole multiple of the coarser step.
        assert_eq!(qty % dec!(0.001), Decimal::ZERO);
        assert!(qty >= dec!(0.001));
    }

    #[test]
    fn sizing_rejects_below_minimum_lot() {
        // 1000 / 50000 = 0.02 < multiplier 0.1 on the second venue.
        assert_eq!(
            crypto_amount_for_usdt(dec!(20000), dec!(50000), dec!(1000), dec!(0.001), dec!(0.1)),
            None
        );
    }

    #[test]
    fn leverage_capped_by_smaller_bracket() {
        // Both venues allow the configured leverage.
        assert_eq!(
            used_leverage(dec!(5), (dec!(25), dec!(1)), (dec!(50), dec!(0.5))),
            dec!(5)
        );
        // One bracket below the configured value: min cap floored to the
        // coarser step.
        assert_eq!(
            used_leverage(dec!(20), (dec!(12.8), dec!(0.5)), (dec!(25), dec!(1))),
            dec!(12)
        );
    }

    #[test]
    fn pnl_estimate_matches_hand_computation() {
        // Long at 100, short at 101, qty 1, notionals 1000 each,
        // funding +0.001 / -0.002 (fractions), fees 0.0004 each, leverage 10.
        // fund = |1| + |2| = 3; fees = 2*0.4 + 2*0.4 = 1.6; price = 1.
        // pnl = 3 - 1.6 + 1 = 2.4; margin = 2000/10 = 200; pct = 1.2.
        let pct = estimate_pnl_percent(
            dec!(0.001),
            dec!(-0.002),
            dec!(1000),
            dec!(1000),
            dec!(0.0004),
            dec!(0.0004),
            dec!(1),
            dec!(100),
            dec!(101),
            dec!(10),
        )
        .unwrap();
        assert_eq!(pct, dec!(1.2));
    }

    #[test]
    fn pnl_estimate_undefined_for_zero_funding_fee() {
        assert_eq!(
            estimate_pnl_percent(
                Decimal::ZERO,
                dec!(-0.002),
                dec!(1000),
                dec!(1000),
                dec!(0.0004),
                dec!(0.0004),
                dec!(1),
                dec!(100),
                dec!(101),
                dec!(10),
            ),
            None
        );
    }
}
