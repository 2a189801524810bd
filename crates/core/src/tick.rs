//! Price increment (tick) normalization and stop/limit geometry checks.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TickConfig;
use crate::trade::{stop_is_protective, Side};

/// Tick normalization failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TickError {
    #[error("invalid_tick")]
    InvalidTick,
    #[error("non_positive_price")]
    NonPositivePrice,
    /// Input stop is already on the wrong side of entry.
    #[error("stop_wrong_side")]
    StopWrongSide,
    /// Rounding to tick would put the stop on or past entry.
    #[error("rounding_inverted")]
    RoundingInverted,
    #[error("invalid_reward_risk")]
    InvalidRewardRisk,
    /// Bracket offsets fall below the configured minimum.
    #[error("bracket_too_tight")]
    BracketTooTight,
}

impl TickError {
    /// Stable reason code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTick => "invalid_tick",
            Self::NonPositivePrice => "non_positive_price",
            Self::StopWrongSide => "stop_wrong_side",
            Self::RoundingInverted => "rounding_inverted",
            Self::InvalidRewardRisk => "invalid_reward_risk",
            Self::BracketTooTight => "bracket_too_tight",
        }
    }
}

/// One row of the tick table: prices strictly below `below` use `tick`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickBand {
    pub below: Decimal,
    pub tick: Decimal,
}

/// Legal increment for a price, from the configured table.
#[must_use]
pub fn tick_for_price(price: Decimal, config: &TickConfig) -> Decimal {
    let mut bands: Vec<&TickBand> = config.bands.iter().collect();
    bands.sort_by(|a, b| a.below.cmp(&b.below));
    bands
        .into_iter()
        .find(|band| price < band.below)
        .map_or(config.default_tick, |band| band.tick)
}

/// Rounds to the nearest multiple of `tick` (half away from zero).
///
/// # Errors
/// `InvalidTick` when the tick is not positive.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Result<Decimal, TickError> {
    if tick <= Decimal::ZERO {
        return Err(TickError::InvalidTick);
    }
    let steps = (price / tick).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    Ok((steps * tick).normalize())
}

/// Rounds a stop to tick and checks it stays strictly protective.
///
/// An input that is already on the wrong side fails rather than being fixed.
///
/// # Errors
/// See [`TickError`].
pub fn normalize_stop_price(
    side: Side,
    entry_price: Decimal,
    stop_price: Decimal,
    tick: Decimal,
) -> Result<Decimal, TickError> {
    if entry_price <= Decimal::ZERO || stop_price <= Decimal::ZERO {
        return Err(TickError::NonPositivePrice);
    }
    if !stop_is_protective(side, entry_price, stop_price) {
        return Err(TickError::StopWrongSide);
    }
    let rounded = round_to_tick(stop_price, tick)?;
    if rounded <= Decimal::ZERO || !stop_is_protective(side, entry_price, rounded) {
        return Err(TickError::RoundingInverted);
    }
    Ok(rounded)
}

/// Rounds a limit price to tick.
///
/// # Errors
/// See [`TickError`].
pub fn normalize_limit_price(price: Decimal, tick: Decimal) -> Result<Decimal, TickError> {
    if price <= Decimal::ZERO {
        return Err(TickError::NonPositivePrice);
    }
    let rounded = round_to_tick(price, tick)?;
    if rounded <= Decimal::ZERO {
        return Err(TickError::NonPositivePrice);
    }
    Ok(rounded)
}

/// Inputs for [`compute_bracket`].
#[derive(Debug, Clone, Copy)]
pub struct BracketRequest {
    pub side: Side,
    pub decision_price: Decimal,
    /// Absolute distance from decision price to stop.
    pub stop_distance: Decimal,
    /// Target distance as a multiple of the stop distance.
    pub reward_risk: Decimal,
    pub tick: Decimal,
    /// Minimum absolute offset of both legs from the decision price.
    pub min_offset: Decimal,
}

/// Tick-legal stop/target pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bracket {
    pub stop_price: Decimal,
    pub target_price: Decimal,
    pub risk_per_share: Decimal,
}

/// Derives a stop/target pair, rejecting degenerate near-zero brackets
/// both before and after rounding.
///
/// # Errors
/// See [`TickError`].
pub fn compute_bracket(req: BracketRequest) -> Result<Bracket, TickError> {
    if req.decision_price <= Decimal::ZERO {
        return Err(TickError::NonPositivePrice);
    }
    if req.reward_risk <= Decimal::ZERO {
        return Err(TickError::InvalidRewardRisk);
    }
    if req.stop_distance <= Decimal::ZERO || req.stop_distance < req.min_offset {
        return Err(TickError::BracketTooTight);
    }

    let sign = req.side.sign();
    let raw_stop = req.decision_price - req.stop_distance * sign;
    let raw_target = req.decision_price + req.stop_distance * req.reward_risk * sign;
    if raw_stop <= Decimal::ZERO {
        return Err(TickError::NonPositivePrice);
    }

    let stop_price = normalize_stop_price(req.side, req.decision_price, raw_stop, req.tick)?;
    let target_price = normalize_limit_price(raw_target, req.tick)?;

    let stop_offset = (req.decision_price - stop_price).abs();
    let target_offset = (target_price - req.decision_price).abs();
    if stop_offset < req.min_offset || target_offset < req.min_offset {
        return Err(TickError::BracketTooTight);
    }
    // target must sit on the profitable side after rounding
    if (target_price - req.decision_price) * sign <= Decimal::ZERO {
        return Err(TickError::BracketTooTight);
    }

    Ok(Bracket {
        stop_price,
        target_price,
        risk_per_share: stop_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn tick_table_uses_finer_increment_below_a_dollar() {
        let config = TickConfig::default();
        assert_eq!(tick_for_price(dec!(0.5123), &config), dec!(0.0001));
        assert_eq!(tick_for_price(dec!(1), &config), dec!(0.01));
        assert_eq!(tick_for_price(dec!(250), &config), dec!(0.01));
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_to_tick(dec!(10.005), dec!(0.01)).unwrap(), dec!(10.01));
        assert_eq!(round_to_tick(dec!(10.004), dec!(0.01)).unwrap(), dec!(10));
        assert_eq!(round_to_tick(dec!(10), dec!(0)), Err(TickError::InvalidTick));
    }

    #[test]
    fn stop_normalization_keeps_protective_side() {
        let stop = normalize_stop_price(Side::Long, dec!(100), dec!(98.004), dec!(0.01)).unwrap();
        assert_eq!(stop, dec!(98));
        let stop = normalize_stop_price(Side::Short, dec!(100), dec!(101.236), dec!(0.01)).unwrap();
        assert_eq!(stop, dec!(101.24));
    }

    #[test]
    fn stop_on_wrong_side_fails_instead_of_fixing() {
        assert_eq!(
            normalize_stop_price(Side::Long, dec!(100), dec!(100.5), dec!(0.01)),
            Err(TickError::StopWrongSide)
        );
        assert_eq!(
            normalize_stop_price(Side::Short, dec!(100), dec!(99), dec!(0.01)),
            Err(TickError::StopWrongSide)
        );
    }

    #[test]
    fn rounding_onto_entry_is_rejected() {
        assert_eq!(
            normalize_stop_price(Side::Long, dec!(100), dec!(99.996), dec!(0.01)),
            Err(TickError::RoundingInverted)
        );
        assert_eq!(
            normalize_stop_price(Side::Short, dec!(100), dec!(100.004), dec!(0.01)),
            Err(TickError::RoundingInverted)
        );
    }

    #[test]
    fn bracket_long_two_to_one() {
        let bracket = compute_bracket(BracketRequest {
            side: Side::Long,
            decision_price: dec!(50),
            stop_distance: dec!(1.003),
            reward_risk: dec!(2),
            tick: dec!(0.01),
            min_offset: dec!(0.05),
        })
        .unwrap();
        assert_eq!(bracket.stop_price, dec!(49));
        assert_eq!(bracket.target_price, dec!(52.01));
        assert_eq!(bracket.risk_per_share, dec!(1));
    }

    #[test]
    fn bracket_short_mirrors_long() {
        let bracket = compute_bracket(BracketRequest {
            side: Side::Short,
            decision_price: dec!(20),
            stop_distance: dec!(0.5),
            reward_risk: dec!(3),
            tick: dec!(0.01),
            min_offset: dec!(0.05),
        })
        .unwrap();
        assert_eq!(bracket.stop_price, dec!(20.5));
        assert_eq!(bracket.target_price, dec!(18.5));
    }

    #[test]
    fn degenerate_bracket_rejected_before_and_after_rounding() {
        let base = BracketRequest {
            side: Side::Long,
            decision_price: dec!(10),
            stop_distance: dec!(0.01),
            reward_risk: dec!(2),
            tick: dec!(0.01),
            min_offset: dec!(0.05),
        };
        assert_eq!(compute_bracket(base), Err(TickError::BracketTooTight));

        // passes the raw check but rounds below the minimum offset
        let rounded_away = BracketRequest {
            stop_distance: dec!(0.054),
            min_offset: dec!(0.054),
            ..base
        };
        assert_eq!(compute_bracket(rounded_away), Err(TickError::BracketTooTight));
    }
}
