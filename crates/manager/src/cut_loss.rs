//! Cut-loss and trailing decisions over unrealized R.
//!
//! Pure functions: callers supply R (from [`autotrade_core::compute_unrealized_r`])
//! and act on the returned actions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use autotrade_core::{
    compute_unrealized_r, normalize_ticker, round_to_tick, InvalidR, Side, Trade, TradeId,
    TradeStatus, UnrealizedR,
};

use crate::canonical::CanonicalSelection;

/// What the cut-loss rule needs to know about a trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeView {
    pub trade_id: TradeId,
    pub ticker: String,
    pub status: TradeStatus,
    /// `None` when risk is unknown.
    pub unrealized_r: Option<Decimal>,
}

impl TradeView {
    #[must_use]
    pub fn of(trade: &Trade, unrealized_r: Option<Decimal>) -> Self {
        Self {
            trade_id: trade.id,
            ticker: trade.ticker.clone(),
            status: trade.status,
            unrealized_r,
        }
    }
}

/// Unrealized R of a trade at `current_price`, measured against its initial stop.
///
/// # Errors
/// The reason R cannot be computed.
pub fn trade_unrealized_r(
    trade: &Trade,
    current_price: Option<Decimal>,
    clamp_abs: Decimal,
) -> Result<UnrealizedR, InvalidR> {
    compute_unrealized_r(
        Some(trade.side),
        trade.entry_price,
        trade.risk_stop(),
        current_price,
        Some(clamp_abs),
    )
}

/// Flatten the position behind `trade_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutLossAction {
    pub trade_id: TradeId,
    pub ticker: String,
    pub r: Decimal,
}

/// Fires when an OPEN trade's R is at or below `threshold_r`.
/// Unknown R never fires.
#[must_use]
pub fn decide_cut_loss_action(
    enabled: bool,
    threshold_r: Decimal,
    trade: &TradeView,
) -> Option<CutLossAction> {
    if !enabled || trade.status != TradeStatus::Open {
        return None;
    }
    let r = trade.unrealized_r?;
    if r > threshold_r {
        return None;
    }
    info!(trade_id = trade.trade_id, ticker = %trade.ticker, %r, %threshold_r, "cut-loss triggered");
    Some(CutLossAction {
        trade_id: trade.trade_id,
        ticker: normalize_ticker(&trade.ticker),
        r,
    })
}

/// Cut-loss actions for canonical trades only; duplicates never act.
#[must_use]
pub fn plan_canonical_cut_loss_actions(
    enabled: bool,
    threshold_r: Decimal,
    selections: &[CanonicalSelection],
    views: &HashMap<TradeId, TradeView>,
) -> Vec<CutLossAction> {
    selections
        .iter()
        .filter_map(|selection| {
            let view = views.get(&selection.canonical_id)?;
            decide_cut_loss_action(enabled, threshold_r, view)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingPolicy {
    pub enabled: bool,
    /// R at which trailing starts.
    pub trigger_r: Decimal,
    /// Distance behind price, in R.
    pub distance_r: Decimal,
}

/// Tighten the stop of `trade_id` to `new_stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailAction {
    pub trade_id: TradeId,
    pub ticker: String,
    pub current_stop: Option<Decimal>,
    pub new_stop: Decimal,
    pub r: Decimal,
}

/// Proposes a trailed stop once R reaches the trigger.
///
/// The stop trails `distance_r` risk units behind `current_price`, never
/// closer than one tick to entry, and is only emitted when it improves the
/// current stop by at least one tick.
#[must_use]
pub fn decide_trailing_action(
    policy: &TrailingPolicy,
    trade: &Trade,
    unrealized_r: Decimal,
    current_price: Decimal,
    tick: Decimal,
) -> Option<TrailAction> {
    if !policy.enabled || trade.status != TradeStatus::Open || unrealized_r < policy.trigger_r {
        return None;
    }
    let entry = trade.entry_price?;
    let risk = trade.risk_per_share()?;
    if tick <= Decimal::ZERO || policy.distance_r < Decimal::ZERO {
        return None;
    }

    let sign = trade.side.sign();
    let proposed = round_to_tick(current_price - policy.distance_r * risk * sign, tick).ok()?;
    let new_stop = match trade.side {
        Side::Long => proposed.min(entry - tick),
        Side::Short => proposed.max(entry + tick),
    };
    if new_stop <= Decimal::ZERO {
        return None;
    }

    let improves = match trade.stop_price {
        Some(current) => (new_stop - current) * sign >= tick,
        None => true,
    };
    if !improves {
        debug!(trade_id = trade.id, %new_stop, "trail would not improve stop");
        return None;
    }

    Some(TrailAction {
        trade_id: trade.id,
        ticker: trade.normalized_ticker(),
        current_stop: trade.stop_price,
        new_stop,
        r: unrealized_r,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn view(status: TradeStatus, r: Option<Decimal>) -> TradeView {
        TradeView {
            trade_id: 7,
            ticker: " aapl ".to_string(),
            status,
            unrealized_r: r,
        }
    }

    #[test]
    fn cut_loss_threshold() {
        let action = decide_cut_loss_action(true, dec!(-1), &view(TradeStatus::Open, Some(dec!(-1.5))));
        assert_eq!(
            action,
            Some(CutLossAction {
                trade_id: 7,
                ticker: "AAPL".to_string(),
                r: dec!(-1.5)
            })
        );
        assert!(decide_cut_loss_action(true, dec!(-1), &view(TradeStatus::Open, Some(dec!(-0.5)))).is_none());
        assert!(decide_cut_loss_action(true, dec!(-1), &view(TradeStatus::Open, Some(dec!(-1)))).is_some());
    }

    #[test]
    fn cut_loss_ignores_disabled_closed_and_unknown() {
        assert!(decide_cut_loss_action(false, dec!(-1), &view(TradeStatus::Open, Some(dec!(-3)))).is_none());
        assert!(decide_cut_loss_action(true, dec!(-1), &view(TradeStatus::Partial, Some(dec!(-3)))).is_none());
        assert!(decide_cut_loss_action(true, dec!(-1), &view(TradeStatus::Open, None)).is_none());
    }

    #[test]
    fn trade_r_uses_initial_stop_and_clamps() {
        let mut trade = Trade::new(1, "AAPL", Side::Long, Utc::now()).with_prices(dec!(100), dec!(98));
        trade.stop_price = Some(dec!(99.5));
        let r = trade_unrealized_r(&trade, Some(dec!(97)), dec!(20)).unwrap();
        assert_eq!(r.value, dec!(-1.5));
        let r = trade_unrealized_r(&trade, Some(dec!(200)), dec!(20)).unwrap();
        assert!(r.clamped);
        assert_eq!(r.value, dec!(20));
        assert_eq!(trade_unrealized_r(&trade, None, dec!(20)), Err(InvalidR::MissingPrice));
    }

    #[test]
    fn duplicates_never_act() {
        let selections = vec![CanonicalSelection {
            ticker: "AAPL".to_string(),
            canonical_id: 1,
            duplicate_ids: vec![2],
        }];
        let mut views = HashMap::new();
        views.insert(1, TradeView { trade_id: 1, ..view(TradeStatus::Open, Some(dec!(-2))) });
        views.insert(2, TradeView { trade_id: 2, ..view(TradeStatus::Open, Some(dec!(-2))) });

        let actions = plan_canonical_cut_loss_actions(true, dec!(-1), &selections, &views);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].trade_id, 1);
    }

    fn policy() -> TrailingPolicy {
        TrailingPolicy {
            enabled: true,
            trigger_r: dec!(1),
            distance_r: dec!(1),
        }
    }

    #[test]
    fn trails_long_and_caps_at_breakeven() {
        let trade = Trade::new(1, "AAPL", Side::Long, Utc::now()).with_prices(dec!(100), dec!(98));
        // price 103: stop 101 would pass entry, capped at 99.99
        let action = decide_trailing_action(&policy(), &trade, dec!(1.5), dec!(103), dec!(0.01)).unwrap();
        assert_eq!(action.new_stop, dec!(99.99));

        assert!(decide_trailing_action(&policy(), &trade, dec!(0.5), dec!(101), dec!(0.01)).is_none());
    }

    #[test]
    fn trails_short_mirrored() {
        let mut trade = Trade::new(2, "TSLA", Side::Short, Utc::now()).with_prices(dec!(200), dec!(210));
        // 190 would pass entry, capped at 200.01
        let action = decide_trailing_action(&policy(), &trade, dec!(2), dec!(180), dec!(0.01)).unwrap();
        assert_eq!(action.new_stop, dec!(200.01));
        assert_eq!(action.current_stop, Some(dec!(210)));

        trade.stop_price = Some(dec!(200.01));
        assert!(decide_trailing_action(&policy(), &trade, dec!(2), dec!(180), dec!(0.01)).is_none());
    }

    #[test]
    fn trails_below_breakeven_cap() {
        let trade = Trade::new(4, "AAPL", Side::Long, Utc::now()).with_prices(dec!(100), dec!(90));
        let action = decide_trailing_action(&policy(), &trade, dec!(1.2), dec!(112), dec!(0.01)).unwrap();
        assert_eq!(action.new_stop, dec!(99.99));
        let action = decide_trailing_action(&policy(), &trade, dec!(1), dec!(105), dec!(0.01)).unwrap();
        assert_eq!(action.new_stop, dec!(95));
    }

    #[test]
    fn trail_requires_a_full_tick_of_improvement() {
        let mut trade = Trade::new(3, "AAPL", Side::Long, Utc::now())
            .with_prices(dec!(100), dec!(90));
        trade.stop_price = Some(dec!(99.995));
        assert!(decide_trailing_action(&policy(), &trade, dec!(2), dec!(130), dec!(0.01)).is_none());
    }

    #[test]
    fn planning_only_considers_canonical_trades() {
        let selections = vec![CanonicalSelection {
            ticker: "AAPL".to_string(),
            canonical_id: 7,
            duplicate_ids: vec![8],
        }];
        let mut views = HashMap::new();
        views.insert(7, view(TradeStatus::Open, Some(dec!(-2))));
        let mut duplicate = view(TradeStatus::Open, Some(dec!(-3)));
        duplicate.trade_id = 8;
        views.insert(8, duplicate);

        let actions = plan_canonical_cut_loss_actions(true, dec!(-1), &selections, &views);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].trade_id, 7);
        assert!(plan_canonical_cut_loss_actions(false, dec!(-1), &selections, &views).is_empty());
    }
}
