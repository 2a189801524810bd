//! Reconciles trades believed closed against the broker's fill feed.
//!
//! Outcomes:
//! - `Voided`: no entry fill in the window, the position never existed
//! - `Reopened`: entry fills but no exit fills, the position is still open
//! - `Finalized`: realized PnL and R from volume-weighted entry/exit prices
//! - `Error`: the fill feed could not be read; retry later, change nothing

use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{info, warn};

use autotrade_broker::{Broker, Fill, OrderSide};
use autotrade_core::{Side, Trade};

use crate::deadline::with_deadline;
use crate::types::CloseReason;

/// Realized result of a closed trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Realized {
    pub pnl: Decimal,
    pub r: Decimal,
    pub entry_vwap: Decimal,
    pub exit_vwap: Decimal,
    pub matched_qty: Decimal,
    pub close_reason: CloseReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    Voided,
    Reopened { entry_qty: Decimal },
    Finalized(Realized),
    Error { message: String },
}

impl FinalizeOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voided => "voided",
            Self::Reopened { .. } => "reopened",
            Self::Finalized(_) => "finalized",
            Self::Error { .. } => "error",
        }
    }
}

fn vwap<'a>(legs: impl IntoIterator<Item = (&'a Fill, Decimal)>) -> Option<(Decimal, Decimal)> {
    let (qty, notional) = legs
        .into_iter()
        .fold((Decimal::ZERO, Decimal::ZERO), |(qty, notional), (fill, leg_qty)| {
            (qty + leg_qty, notional + leg_qty * fill.price)
        });
    if qty <= Decimal::ZERO {
        return None;
    }
    Some((notional / qty, qty))
}

fn infer_close_reason(trade: &Trade, exits: &[(&Fill, Decimal)]) -> CloseReason {
    let known = [
        (&trade.stop_order_id, CloseReason::StopLoss),
        (&trade.take_profit_order_id, CloseReason::TakeProfit),
        (&trade.close_order_id, CloseReason::CutLoss),
        (&trade.broker_order_id, CloseReason::BracketExit),
    ];
    exits
        .iter()
        .find_map(|(fill, _)| {
            known.iter().find_map(|(id, reason)| {
                (id.as_deref() == Some(fill.order_id.as_str())).then_some(*reason)
            })
        })
        .unwrap_or(CloseReason::ExitFill)
}

/// Entry and exit legs of one round trip, in fill order.
struct RoundTrip<'a> {
    entries: Vec<(&'a Fill, Decimal)>,
    exits: Vec<(&'a Fill, Decimal)>,
}

/// Walks the symbol's fills chronologically from the first entry fill until
/// the position is flat again. Exits before the first entry belong to an
/// earlier position; entries after the position went flat belong to a later
/// one. When the trade's entry order id appears in the feed only that
/// order's fills count as entries.
fn match_round_trip<'a>(trade: &Trade, fills: &'a [Fill]) -> RoundTrip<'a> {
    let (entry_side, exit_side) = match trade.side {
        Side::Long => (OrderSide::Buy, OrderSide::Sell),
        Side::Short => (OrderSide::Sell, OrderSide::Buy),
    };
    let symbol = trade.normalized_ticker();
    let mut ordered: Vec<&Fill> = fills
        .iter()
        .filter(|f| f.symbol.eq_ignore_ascii_case(&symbol) && f.qty > Decimal::ZERO)
        .collect();
    ordered.sort_by_key(|f| f.transaction_time);

    let own_entry = trade.broker_order_id.as_deref().filter(|id| {
        ordered
            .iter()
            .any(|f| f.side == entry_side && f.order_id == *id)
    });

    let mut trip = RoundTrip {
        entries: Vec::new(),
        exits: Vec::new(),
    };
    let mut open = Decimal::ZERO;
    for fill in ordered {
        if fill.side == entry_side {
            if own_entry.is_some_and(|id| fill.order_id != id) {
                continue;
            }
            if !trip.exits.is_empty() && open <= Decimal::ZERO {
                break;
            }
            open += fill.qty;
            trip.entries.push((fill, fill.qty));
        } else if fill.side == exit_side {
            if open <= Decimal::ZERO {
                if trip.exits.is_empty() {
                    continue;
                }
                break;
            }
            let matched = fill.qty.min(open);
            open -= matched;
            trip.exits.push((fill, matched));
        }
    }
    trip
}

/// Classifies a trade from the fills of its symbol within the window.
///
/// Entry fills are buys for LONG and sells for SHORT; exit fills the
/// opposite. Only the first round trip counts (see [`match_round_trip`]).
/// PnL is `(exit_vwap - entry_vwap) * matched_qty`, negated for SHORT. R
/// divides PnL by `risk_per_share * matched_qty`, or is 0 when the trade has
/// no usable risk.
#[must_use]
pub fn compute_outcome(trade: &Trade, fills: &[Fill]) -> FinalizeOutcome {
    let trip = match_round_trip(trade, fills);

    let Some((entry_vwap, entry_qty)) = vwap(trip.entries.iter().copied()) else {
        return FinalizeOutcome::Voided;
    };
    let Some((exit_vwap, matched_qty)) = vwap(trip.exits.iter().copied()) else {
        return FinalizeOutcome::Reopened { entry_qty };
    };

    let pnl = ((exit_vwap - entry_vwap) * matched_qty * trade.side.sign())
        .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    let r = trade
        .risk_per_share()
        .map(|risk| {
            (pnl / (risk * matched_qty))
                .round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
                .normalize()
        })
        .unwrap_or(Decimal::ZERO);

    FinalizeOutcome::Finalized(Realized {
        pnl,
        r,
        entry_vwap: entry_vwap.round_dp(6).normalize(),
        exit_vwap: exit_vwap.round_dp(6).normalize(),
        matched_qty,
        close_reason: infer_close_reason(trade, &trip.exits),
    })
}

pub struct CloseFinalizer {
    broker: Arc<dyn Broker>,
    timeout: StdDuration,
    pad: Duration,
}

impl std::fmt::Debug for CloseFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseFinalizer")
            .field("timeout", &self.timeout)
            .field("pad", &self.pad)
            .finish_non_exhaustive()
    }
}

impl CloseFinalizer {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, timeout: StdDuration, pad: Duration) -> Self {
        Self {
            broker,
            timeout,
            pad,
        }
    }

    /// Fill window: from the trade's open time to its close time (or `now`),
    /// padded on both sides.
    #[must_use]
    pub fn window(&self, trade: &Trade, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = trade.opened_or_created() - self.pad;
        let end = trade.closed_at.unwrap_or(now).max(start) + self.pad;
        (start, end)
    }

    /// Fetches the trade's fills and classifies the close. Never mutates the trade.
    pub async fn finalize_trade_close(&self, trade: &Trade, now: DateTime<Utc>) -> FinalizeOutcome {
        let (after, until) = self.window(trade, now);
        let symbol = trade.normalized_ticker();
        let fills = match with_deadline(
            self.timeout,
            "list_fills",
            self.broker.list_fills(&symbol, after, until),
        )
        .await
        {
            Ok(fills) => fills,
            Err(e) => {
                warn!(trade_id = trade.id, ticker = %symbol, error = %e, "fill feed unavailable");
                return FinalizeOutcome::Error {
                    message: e.to_string(),
                };
            }
        };

        let outcome = compute_outcome(trade, &fills);
        match &outcome {
            FinalizeOutcome::Finalized(realized) => info!(
                trade_id = trade.id,
                ticker = %symbol,
                pnl = %realized.pnl,
                r = %realized.r,
                reason = %realized.close_reason,
                "trade finalized"
            ),
            other => info!(trade_id = trade.id, ticker = %symbol, outcome = other.as_str(), fills = fills.len(), "trade close reconciled"),
        }
        outcome
    }
}
