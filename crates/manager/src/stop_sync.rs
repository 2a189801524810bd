//! Protective stop maintenance at the broker.
//!
//! Replacing a stop is always cancel-then-create: every stop found for the
//! trade is cancelled before the new one is submitted, and a failed cancel
//! aborts the update with the old stop still live. A stop is never loosened.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use autotrade_broker::{Broker, BrokerError, Order, OrderRequest, OrderSide, Position, TimeInForce};
use autotrade_core::{normalize_stop_price, tick_for_price, Side, TickConfig, TickError, Trade};

use crate::deadline::with_deadline;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopSyncError {
    #[error("new stop does not tighten the current stop")]
    NotTightening,
    #[error("stop price must be positive")]
    InvalidStopPrice,
    #[error("trade has no stop price")]
    MissingStopPrice,
    #[error("quantity unknown locally and at the broker")]
    QuantityUnavailable,
    #[error("no broker position for {0}")]
    NoPosition(String),
    #[error("tick normalization failed: {0}")]
    Tick(#[from] TickError),
    #[error("cancel of {order_id} failed: {message}")]
    CancelFailed { order_id: String, message: String },
    #[error("stop submit failed after cancelling {cancelled:?}: {message}")]
    SubmitFailed {
        cancelled: Vec<String>,
        message: String,
    },
    #[error("broker error: {0}")]
    Broker(String),
}

impl StopSyncError {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotTightening => "not_tightening",
            Self::InvalidStopPrice => "invalid_stop_price",
            Self::MissingStopPrice => "missing_stop_price",
            Self::QuantityUnavailable => "quantity_unavailable",
            Self::NoPosition(_) => "no_position",
            Self::Tick(e) => e.as_str(),
            Self::CancelFailed { .. } => "cancel_failed",
            Self::SubmitFailed { .. } => "submit_failed",
            Self::Broker(_) => "broker_error",
        }
    }
}

impl From<BrokerError> for StopSyncError {
    fn from(err: BrokerError) -> Self {
        Self::Broker(err.to_string())
    }
}

/// Result of a successful stop replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopSyncResult {
    pub new_stop_order_id: String,
    pub cancelled_order_ids: Vec<String>,
    pub stop_price: Decimal,
    pub requested_price: Decimal,
    pub quantity: Decimal,
    /// Present when tick rounding moved the price.
    pub quantization_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescueResult {
    pub stop_order_id: String,
    pub stop_price: Decimal,
    pub quantity: Decimal,
}

/// Side of the order that exits a position on `side`.
#[must_use]
pub fn exit_side(side: Side) -> OrderSide {
    match side {
        Side::Long => OrderSide::Sell,
        Side::Short => OrderSide::Buy,
    }
}

/// True when `next` is strictly more protective than `current`.
#[must_use]
pub fn tightens(side: Side, current: Decimal, next: Decimal) -> bool {
    match side {
        Side::Long => next > current,
        Side::Short => next < current,
    }
}

/// First live protective stop for `symbol` among `orders`, legs included.
#[must_use]
pub fn active_stop_for<'a>(symbol: &str, exit: OrderSide, orders: &'a [Order]) -> Option<&'a Order> {
    orders
        .iter()
        .flat_map(|o| std::iter::once(o).chain(o.legs.iter()))
        .find(|o| {
            o.symbol.eq_ignore_ascii_case(symbol)
                && o.is_stop()
                && o.side == exit
                && o.status.is_active_stop()
        })
}

pub struct StopSynchronizer {
    broker: Arc<dyn Broker>,
    ticks: TickConfig,
    timeout: Duration,
}

impl std::fmt::Debug for StopSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSynchronizer")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl StopSynchronizer {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, ticks: TickConfig, timeout: Duration) -> Self {
        Self {
            broker,
            ticks,
            timeout,
        }
    }

    async fn position(&self, symbol: &str) -> Result<Option<Position>, StopSyncError> {
        Ok(with_deadline(self.timeout, "get_position", self.broker.get_position(symbol)).await?)
    }

    /// Replaces the trade's protective stop with a tighter one.
    ///
    /// # Errors
    /// `NotTightening` (with no broker calls) when `next_stop` would not move
    /// the stop favorably; otherwise the first failure, before any new order
    /// is created unless the error is `SubmitFailed`.
    pub async fn sync_stop_for_trade(
        &self,
        trade: &Trade,
        next_stop: Decimal,
    ) -> Result<StopSyncResult, StopSyncError> {
        if next_stop <= Decimal::ZERO {
            return Err(StopSyncError::InvalidStopPrice);
        }
        if let Some(current) = trade.stop_price {
            if !tightens(trade.side, current, next_stop) {
                debug!(trade_id = trade.id, %current, %next_stop, "stop update rejected: not tightening");
                return Err(StopSyncError::NotTightening);
            }
        }

        let symbol = trade.normalized_ticker();
        let local_qty = trade.quantity.filter(|q| *q > Decimal::ZERO);
        let position = if local_qty.is_none() || trade.entry_price.is_none() {
            self.position(&symbol).await?
        } else {
            None
        };

        let quantity = local_qty
            .or_else(|| position.as_ref().map(|p| p.qty.abs()))
            .filter(|q| *q > Decimal::ZERO)
            .ok_or(StopSyncError::QuantityUnavailable)?;
        let entry = trade
            .entry_price
            .or_else(|| position.as_ref().map(|p| p.avg_entry_price))
            .ok_or(StopSyncError::Tick(TickError::NonPositivePrice))?;

        let tick = tick_for_price(next_stop, &self.ticks);
        let stop_price = normalize_stop_price(trade.side, entry, next_stop, tick)?;
        if let Some(current) = trade.stop_price {
            if !tightens(trade.side, current, stop_price) {
                return Err(StopSyncError::NotTightening);
            }
        }
        let quantization_note = (stop_price != next_stop.normalize()).then(|| {
            format!("requested {next_stop}, submitted {stop_price} (tick {tick})")
        });

        let stop_ids = self.discover_stop_ids(trade).await?;

        let mut cancelled = Vec::with_capacity(stop_ids.len());
        for order_id in stop_ids {
            match with_deadline(self.timeout, "cancel_order", self.broker.cancel_order(&order_id)).await {
                Ok(()) => cancelled.push(order_id),
                Err(e) if e.is_not_found() => {
                    debug!(trade_id = trade.id, %order_id, "stop already gone");
                    cancelled.push(order_id);
                }
                Err(e) => {
                    warn!(trade_id = trade.id, %order_id, error = %e, "stop cancel failed, keeping existing stop");
                    return Err(StopSyncError::CancelFailed {
                        order_id,
                        message: e.to_string(),
                    });
                }
            }
        }

        let request = OrderRequest::stop(
            &symbol,
            quantity,
            exit_side(trade.side),
            stop_price,
            TimeInForce::Day,
        )
        .with_client_order_id(client_order_id("stop", trade));
        let order = match with_deadline(self.timeout, "submit_order", self.broker.submit_order(&request)).await {
            Ok(order) => order,
            Err(e) => {
                warn!(trade_id = trade.id, ?cancelled, error = %e, "replacement stop submit failed");
                return Err(StopSyncError::SubmitFailed {
                    cancelled,
                    message: e.to_string(),
                });
            }
        };

        info!(
            trade_id = trade.id,
            ticker = %symbol,
            stop = %stop_price,
            qty = %quantity,
            order_id = %order.id,
            cancelled = cancelled.len(),
            "protective stop replaced"
        );
        if let Some(note) = &quantization_note {
            info!(trade_id = trade.id, "stop quantized: {note}");
        }

        Ok(StopSyncResult {
            new_stop_order_id: order.id,
            cancelled_order_ids: cancelled,
            stop_price,
            requested_price: next_stop,
            quantity,
            quantization_note,
        })
    }

    /// Live stop orders belonging to the trade: bracket legs of the parent
    /// order plus the standalone stop. Missing or finished orders are skipped.
    async fn discover_stop_ids(&self, trade: &Trade) -> Result<Vec<String>, StopSyncError> {
        let mut ids: Vec<String> = Vec::new();

        if let Some(parent_id) = &trade.broker_order_id {
            match with_deadline(self.timeout, "get_order", self.broker.get_order(parent_id)).await {
                Ok(parent) => ids.extend(
                    parent
                        .stop_legs()
                        .filter(|leg| !leg.status.is_terminal())
                        .map(|leg| leg.id.clone()),
                ),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(stop_id) = &trade.stop_order_id {
            if !ids.contains(stop_id) {
                match with_deadline(self.timeout, "get_order", self.broker.get_order(stop_id)).await {
                    Ok(order) if !order.status.is_terminal() => ids.push(order.id),
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(ids)
    }

    /// Places a GTC stop sized from the live position. Never cancels anything.
    ///
    /// # Errors
    /// Missing stop price, no broker position, tick or broker failures.
    pub async fn rescue_stop(&self, trade: &Trade) -> Result<RescueResult, StopSyncError> {
        let requested = trade.stop_price.ok_or(StopSyncError::MissingStopPrice)?;
        if requested <= Decimal::ZERO {
            return Err(StopSyncError::InvalidStopPrice);
        }
        let symbol = trade.normalized_ticker();
        let position = self
            .position(&symbol)
            .await?
            .ok_or_else(|| StopSyncError::NoPosition(symbol.clone()))?;
        let quantity = position.qty.abs();
        if quantity.is_zero() {
            return Err(StopSyncError::NoPosition(symbol));
        }

        let entry = trade.entry_price.unwrap_or(position.avg_entry_price);
        let tick = tick_for_price(requested, &self.ticks);
        let stop_price = normalize_stop_price(trade.side, entry, requested, tick)?;

        let request = OrderRequest::stop(
            &symbol,
            quantity,
            position.exit_side(),
            stop_price,
            TimeInForce::Gtc,
        )
        .with_client_order_id(client_order_id("rescue", trade));
        let order =
            with_deadline(self.timeout, "submit_order", self.broker.submit_order(&request)).await?;

        warn!(
            trade_id = trade.id,
            ticker = %symbol,
            stop = %stop_price,
            qty = %quantity,
            order_id = %order.id,
            "rescue stop placed for unprotected position"
        );
        Ok(RescueResult {
            stop_order_id: order.id,
            stop_price,
            quantity,
        })
    }
}

fn client_order_id(kind: &str, trade: &Trade) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{kind}-{}-{}", trade.id, &suffix[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrade_broker::{
        bracket_parent, resting_stop, OrderStatus, PaperBroker, PaperCall, PaperFailure, PaperOp,
    };
    use autotrade_core::TickBand;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn ticks() -> TickConfig {
        TickConfig {
            bands: vec![TickBand {
                below: dec!(1),
                tick: dec!(0.0001),
            }],
            default_tick: dec!(0.01),
            min_bracket_offset: dec!(0.01),
        }
    }

    fn sync(broker: &Arc<PaperBroker>) -> StopSynchronizer {
        StopSynchronizer::new(broker.clone(), ticks(), Duration::from_millis(500))
    }

    fn long_trade() -> Trade {
        let mut trade = Trade::new(1, "AAPL", Side::Long, Utc::now())
            .with_prices(dec!(100), dec!(98))
            .with_quantity(dec!(10));
        trade.stop_order_id = Some("stop-1".to_string());
        trade
    }

    #[tokio::test]
    async fn loosening_makes_no_broker_calls() {
        let broker = Arc::new(PaperBroker::new());
        let err = sync(&broker)
            .sync_stop_for_trade(&long_trade(), dec!(97))
            .await
            .unwrap_err();
        assert_eq!(err.as_str(), "not_tightening");
        assert_eq!(broker.call_count(), 0);

        let mut short = Trade::new(2, "TSLA", Side::Short, Utc::now()).with_prices(dec!(200), dec!(205));
        short.quantity = Some(dec!(5));
        let err = sync(&broker).sync_stop_for_trade(&short, dec!(206)).await.unwrap_err();
        assert_eq!(err, StopSyncError::NotTightening);
        assert_eq!(broker.call_count(), 0);
    }

    #[tokio::test]
    async fn replaces_standalone_stop() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("AAPL", dec!(10), dec!(100), dec!(103));
        broker.insert_order(resting_stop("stop-1", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Accepted));

        let result = sync(&broker)
            .sync_stop_for_trade(&long_trade(), dec!(99.004))
            .await
            .unwrap();

        assert_eq!(result.cancelled_order_ids, vec!["stop-1".to_string()]);
        assert_eq!(result.stop_price, dec!(99));
        assert!(result.quantization_note.is_some());
        assert_eq!(broker.order("stop-1").unwrap().status, OrderStatus::Canceled);

        let new_stop = broker.order(&result.new_stop_order_id).unwrap();
        assert_eq!(new_stop.stop_price, Some(dec!(99)));
        assert_eq!(new_stop.side, OrderSide::Sell);
        assert_eq!(new_stop.time_in_force, TimeInForce::Day);
        assert_eq!(new_stop.qty, Some(dec!(10)));

        let calls = broker.calls();
        let cancel_at = calls.iter().position(|c| matches!(c, PaperCall::CancelOrder(_))).unwrap();
        let submit_at = calls.iter().position(|c| matches!(c, PaperCall::SubmitOrder(_))).unwrap();
        assert!(cancel_at < submit_at);
    }

    #[tokio::test]
    async fn cancels_bracket_leg_found_via_parent() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("AAPL", dec!(10), dec!(100), dec!(103));
        let leg = resting_stop("leg-stop", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Held);
        broker.insert_order(bracket_parent("parent-1", "AAPL", OrderSide::Buy, dec!(10), dec!(100), vec![leg]));

        let mut trade = long_trade();
        trade.stop_order_id = None;
        trade.broker_order_id = Some("parent-1".to_string());

        let result = sync(&broker).sync_stop_for_trade(&trade, dec!(99)).await.unwrap();
        assert_eq!(result.cancelled_order_ids, vec!["leg-stop".to_string()]);
        assert!(result.quantization_note.is_none());
    }

    #[tokio::test]
    async fn missing_stop_counts_as_cancelled() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("AAPL", dec!(10), dec!(100), dec!(103));
        broker.insert_order(resting_stop("stop-1", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Accepted));
        broker.fail_cancel_for("stop-1", PaperFailure::NotFound);

        let result = sync(&broker).sync_stop_for_trade(&long_trade(), dec!(99)).await.unwrap();
        assert_eq!(result.cancelled_order_ids, vec!["stop-1".to_string()]);
    }

    #[tokio::test]
    async fn failed_cancel_aborts_before_submit() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("AAPL", dec!(10), dec!(100), dec!(103));
        broker.insert_order(resting_stop("stop-1", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Accepted));
        broker.fail_cancel_for("stop-1", PaperFailure::Api(500));

        let err = sync(&broker).sync_stop_for_trade(&long_trade(), dec!(99)).await.unwrap_err();
        assert_eq!(err.as_str(), "cancel_failed");
        assert!(!broker.calls().iter().any(|c| matches!(c, PaperCall::SubmitOrder(_))));
        assert_eq!(broker.order("stop-1").unwrap().status, OrderStatus::Accepted);
    }

    #[tokio::test]
    async fn failed_submit_reports_what_was_cancelled() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("AAPL", dec!(10), dec!(100), dec!(103));
        broker.insert_order(resting_stop("stop-1", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Accepted));
        broker.fail_next(PaperOp::SubmitOrder, PaperFailure::Timeout);

        let err = sync(&broker).sync_stop_for_trade(&long_trade(), dec!(99)).await.unwrap_err();
        let StopSyncError::SubmitFailed { cancelled, .. } = err else {
            panic!("expected submit_failed, got {err:?}");
        };
        assert_eq!(cancelled, vec!["stop-1".to_string()]);
        assert_eq!(broker.order("stop-1").unwrap().status, OrderStatus::Canceled);
        assert!(broker.orders().iter().all(|o| o.id == "stop-1"));
    }

    #[tokio::test]
    async fn quantity_falls_back_to_position() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("AAPL", dec!(7), dec!(100), dec!(103));
        let mut trade = long_trade();
        trade.quantity = None;
        trade.stop_order_id = None;

        let result = sync(&broker).sync_stop_for_trade(&trade, dec!(99)).await.unwrap();
        assert_eq!(result.quantity, dec!(7));

        broker.remove_position("AAPL");
        let err = sync(&broker).sync_stop_for_trade(&trade, dec!(99)).await.unwrap_err();
        assert_eq!(err, StopSyncError::QuantityUnavailable);
    }

    #[tokio::test]
    async fn rescue_places_gtc_stop_without_cancelling() {
        let broker = Arc::new(PaperBroker::new());
        broker.set_position("AAPL", dec!(10), dec!(100), dec!(101));
        broker.insert_order(resting_stop("old", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Expired));

        let rescue = sync(&broker).rescue_stop(&long_trade()).await.unwrap();
        assert_eq!(rescue.quantity, dec!(10));
        assert_eq!(rescue.stop_price, dec!(98));
        let order = broker.order(&rescue.stop_order_id).unwrap();
        assert_eq!(order.time_in_force, TimeInForce::Gtc);
        assert!(!broker.calls().iter().any(|c| matches!(c, PaperCall::CancelOrder(_))));
    }

    #[tokio::test]
    async fn rescue_requires_position() {
        let broker = Arc::new(PaperBroker::new());
        let err = sync(&broker).rescue_stop(&long_trade()).await.unwrap_err();
        assert_eq!(err.as_str(), "no_position");

        broker.set_failure(PaperOp::GetPosition, Some(PaperFailure::Timeout));
        let err = sync(&broker).rescue_stop(&long_trade()).await.unwrap_err();
        assert_eq!(err.as_str(), "broker_error");
    }

    #[test]
    fn active_stop_allow_list() {
        let orders = vec![
            resting_stop("a", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Filled),
            bracket_parent(
                "p",
                "AAPL",
                OrderSide::Buy,
                dec!(10),
                dec!(100),
                vec![resting_stop("b", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Held)],
            ),
        ];
        assert_eq!(active_stop_for("AAPL", OrderSide::Sell, &orders).map(|o| o.id.as_str()), Some("b"));
        assert!(active_stop_for("AAPL", OrderSide::Buy, &orders).is_none());
        assert!(active_stop_for("MSFT", OrderSide::Sell, &orders).is_none());
    }
}
