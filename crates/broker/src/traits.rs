use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Fill, Order, OrderRequest, Position};

/// Order and position primitives of a single brokerage account.
///
/// Every call can fail or time out; callers receive a typed
/// [`BrokerError`](crate::BrokerError) and decide what to do with it.
///
/// There is no in-place order replace. Changing a resting order is
/// [`cancel_order`](Broker::cancel_order) followed by
/// [`submit_order`](Broker::submit_order), so a caller can always tell
/// which half failed: a failed cancel leaves the old order working, a
/// failed submit leaves the position with no order until the caller
/// places one.
#[async_trait]
pub trait Broker: Send + Sync {
    /// All open positions.
    async fn list_positions(&self) -> Result<Vec<Position>>;

    /// Position for one symbol, `None` when flat.
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>>;

    /// All open orders, bracket parents with their legs.
    async fn list_open_orders(&self) -> Result<Vec<Order>>;

    /// One order by id, with legs. Missing orders are `BrokerError::NotFound`.
    async fn get_order(&self, order_id: &str) -> Result<Order>;

    async fn submit_order(&self, request: &OrderRequest) -> Result<Order>;

    /// Cancels an order. Missing orders are `BrokerError::NotFound`.
    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    /// Flattens a position with a market order, returning that order.
    async fn close_position(&self, symbol: &str) -> Result<Order>;

    /// Executions for `symbol` with `after <= transaction_time <= until`, oldest first.
    ///
    /// Returns `BrokerError::Incomplete` rather than a partial list when the
    /// window holds more fills than one listing can page through.
    async fn list_fills(
        &self,
        symbol: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Fill>>;
}
