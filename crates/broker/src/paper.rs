//! In-memory broker for dry runs and tests.
//!
//! Market orders fill immediately at the symbol's current price; every other
//! order type rests until cancelled. Every call is recorded, and individual
//! operations can be made to fail or stall.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BrokerError, Result};
use crate::traits::Broker;
use crate::types::{
    Fill, Order, OrderRequest, OrderSide, OrderStatus, OrderType, Position, TimeInForce,
};

/// Broker operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    ListPositions,
    GetPosition,
    ListOpenOrders,
    GetOrder,
    SubmitOrder,
    CancelOrder,
    ClosePosition,
    ListFills,
}

/// A recorded broker call.
#[derive(Debug, Clone, PartialEq)]
pub enum PaperCall {
    ListPositions,
    GetPosition(String),
    ListOpenOrders,
    GetOrder(String),
    SubmitOrder(OrderRequest),
    CancelOrder(String),
    ClosePosition(String),
    ListFills(String),
}

impl PaperCall {
    #[must_use]
    pub fn op(&self) -> PaperOp {
        match self {
            Self::ListPositions => PaperOp::ListPositions,
            Self::GetPosition(_) => PaperOp::GetPosition,
            Self::ListOpenOrders => PaperOp::ListOpenOrders,
            Self::GetOrder(_) => PaperOp::GetOrder,
            Self::SubmitOrder(_) => PaperOp::SubmitOrder,
            Self::CancelOrder(_) => PaperOp::CancelOrder,
            Self::ClosePosition(_) => PaperOp::ClosePosition,
            Self::ListFills(_) => PaperOp::ListFills,
        }
    }
}

/// Failure to inject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperFailure {
    Timeout,
    Network,
    NotFound,
    Api(u16),
}

impl PaperFailure {
    fn to_error(&self, context: &str) -> BrokerError {
        match self {
            Self::Timeout => BrokerError::Timeout(format!("paper: {context}")),
            Self::Network => BrokerError::Network(format!("paper: {context}")),
            Self::NotFound => BrokerError::not_found(context),
            Self::Api(code) => BrokerError::api(*code, format!("paper: {context}")),
        }
    }
}

#[derive(Debug, Default)]
struct PaperState {
    positions: HashMap<String, Position>,
    prices: HashMap<String, Decimal>,
    /// Top-level orders in submission order; bracket legs live inside their parent.
    orders: Vec<Order>,
    fills: Vec<Fill>,
    calls: Vec<PaperCall>,
    failures: HashMap<PaperOp, PaperFailure>,
    one_shot_failures: HashMap<PaperOp, PaperFailure>,
    cancel_failures: HashMap<String, PaperFailure>,
    latency: Option<Duration>,
    next_id: u64,
}

impl PaperState {
    fn find_order(&self, order_id: &str) -> Option<&Order> {
        self.orders.iter().find_map(|o| {
            if o.id == order_id {
                Some(o)
            } else {
                o.legs.iter().find(|leg| leg.id == order_id)
            }
        })
    }

    fn find_order_mut(&mut self, order_id: &str) -> Option<&mut Order> {
        self.orders.iter_mut().find_map(|o| {
            if o.id == order_id {
                Some(o)
            } else {
                o.legs.iter_mut().find(|leg| leg.id == order_id)
            }
        })
    }

    fn next_order_id(&mut self) -> String {
        self.next_id += 1;
        format!("paper-{}", self.next_id)
    }

    fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied().or_else(|| {
            self.positions
                .get(symbol)
                .and_then(|p| p.current_price.or(Some(p.avg_entry_price)))
        })
    }

    /// Applies a fill to the position book.
    fn apply_fill(&mut self, symbol: &str, side: OrderSide, qty: Decimal, price: Decimal) {
        let delta = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let current_price = self.prices.get(symbol).copied();

        if !self.positions.contains_key(symbol) {
            self.positions.insert(
                symbol.to_string(),
                Position {
                    symbol: symbol.to_string(),
                    qty: delta,
                    avg_entry_price: price,
                    current_price: current_price.or(Some(price)),
                    opened_at: Some(Utc::now()),
                },
            );
            return;
        }
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };

        let new_qty = position.qty + delta;
        if new_qty.is_zero() {
            self.positions.remove(symbol);
            return;
        }
        let same_direction = position.qty.is_sign_positive() == delta.is_sign_positive();
        if same_direction {
            let cost = position.avg_entry_price * position.qty.abs() + price * qty;
            position.avg_entry_price = cost / new_qty.abs();
        } else if new_qty.is_sign_positive() != position.qty.is_sign_positive() {
            // flipped through flat
            position.avg_entry_price = price;
            position.opened_at = Some(Utc::now());
        }
        position.qty = new_qty;
    }
}

/// In-memory [`Broker`].
#[derive(Debug, Default)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
}

impl PaperBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = Some(latency);
        self
    }

    /// Sets (or replaces) a position. `qty` is signed.
    pub fn set_position(
        &self,
        symbol: &str,
        qty: Decimal,
        avg_entry_price: Decimal,
        current_price: Decimal,
    ) {
        let symbol = symbol.to_uppercase();
        let mut state = self.state.lock();
        state.prices.insert(symbol.clone(), current_price);
        state.positions.insert(
            symbol.clone(),
            Position {
                symbol,
                qty,
                avg_entry_price,
                current_price: Some(current_price),
                opened_at: Some(Utc::now()),
            },
        );
    }

    pub fn remove_position(&self, symbol: &str) {
        self.state.lock().positions.remove(&symbol.to_uppercase());
    }

    /// Moves the mark price of a symbol.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let symbol = symbol.to_uppercase();
        let mut state = self.state.lock();
        if let Some(position) = state.positions.get_mut(&symbol) {
            position.current_price = Some(price);
        }
        state.prices.insert(symbol, price);
    }

    /// Adds a pre-built order (e.g. a bracket parent with legs).
    pub fn insert_order(&self, order: Order) {
        self.state.lock().orders.push(order);
    }

    pub fn add_fill(&self, fill: Fill) {
        self.state.lock().fills.push(fill);
    }

    /// Makes every call of `op` fail until cleared with `None`.
    pub fn set_failure(&self, op: PaperOp, failure: Option<PaperFailure>) {
        let mut state = self.state.lock();
        match failure {
            Some(f) => state.failures.insert(op, f),
            None => state.failures.remove(&op),
        };
    }

    /// Makes only the next call of `op` fail.
    pub fn fail_next(&self, op: PaperOp, failure: PaperFailure) {
        self.state.lock().one_shot_failures.insert(op, failure);
    }

    /// Makes cancelling one specific order fail.
    pub fn fail_cancel_for(&self, order_id: &str, failure: PaperFailure) {
        self.state
            .lock()
            .cancel_failures
            .insert(order_id.to_string(), failure);
    }

    #[must_use]
    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.state.lock().find_order(order_id).cloned()
    }

    /// All top-level orders, including terminal ones.
    #[must_use]
    pub fn orders(&self) -> Vec<Order> {
        self.state.lock().orders.clone()
    }

    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.state
            .lock()
            .positions
            .get(&symbol.to_uppercase())
            .cloned()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<PaperCall> {
        self.state.lock().calls.clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Records the call, waits out any latency, then applies an injected failure.
    async fn enter(&self, call: PaperCall, context: &str) -> Result<()> {
        let op = call.op();
        let latency = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let failure = {
            let mut state = self.state.lock();
            match state.failures.get(&op).cloned() {
                Some(f) => Some(f),
                None => state.one_shot_failures.remove(&op),
            }
        };
        match failure {
            Some(f) => Err(f.to_error(context)),
            None => Ok(()),
        }
    }

    fn build_order(state: &mut PaperState, request: &OrderRequest, status: OrderStatus) -> Order {
        Order {
            id: state.next_order_id(),
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.to_uppercase(),
            side: request.side,
            order_type: request.order_type,
            status,
            qty: Some(request.qty),
            filled_qty: Decimal::ZERO,
            filled_avg_price: None,
            stop_price: request.stop_price,
            limit_price: request.limit_price,
            time_in_force: request.time_in_force,
            legs: Vec::new(),
            created_at: Some(Utc::now()),
        }
    }

    fn execute(state: &mut PaperState, request: &OrderRequest) -> Result<Order> {
        if request.qty <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(format!(
                "order quantity must be positive, got {}",
                request.qty
            )));
        }
        let symbol = request.symbol.to_uppercase();

        if request.order_type != OrderType::Market {
            let order = Self::build_order(state, request, OrderStatus::Accepted);
            state.orders.push(order.clone());
            return Ok(order);
        }

        let price = state
            .mark_price(&symbol)
            .ok_or_else(|| BrokerError::Rejected(format!("no price for {symbol}")))?;
        let mut order = Self::build_order(state, request, OrderStatus::Filled);
        order.filled_qty = request.qty;
        order.filled_avg_price = Some(price);

        state.apply_fill(&symbol, request.side, request.qty, price);
        state.fills.push(Fill {
            id: Some(format!("fill-{}", order.id)),
            order_id: order.id.clone(),
            symbol,
            side: request.side,
            qty: request.qty,
            price,
            transaction_time: Utc::now(),
        });
        state.orders.push(order.clone());
        Ok(order)
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn list_positions(&self) -> Result<Vec<Position>> {
        self.enter(PaperCall::ListPositions, "list_positions").await?;
        let mut positions: Vec<Position> = self.state.lock().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>> {
        let symbol = symbol.to_uppercase();
        self.enter(PaperCall::GetPosition(symbol.clone()), &symbol)
            .await?;
        Ok(self.state.lock().positions.get(&symbol).cloned())
    }

    async fn list_open_orders(&self) -> Result<Vec<Order>> {
        self.enter(PaperCall::ListOpenOrders, "list_open_orders")
            .await?;
        let state = self.state.lock();
        Ok(state
            .orders
            .iter()
            .filter(|o| {
                !o.status.is_terminal() || o.legs.iter().any(|leg| !leg.status.is_terminal())
            })
            .cloned()
            .collect())
    }

    async fn get_order(&self, order_id: &str) -> Result<Order> {
        self.enter(PaperCall::GetOrder(order_id.to_string()), order_id)
            .await?;
        self.state
            .lock()
            .find_order(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(format!("order {order_id}")))
    }

    async fn submit_order(&self, request: &OrderRequest) -> Result<Order> {
        self.enter(PaperCall::SubmitOrder(request.clone()), &request.symbol)
            .await?;
        let mut state = self.state.lock();
        Self::execute(&mut state, request)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        self.enter(PaperCall::CancelOrder(order_id.to_string()), order_id)
            .await?;
        let mut state = self.state.lock();
        if let Some(failure) = state.cancel_failures.get(order_id) {
            return Err(failure.to_error(order_id));
        }
        let order = state
            .find_order_mut(order_id)
            .ok_or_else(|| BrokerError::not_found(format!("order {order_id}")))?;
        if order.status.is_terminal() {
            return Err(BrokerError::api(
                422,
                format!("order is already {}", order.status.as_str()),
            ));
        }
        order.status = OrderStatus::Canceled;
        Ok(())
    }

    async fn close_position(&self, symbol: &str) -> Result<Order> {
        let symbol = symbol.to_uppercase();
        self.enter(PaperCall::ClosePosition(symbol.clone()), &symbol)
            .await?;
        let mut state = self.state.lock();
        let position = state
            .positions
            .get(&symbol)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(format!("position {symbol}")))?;
        let request = OrderRequest::market(&symbol, position.qty.abs(), position.exit_side());
        Self::execute(&mut state, &request)
    }

    async fn list_fills(
        &self,
        symbol: &str,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Fill>> {
        let symbol = symbol.to_uppercase();
        self.enter(PaperCall::ListFills(symbol.clone()), &symbol)
            .await?;
        let mut fills: Vec<Fill> = self
            .state
            .lock()
            .fills
            .iter()
            .filter(|f| {
                f.symbol.eq_ignore_ascii_case(&symbol)
                    && f.transaction_time >= after
                    && f.transaction_time <= until
            })
            .cloned()
            .collect();
        fills.sort_by_key(|f| f.transaction_time);
        Ok(fills)
    }
}

/// A resting stop order, for seeding the paper book.
#[must_use]
pub fn resting_stop(
    id: &str,
    symbol: &str,
    side: OrderSide,
    qty: Decimal,
    stop_price: Decimal,
    status: OrderStatus,
) -> Order {
    Order {
        id: id.to_string(),
        client_order_id: None,
        symbol: symbol.to_uppercase(),
        side,
        order_type: OrderType::Stop,
        status,
        qty: Some(qty),
        filled_qty: Decimal::ZERO,
        filled_avg_price: None,
        stop_price: Some(stop_price),
        limit_price: None,
        time_in_force: TimeInForce::Gtc,
        legs: Vec::new(),
        created_at: Some(Utc::now()),
    }
}

/// A filled bracket parent carrying the given legs.
#[must_use]
pub fn bracket_parent(
    id: &str,
    symbol: &str,
    side: OrderSide,
    qty: Decimal,
    fill_price: Decimal,
    legs: Vec<Order>,
) -> Order {
    Order {
        id: id.to_string(),
        client_order_id: None,
        symbol: symbol.to_uppercase(),
        side,
        order_type: OrderType::Market,
        status: OrderStatus::Filled,
        qty: Some(qty),
        filled_qty: qty,
        filled_avg_price: Some(fill_price),
        stop_price: None,
        limit_price: None,
        time_in_force: TimeInForce::Day,
        legs,
        created_at: Some(Utc::now()),
    }
}
