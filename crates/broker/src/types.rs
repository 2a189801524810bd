//! Core broker types: orders, positions and fills.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    #[serde(alias = "sell_short")]
    Sell,
}

impl OrderSide {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    #[must_use]
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

/// Order validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
}

/// Broker-reported order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Accepted,
    PendingNew,
    Held,
    PartiallyFilled,
    Filled,
    DoneForDay,
    Canceled,
    Expired,
    Replaced,
    PendingCancel,
    PendingReplace,
    Rejected,
    #[serde(other)]
    Other,
}

impl OrderStatus {
    /// Parses a broker status string; unknown values map to `Other`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(s.trim().to_lowercase()))
            .unwrap_or(Self::Other)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Accepted => "accepted",
            Self::PendingNew => "pending_new",
            Self::Held => "held",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::DoneForDay => "done_for_day",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
            Self::Replaced => "replaced",
            Self::PendingCancel => "pending_cancel",
            Self::PendingReplace => "pending_replace",
            Self::Rejected => "rejected",
            Self::Other => "other",
        }
    }

    /// A stop order in this status still protects the position.
    ///
    /// Anything outside the allow-list (filled, canceled, expired, rejected,
    /// unknown) counts as no stop at all.
    #[must_use]
    pub fn is_active_stop(&self) -> bool {
        matches!(self, Self::New | Self::Accepted | Self::PendingNew | Self::Held)
    }

    /// No further fills or cancels are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Expired | Self::Replaced | Self::Rejected
        )
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// An order at the broker. Bracket parents carry their child legs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub status: OrderStatus,
    #[serde(default)]
    pub qty: Option<Decimal>,
    #[serde(default)]
    pub filled_qty: Decimal,
    #[serde(default)]
    pub filled_avg_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub legs: Vec<Order>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Stop-type order (plain, stop-limit or trailing).
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(
            self.order_type,
            OrderType::Stop | OrderType::StopLimit | OrderType::TrailingStop
        )
    }

    /// Stop legs of a bracket parent.
    pub fn stop_legs(&self) -> impl Iterator<Item = &Order> {
        self.legs.iter().filter(|leg| leg.is_stop())
    }

    /// Take-profit (limit) legs of a bracket parent.
    pub fn limit_legs(&self) -> impl Iterator<Item = &Order> {
        self.legs
            .iter()
            .filter(|leg| leg.order_type == OrderType::Limit)
    }
}

/// An open position. `qty` is signed: negative for shorts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    #[serde(default)]
    pub current_price: Option<Decimal>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
}

impl Position {
    #[must_use]
    pub fn is_short(&self) -> bool {
        self.qty < Decimal::ZERO
    }

    /// Side of the order that would flatten this position.
    #[must_use]
    pub fn exit_side(&self) -> OrderSide {
        if self.is_short() {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        }
    }
}

/// One execution from the account activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    #[serde(default)]
    pub id: Option<String>,
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub price: Decimal,
    pub transaction_time: DateTime<Utc>,
}

/// An order to submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// A plain stop order.
    #[must_use]
    pub fn stop(
        symbol: &str,
        qty: Decimal,
        side: OrderSide,
        stop_price: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            qty,
            side,
            order_type: OrderType::Stop,
            time_in_force,
            stop_price: Some(stop_price),
            limit_price: None,
            client_order_id: None,
        }
    }

    /// A day market order.
    #[must_use]
    pub fn market(symbol: &str, qty: Decimal, side: OrderSide) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            qty,
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            stop_price: None,
            limit_price: None,
            client_order_id: None,
        }
    }

    #[must_use]
    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}
