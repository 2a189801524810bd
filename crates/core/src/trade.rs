//! Local trade record.
//!
//! A `Trade` is the application's view of one position or order intent at
//! the broker. It is never deleted; it only moves between statuses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Database identifier of a trade.
pub type TradeId = i64;

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LONG" | "BUY" => Some(Self::Long),
            "SHORT" | "SELL" => Some(Self::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short.
    #[must_use]
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Open,
    Partial,
    Closed,
    Disabled,
    Error,
}

impl TradeStatus {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::Partial => "PARTIAL",
            Self::Closed => "CLOSED",
            Self::Disabled => "DISABLED",
            Self::Error => "ERROR",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "OPEN" => Some(Self::Open),
            "PARTIAL" => Some(Self::Partial),
            "CLOSED" => Some(Self::Closed),
            "DISABLED" => Some(Self::Disabled),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which path produced the local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSource {
    /// Placed by the automated entry path.
    AutoEntry,
    /// Entered by an operator.
    Manual,
    /// Reconstructed after the fact from broker state.
    BrokerBackfill,
}

impl TradeSource {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoEntry => "auto_entry",
            Self::Manual => "manual",
            Self::BrokerBackfill => "broker_backfill",
        }
    }

    /// Parses from string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto_entry" | "auto" => Some(Self::AutoEntry),
            "manual" => Some(Self::Manual),
            "broker_backfill" | "backfill" => Some(Self::BrokerBackfill),
            _ => None,
        }
    }
}

/// A local trade record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub ticker: String,
    pub side: Side,
    pub quantity: Option<Decimal>,
    pub entry_price: Option<Decimal>,
    /// Current protective stop; tightened over time.
    pub stop_price: Option<Decimal>,
    /// Stop at entry time; anchors risk-per-share for R.
    pub initial_stop_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub status: TradeStatus,
    pub source: TradeSource,
    /// Signal score at entry, when the entry path supplied one.
    pub score: Option<Decimal>,
    /// Parent (entry) order at the broker.
    pub broker_order_id: Option<String>,
    pub broker_order_status: Option<String>,
    pub stop_order_id: Option<String>,
    pub take_profit_order_id: Option<String>,
    /// Order used to flatten the position.
    pub close_order_id: Option<String>,
    pub close_reason: Option<String>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub realized_r: Option<Decimal>,
    /// Set when another record is canonical for the same broker position.
    pub duplicate_of: Option<TradeId>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// Creates a bare OPEN trade with no prices.
    #[must_use]
    pub fn new(id: TradeId, ticker: &str, side: Side, now: DateTime<Utc>) -> Self {
        Self {
            id,
            ticker: normalize_ticker(ticker),
            side,
            quantity: None,
            entry_price: None,
            stop_price: None,
            initial_stop_price: None,
            take_profit_price: None,
            status: TradeStatus::Open,
            source: TradeSource::AutoEntry,
            score: None,
            broker_order_id: None,
            broker_order_status: None,
            stop_order_id: None,
            take_profit_order_id: None,
            close_order_id: None,
            close_reason: None,
            exit_price: None,
            realized_pnl: None,
            realized_r: None,
            duplicate_of: None,
            note: None,
            created_at: now,
            updated_at: now,
            opened_at: Some(now),
            closed_at: None,
            finalized_at: None,
        }
    }

    /// Sets entry and stop; the stop also becomes the initial stop.
    #[must_use]
    pub fn with_prices(mut self, entry: Decimal, stop: Decimal) -> Self {
        self.entry_price = Some(entry);
        self.stop_price = Some(stop);
        self.initial_stop_price = Some(stop);
        self
    }

    #[must_use]
    pub fn with_quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = Some(quantity);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: TradeStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: TradeSource) -> Self {
        self.source = source;
        self
    }

    /// Ticker in canonical (trimmed, upper-case) form.
    #[must_use]
    pub fn normalized_ticker(&self) -> String {
        normalize_ticker(&self.ticker)
    }

    /// Stop used to size risk: the initial stop when known, else the current one.
    #[must_use]
    pub fn risk_stop(&self) -> Option<Decimal> {
        self.initial_stop_price.or(self.stop_price)
    }

    /// Entry and stop are both present, positive and distinct.
    #[must_use]
    pub fn has_valid_risk(&self) -> bool {
        match (self.entry_price, self.risk_stop()) {
            (Some(entry), Some(stop)) => {
                entry > Decimal::ZERO && stop > Decimal::ZERO && entry != stop
            }
            _ => false,
        }
    }

    /// Risk per share oriented by side; `None` when unknown or non-positive.
    #[must_use]
    pub fn risk_per_share(&self) -> Option<Decimal> {
        let entry = self.entry_price?;
        let stop = self.risk_stop()?;
        let risk = (entry - stop) * self.side.sign();
        (risk > Decimal::ZERO).then_some(risk)
    }

    /// When the trade was opened, falling back to creation time.
    #[must_use]
    pub fn opened_or_created(&self) -> DateTime<Utc> {
        self.opened_at.unwrap_or(self.created_at)
    }
}

/// Trimmed upper-case ticker.
#[must_use]
pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

/// Stop strictly below entry for longs, strictly above for shorts.
#[must_use]
pub fn stop_is_protective(side: Side, entry: Decimal, stop: Decimal) -> bool {
    match side {
        Side::Long => stop < entry,
        Side::Short => stop > entry,
    }
}
