use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use autotrade_core::TradeId;

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    CutLoss,
    BracketExit,
    ExitFill,
    /// The broker reported no position for a trade we believed open.
    BrokerFlat,
    Manual,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::CutLoss => "cut_loss",
            Self::BracketExit => "bracket_exit",
            Self::ExitFill => "exit_fill",
            Self::BrokerFlat => "broker_flat",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome for one trade within a run or maintenance pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub trade_id: Option<TradeId>,
    pub ticker: String,
    /// What was done or attempted (`cut_loss`, `tighten_stop`, `rescue_stop`, ...).
    pub action: String,
    pub ok: bool,
    pub detail: Option<String>,
}

impl ItemResult {
    pub fn ok(trade_id: TradeId, ticker: &str, action: &str, detail: impl Into<String>) -> Self {
        Self {
            trade_id: Some(trade_id),
            ticker: ticker.to_string(),
            action: action.to_string(),
            ok: true,
            detail: Some(detail.into()),
        }
    }

    pub fn failed(trade_id: TradeId, ticker: &str, action: &str, detail: impl Into<String>) -> Self {
        Self {
            trade_id: Some(trade_id),
            ticker: ticker.to_string(),
            action: action.to_string(),
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

/// Structured result of a maintenance operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceSummary {
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub checked: usize,
    pub updated: usize,
    pub errors: usize,
    pub items: Vec<ItemResult>,
    /// Set when the operation did not run (lock held, store missing).
    pub note: Option<String>,
}

impl MaintenanceSummary {
    #[must_use]
    pub fn start(operation: &str, now: DateTime<Utc>) -> Self {
        Self {
            operation: operation.to_string(),
            started_at: now,
            finished_at: now,
            checked: 0,
            updated: 0,
            errors: 0,
            items: Vec::new(),
            note: None,
        }
    }

    /// Records an item, counting it as updated or errored.
    pub fn push(&mut self, item: ItemResult) {
        if item.ok {
            self.updated += 1;
        } else {
            self.errors += 1;
        }
        self.items.push(item);
    }

    #[must_use]
    pub fn skipped(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    #[must_use]
    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now().max(self.started_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Another run holds the lock.
    Locked,
    /// No shared store to lock against.
    Unavailable,
    /// Broker positions could not be read; nothing was changed.
    BrokerUnavailable,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Locked => "locked",
            Self::Unavailable => "unavailable",
            Self::BrokerUnavailable => "broker_unavailable",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-action counters of one auto-manage run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub checked: usize,
    pub duplicates: usize,
    pub broker_flat: usize,
    pub cut_loss: usize,
    pub tightened: usize,
    pub rescued: usize,
    pub errors: usize,
}

/// One auto-manage run, as stored in the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub owner: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: RunCounts,
    pub items: Vec<ItemResult>,
    pub detail: Option<String>,
}

impl RunSummary {
    #[must_use]
    pub fn new(run_id: String, owner: &str, status: RunStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            owner: owner.to_string(),
            status,
            started_at,
            finished_at: started_at,
            counts: RunCounts::default(),
            items: Vec::new(),
            detail: None,
        }
    }

    pub fn push(&mut self, item: ItemResult) {
        if !item.ok {
            self.counts.errors += 1;
        }
        self.items.push(item);
    }
}
