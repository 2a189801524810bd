//! Automated management of open positions.
//!
//! - [`BrokerTruthCache`]: short-TTL snapshot of broker positions and orders
//! - [`StopSynchronizer`]: cancel-then-create stop replacement and rescue stops
//! - [`decide_cut_loss_action`] / [`decide_trailing_action`]: R-based exits
//! - [`select_canonical_open_trade`]: one authoritative trade per position
//! - [`CloseFinalizer`]: realized PnL/R from the fill feed
//! - [`EntryGate`]: guardrail and broker checks before automated entries
//! - [`AutoManager`]: the locked auto-manage pass and maintenance flows

pub mod broker_truth;
pub mod canonical;
pub mod cut_loss;
mod deadline;
pub mod entry_gate;
pub mod finalizer;
mod maintenance;
pub mod notify;
pub mod orchestrator;
pub mod stop_sync;
pub mod types;

pub use broker_truth::{BrokerTruth, BrokerTruthCache};
pub use canonical::{group_canonical, select_canonical_open_trade, CanonicalSelection};
pub use cut_loss::{
    decide_cut_loss_action, decide_trailing_action, plan_canonical_cut_loss_actions,
    trade_unrealized_r, CutLossAction, TradeView, TrailAction, TrailingPolicy,
};
pub use entry_gate::{EntryBlock, EntryDecision, EntryGate, ReplacementCandidate};
pub use finalizer::{compute_outcome, CloseFinalizer, FinalizeOutcome, Realized};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use orchestrator::{AutoManager, ManagerDeps};
pub use stop_sync::{
    active_stop_for, exit_side, tightens, RescueResult, StopSyncError, StopSyncResult,
    StopSynchronizer,
};
pub use types::{CloseReason, ItemResult, MaintenanceSummary, RunCounts, RunStatus, RunSummary};
