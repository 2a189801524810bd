//! Auto-manage orchestrator.
//!
//! One run takes the named lock, reads broker truth and the local open
//! trades, resolves duplicates, then for each canonical trade either closes
//! it (broker flat), flattens it (cut-loss), tightens its stop (trailing) or
//! restores a missing stop (rescue). Failures are recorded per item and the
//! pass moves on.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{error, info, warn};
use uuid::Uuid;

use autotrade_broker::{Broker, Order, Position};
use autotrade_core::{
    tick_for_price, AppConfig, ManagerConfig, Side, TickConfig, Trade, TradeStatus,
};
use autotrade_store::{
    GuardrailStore, KvStore, LockManager, LockOutcome, RunLog, StoreError, TradeStore,
};

use crate::broker_truth::{BrokerTruth, BrokerTruthCache};
use crate::canonical::{group_canonical, CanonicalSelection};
use crate::cut_loss::{
    decide_cut_loss_action, decide_trailing_action, trade_unrealized_r, CutLossAction,
    TradeView, TrailingPolicy,
};
use crate::deadline::with_deadline;
use crate::entry_gate::EntryGate;
use crate::finalizer::CloseFinalizer;
use crate::notify::Notifier;
use crate::stop_sync::{active_stop_for, exit_side, StopSyncError, StopSynchronizer};
use crate::types::{CloseReason, ItemResult, RunStatus, RunSummary};

/// External collaborators of the manager.
pub struct ManagerDeps {
    pub broker: Arc<dyn Broker>,
    pub trades: Arc<dyn TradeStore>,
    /// `None` when no shared store is configured.
    pub kv: Option<Arc<dyn KvStore>>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct AutoManager {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) trades: Arc<dyn TradeStore>,
    pub(crate) truth: Arc<BrokerTruthCache>,
    pub(crate) stops: StopSynchronizer,
    pub(crate) finalizer: CloseFinalizer,
    pub(crate) gate: EntryGate,
    pub(crate) locks: LockManager,
    pub(crate) run_log: RunLog,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: ManagerConfig,
    pub(crate) ticks: TickConfig,
    pub(crate) notify_ttl_secs: u64,
    pub(crate) owner: String,
}

impl std::fmt::Debug for AutoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoManager")
            .field("owner", &self.owner)
            .field("lock_key", &self.config.lock_key)
            .finish_non_exhaustive()
    }
}

impl AutoManager {
    /// # Errors
    /// `Configuration` when the guardrail timezone is invalid.
    pub fn new(deps: ManagerDeps, config: &AppConfig, owner: &str) -> Result<Self, StoreError> {
        let manager = &config.manager;
        let timeout = StdDuration::from_millis(manager.broker_timeout_ms);
        let truth = Arc::new(BrokerTruthCache::new(
            Arc::clone(&deps.broker),
            StdDuration::from_secs(manager.broker_truth_ttl_secs),
            timeout,
        ));
        let guardrails = GuardrailStore::new(deps.kv.clone(), config.guardrails.clone())?;
        let gate = EntryGate::new(
            guardrails,
            Arc::clone(&truth),
            Arc::clone(&deps.trades),
            Arc::clone(&deps.notifier),
            manager.r_clamp_abs,
            config.notify.dedupe_ttl_secs,
        );

        Ok(Self {
            stops: StopSynchronizer::new(Arc::clone(&deps.broker), config.ticks.clone(), timeout),
            finalizer: CloseFinalizer::new(
                Arc::clone(&deps.broker),
                timeout,
                Duration::minutes(manager.fill_window_pad_minutes),
            ),
            locks: LockManager::new(deps.kv.clone()),
            run_log: RunLog::new(deps.kv, manager.run_log_max),
            broker: deps.broker,
            trades: deps.trades,
            truth,
            gate,
            notifier: deps.notifier,
            config: manager.clone(),
            ticks: config.ticks.clone(),
            notify_ttl_secs: config.notify.dedupe_ttl_secs,
            owner: owner.to_string(),
        })
    }

    #[must_use]
    pub fn entry_gate(&self) -> &EntryGate {
        &self.gate
    }

    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[must_use]
    pub fn broker_truth(&self) -> &BrokerTruthCache {
        &self.truth
    }

    #[must_use]
    pub fn stop_synchronizer(&self) -> &StopSynchronizer {
        &self.stops
    }

    #[must_use]
    pub fn finalizer(&self) -> &CloseFinalizer {
        &self.finalizer
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Most recent run summaries, newest first.
    ///
    /// # Errors
    /// Store errors.
    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        self.run_log.recent(limit).await
    }

    /// One guarded auto-manage pass. Returns at once with `Locked` when
    /// another run holds the lock.
    pub async fn run_auto_manage(&self, now: DateTime<Utc>) -> RunSummary {
        let run_id = Uuid::new_v4().to_string();
        let outcome = self
            .locks
            .with_lock(&self.config.lock_key, self.config.lock_ttl_secs, &self.owner, || {
                self.run_pass(run_id.clone(), now)
            })
            .await;

        let mut summary = match outcome {
            LockOutcome::Acquired(summary) => summary,
            LockOutcome::Locked { holder } => {
                info!(%run_id, holder = holder.as_deref().unwrap_or("?"), "auto-manage skipped: locked");
                let mut summary = RunSummary::new(run_id, &self.owner, RunStatus::Locked, now);
                summary.detail = holder.map(|h| format!("held by {h}"));
                summary
            }
            LockOutcome::Unavailable(reason) => {
                warn!(%run_id, %reason, "auto-manage skipped: lock unavailable");
                let mut summary = RunSummary::new(run_id, &self.owner, RunStatus::Unavailable, now);
                summary.detail = Some(reason);
                summary
            }
        };
        summary.finished_at = Utc::now().max(summary.started_at);

        if let Err(e) = self.run_log.push(&summary).await {
            warn!(run_id = %summary.run_id, error = %e, "run summary not recorded");
        }
        summary
    }

    async fn run_pass(&self, run_id: String, now: DateTime<Utc>) -> RunSummary {
        let mut summary = RunSummary::new(run_id, &self.owner, RunStatus::Completed, now);

        let truth = self.truth.fetch().await;
        if let Some(err) = &truth.positions_error {
            error!(run_id = %summary.run_id, error = %err, "broker positions unavailable, pass aborted");
            summary.status = RunStatus::BrokerUnavailable;
            summary.detail = Some(err.clone());
            return summary;
        }

        let open = match self.trades.list_by_status(TradeStatus::Open).await {
            Ok(open) => open,
            Err(e) => {
                error!(run_id = %summary.run_id, error = %e, "open trades unavailable, pass aborted");
                summary.counts.errors += 1;
                summary.detail = Some(format!("trade store: {e}"));
                return summary;
            }
        };

        let mut mutated = false;
        for selection in group_canonical(&open) {
            summary.counts.checked += 1;
            let Some(canonical) = open.iter().find(|t| t.id == selection.canonical_id) else {
                continue;
            };
            let mut canonical = canonical.clone();
            let duplicates: Vec<Trade> = open
                .iter()
                .filter(|t| selection.duplicate_ids.contains(&t.id))
                .cloned()
                .collect();

            mutated |= self
                .mark_duplicates(&selection, &duplicates, now, &mut summary)
                .await;

            match truth.position(&selection.ticker) {
                None => {
                    mutated |= self
                        .close_broker_flat(&mut canonical, &duplicates, now, &mut summary)
                        .await;
                }
                Some(position) => {
                    if position.is_short() != (canonical.side == Side::Short) {
                        warn!(trade_id = canonical.id, ticker = %selection.ticker, qty = %position.qty, "broker position side disagrees with trade");
                        summary.push(ItemResult::failed(
                            canonical.id,
                            &selection.ticker,
                            "reconcile",
                            format!("side mismatch: trade {} vs broker qty {}", canonical.side, position.qty),
                        ));
                        continue;
                    }
                    mutated |= self
                        .manage_position(&mut canonical, position, &truth, now, &mut summary)
                        .await;
                }
            }
        }

        if mutated {
            self.truth.clear();
        }
        info!(
            run_id = %summary.run_id,
            checked = summary.counts.checked,
            errors = summary.counts.errors,
            "auto-manage pass complete"
        );
        summary
    }

    pub(crate) async fn save(&self, trade: &mut Trade, now: DateTime<Utc>) -> Result<(), StoreError> {
        trade.updated_at = now;
        self.trades.update(trade).await
    }

    async fn mark_duplicates(
        &self,
        selection: &CanonicalSelection,
        duplicates: &[Trade],
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> bool {
        let mut mutated = false;
        for duplicate in duplicates {
            if duplicate.duplicate_of == Some(selection.canonical_id) {
                continue;
            }
            let mut duplicate = duplicate.clone();
            duplicate.duplicate_of = Some(selection.canonical_id);
            match self.save(&mut duplicate, now).await {
                Ok(()) => {
                    info!(trade_id = duplicate.id, canonical_id = selection.canonical_id, ticker = %selection.ticker, "marked duplicate");
                    summary.counts.duplicates += 1;
                    summary.push(ItemResult::ok(
                        duplicate.id,
                        &selection.ticker,
                        "mark_duplicate",
                        format!("duplicate of {}", selection.canonical_id),
                    ));
                    mutated = true;
                }
                Err(e) => summary.push(ItemResult::failed(duplicate.id, &selection.ticker, "mark_duplicate", e.to_string())),
            }
        }
        mutated
    }

    /// The broker has no position: the canonical trade is CLOSED for the
    /// finalizer to reconcile, and its duplicates are DISABLED.
    async fn close_broker_flat(
        &self,
        canonical: &mut Trade,
        duplicates: &[Trade],
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> bool {
        let ticker = canonical.normalized_ticker();
        canonical.status = TradeStatus::Closed;
        canonical.closed_at = Some(now);
        if canonical.close_reason.is_none() {
            canonical.close_reason = Some(CloseReason::BrokerFlat.to_string());
        }
        if let Err(e) = self.save(canonical, now).await {
            summary.push(ItemResult::failed(canonical.id, &ticker, "broker_flat", e.to_string()));
            return false;
        }
        info!(trade_id = canonical.id, %ticker, "no broker position, trade closed for finalization");
        summary.counts.broker_flat += 1;
        summary.push(ItemResult::ok(canonical.id, &ticker, "broker_flat", "closed"));

        for duplicate in duplicates {
            let mut duplicate = duplicate.clone();
            duplicate.status = TradeStatus::Disabled;
            duplicate.duplicate_of = Some(canonical.id);
            duplicate.note = Some(format!("duplicate of {} closed flat", canonical.id));
            match self.save(&mut duplicate, now).await {
                Ok(()) => summary.push(ItemResult::ok(duplicate.id, &ticker, "disable_duplicate", "disabled")),
                Err(e) => summary.push(ItemResult::failed(duplicate.id, &ticker, "disable_duplicate", e.to_string())),
            }
        }
        true
    }

    async fn manage_position(
        &self,
        trade: &mut Trade,
        position: &Position,
        truth: &BrokerTruth,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> bool {
        let ticker = trade.normalized_ticker();
        let price = position.current_price;
        let r = match trade_unrealized_r(trade, price, self.config.r_clamp_abs) {
            Ok(r) => {
                if r.clamped {
                    info!(trade_id = trade.id, %ticker, r = %r.value, "unrealized R clamped");
                }
                Some(r.value)
            }
            Err(reason) => {
                warn!(trade_id = trade.id, %ticker, reason = reason.as_str(), "unrealized R unknown");
                None
            }
        };

        let view = TradeView::of(trade, r);
        if let Some(action) =
            decide_cut_loss_action(self.config.cut_loss_enabled, self.config.cut_loss_threshold_r, &view)
        {
            let item = self.execute_cut_loss(trade, &action, truth, now).await;
            let ok = item.ok;
            if ok {
                summary.counts.cut_loss += 1;
            }
            summary.push(item);
            return ok;
        }

        if let (Some(r), Some(price)) = (r, price) {
            let policy = TrailingPolicy {
                enabled: self.config.trailing_enabled,
                trigger_r: self.config.trail_trigger_r,
                distance_r: self.config.trail_distance_r,
            };
            let tick = tick_for_price(price, &self.ticks);
            if let Some(trail) = decide_trailing_action(&policy, trade, r, price, tick) {
                return self.tighten(trade, trail.new_stop, now, summary).await;
            }
        }

        if self.config.rescue_enabled && truth.orders_error.is_none() {
            let exit = exit_side(trade.side);
            if active_stop_for(&ticker, exit, &truth.orders).is_none() {
                let item = self.rescue(trade, now).await;
                let ok = item.ok;
                if ok {
                    summary.counts.rescued += 1;
                }
                summary.push(item);
                return ok;
            }
        }
        false
    }

    async fn tighten(
        &self,
        trade: &mut Trade,
        new_stop: rust_decimal::Decimal,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> bool {
        let ticker = trade.normalized_ticker();
        match self.stops.sync_stop_for_trade(trade, new_stop).await {
            Ok(result) => {
                trade.stop_price = Some(result.stop_price);
                trade.stop_order_id = Some(result.new_stop_order_id.clone());
                let detail = format!("stop {} ({})", result.stop_price, result.new_stop_order_id);
                match self.save(trade, now).await {
                    Ok(()) => {
                        summary.counts.tightened += 1;
                        summary.push(ItemResult::ok(trade.id, &ticker, "tighten_stop", detail));
                    }
                    Err(e) => summary.push(ItemResult::failed(
                        trade.id,
                        &ticker,
                        "tighten_stop",
                        format!("{detail} placed but not saved: {e}"),
                    )),
                }
                true
            }
            Err(e @ StopSyncError::SubmitFailed { .. }) => {
                summary.push(ItemResult::failed(trade.id, &ticker, "tighten_stop", e.to_string()));
                trade.stop_order_id = None;
                let item = self.rescue(trade, now).await;
                if item.ok {
                    summary.counts.rescued += 1;
                }
                summary.push(item);
                true
            }
            Err(e) => {
                summary.push(ItemResult::failed(
                    trade.id,
                    &ticker,
                    "tighten_stop",
                    format!("{}: {e}", e.as_str()),
                ));
                false
            }
        }
    }

    /// Places a rescue stop and records it on the trade.
    pub(crate) async fn rescue(&self, trade: &mut Trade, now: DateTime<Utc>) -> ItemResult {
        let ticker = trade.normalized_ticker();
        let rescue = match self.stops.rescue_stop(trade).await {
            Ok(rescue) => rescue,
            Err(e) => {
                return ItemResult::failed(trade.id, &ticker, "rescue_stop", format!("{}: {e}", e.as_str()));
            }
        };

        trade.stop_price = Some(rescue.stop_price);
        trade.stop_order_id = Some(rescue.stop_order_id.clone());
        let saved = self.save(trade, now).await;
        self.notifier
            .notify(
                &format!("rescue_stop:{}", trade.id),
                self.notify_ttl_secs,
                &format!("{ticker}: rescue stop placed at {}", rescue.stop_price),
            )
            .await;

        match saved {
            Ok(()) => ItemResult::ok(trade.id, &ticker, "rescue_stop", rescue.stop_order_id),
            Err(e) => ItemResult::failed(
                trade.id,
                &ticker,
                "rescue_stop",
                format!("{} placed but not saved: {e}", rescue.stop_order_id),
            ),
        }
    }

    /// Cancels every live order for the symbol, then flattens the position.
    /// A failed cancel aborts before the close.
    async fn execute_cut_loss(
        &self,
        trade: &mut Trade,
        action: &CutLossAction,
        truth: &BrokerTruth,
        now: DateTime<Utc>,
    ) -> ItemResult {
        let ticker = action.ticker.clone();
        if let Some(err) = &truth.orders_error {
            return ItemResult::failed(trade.id, &ticker, "cut_loss", format!("open orders unknown: {err}"));
        }

        let timeout = StdDuration::from_millis(self.config.broker_timeout_ms);
        for order_id in live_order_ids(&ticker, &truth.orders) {
            match with_deadline(timeout, "cancel_order", self.broker.cancel_order(&order_id)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(trade_id = trade.id, %ticker, %order_id, error = %e, "cut-loss aborted: cancel failed");
                    return ItemResult::failed(
                        trade.id,
                        &ticker,
                        "cut_loss",
                        format!("cancel {order_id} failed: {e}"),
                    );
                }
            }
        }

        let close_order_id = match with_deadline(timeout, "close_position", self.broker.close_position(&ticker)).await {
            Ok(order) => Some(order.id),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(trade_id = trade.id, %ticker, error = %e, "cut-loss close failed");
                return ItemResult::failed(trade.id, &ticker, "cut_loss", format!("close failed: {e}"));
            }
        };

        trade.status = TradeStatus::Closed;
        trade.close_reason = Some(CloseReason::CutLoss.to_string());
        trade.close_order_id = close_order_id.clone();
        trade.closed_at = Some(now);
        let saved = self.save(trade, now).await;

        warn!(trade_id = trade.id, %ticker, r = %action.r, close_order_id = close_order_id.as_deref().unwrap_or("-"), "position flattened by cut-loss");
        self.notifier
            .notify(
                &format!("cut_loss:{}", trade.id),
                self.notify_ttl_secs,
                &format!("{ticker}: cut-loss at {}R, position flattened", action.r.round_dp(2)),
            )
            .await;

        match saved {
            Ok(()) => ItemResult::ok(trade.id, &ticker, "cut_loss", format!("r {}", action.r)),
            Err(e) => ItemResult::failed(trade.id, &ticker, "cut_loss", format!("flattened but not saved: {e}")),
        }
    }
}

/// Non-terminal orders and legs for `symbol`.
fn live_order_ids(symbol: &str, orders: &[Order]) -> Vec<String> {
    orders
        .iter()
        .filter(|o| o.symbol.eq_ignore_ascii_case(symbol))
        .flat_map(|o| std::iter::once(o).chain(o.legs.iter()))
        .filter(|o| !o.status.is_terminal())
        .map(|o| o.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrade_broker::{bracket_parent, resting_stop, OrderSide, OrderStatus};
    use rust_decimal_macros::dec;

    #[test]
    fn live_orders_include_open_legs_only() {
        let orders = vec![
            bracket_parent(
                "p",
                "AAPL",
                OrderSide::Buy,
                dec!(10),
                dec!(100),
                vec![
                    resting_stop("s", "AAPL", OrderSide::Sell, dec!(10), dec!(98), OrderStatus::Held),
                    resting_stop("old", "AAPL", OrderSide::Sell, dec!(10), dec!(97), OrderStatus::Canceled),
                ],
            ),
            resting_stop("m", "MSFT", OrderSide::Sell, dec!(1), dec!(300), OrderStatus::New),
        ];
        assert_eq!(live_order_ids("aapl", &orders), vec!["s".to_string()]);
    }
}
