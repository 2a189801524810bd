//! Operator-triggered passes: stop rescue, close finalization and guardrail reset.
//! Each returns a [`MaintenanceSummary`].

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use tracing::{info, warn};

use autotrade_core::{Trade, TradeSource, TradeStatus};
use autotrade_store::{LockOutcome, ResetOptions};

use crate::canonical::group_canonical;
use crate::finalizer::{FinalizeOutcome, Realized};
use crate::orchestrator::AutoManager;
use crate::stop_sync::{active_stop_for, exit_side};
use crate::types::{CloseReason, ItemResult, MaintenanceSummary};

impl AutoManager {
    fn finalize_lock(&self) -> String {
        format!("{}:finalize", self.config.lock_key)
    }

    fn skipped<T>(summary: MaintenanceSummary, outcome: LockOutcome<T>) -> MaintenanceSummary {
        let note = match outcome {
            LockOutcome::Locked { holder } => {
                format!("locked by {}", holder.as_deref().unwrap_or("unknown"))
            }
            LockOutcome::Unavailable(reason) => format!("lock unavailable: {reason}"),
            LockOutcome::Acquired(_) => "acquired".to_string(),
        };
        info!(operation = %summary.operation, %note, "maintenance skipped");
        summary.skipped(note).finish()
    }

    /// Places rescue stops on every canonical open trade whose broker
    /// position has no active protective stop. Runs under the auto-manage lock.
    pub async fn rescue_missing_stops(&self, now: DateTime<Utc>) -> MaintenanceSummary {
        let outcome = self
            .locks
            .with_lock(&self.config.lock_key, self.config.lock_ttl_secs, &self.owner, || {
                self.rescue_pass(now)
            })
            .await;
        match outcome {
            LockOutcome::Acquired(summary) => summary,
            other => Self::skipped(MaintenanceSummary::start("rescue_stops", now), other),
        }
    }

    async fn rescue_pass(&self, now: DateTime<Utc>) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::start("rescue_stops", now);
        self.truth.clear();
        let truth = self.truth.fetch().await;
        if let Some(err) = truth.error() {
            summary.errors += 1;
            return summary.skipped(format!("broker truth incomplete: {err}")).finish();
        }

        let open = match self.trades.list_by_status(TradeStatus::Open).await {
            Ok(open) => open,
            Err(e) => {
                summary.errors += 1;
                return summary.skipped(format!("trade store: {e}")).finish();
            }
        };

        for selection in group_canonical(&open) {
            let Some(trade) = open.iter().find(|t| t.id == selection.canonical_id) else {
                continue;
            };
            if truth.position(&selection.ticker).is_none() {
                continue;
            }
            summary.checked += 1;
            if active_stop_for(&selection.ticker, exit_side(trade.side), &truth.orders).is_some() {
                continue;
            }
            let mut trade = trade.clone();
            summary.push(self.rescue(&mut trade, now).await);
        }

        if summary.updated > 0 {
            self.truth.clear();
        }
        summary.finish()
    }

    /// Reconciles recently closed, unfinalized trades against the fill feed.
    pub async fn finalize_recent_closes(&self, now: DateTime<Utc>) -> MaintenanceSummary {
        let lock = self.finalize_lock();
        let outcome = self
            .locks
            .with_lock(&lock, self.config.lock_ttl_secs, &self.owner, || {
                self.finalize_pass(now)
            })
            .await;
        match outcome {
            LockOutcome::Acquired(summary) => summary,
            other => Self::skipped(MaintenanceSummary::start("finalize", now), other),
        }
    }

    async fn finalize_pass(&self, now: DateTime<Utc>) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::start("finalize", now);
        let since = now - Duration::hours(self.config.finalize_lookback_hours);
        let closed = match self.trades.list_closed_unfinalized(since).await {
            Ok(closed) => closed,
            Err(e) => {
                summary.errors += 1;
                return summary.skipped(format!("trade store: {e}")).finish();
            }
        };

        summary.checked = closed.len();
        for trade in closed {
            let outcome = self.finalizer.finalize_trade_close(&trade, now).await;
            let item = self.apply_outcome(trade, outcome, now).await;
            summary.push(item);
        }
        summary.finish()
    }

    async fn apply_outcome(
        &self,
        mut trade: Trade,
        outcome: FinalizeOutcome,
        now: DateTime<Utc>,
    ) -> ItemResult {
        let ticker = trade.normalized_ticker();
        let action = outcome.as_str();
        let (message, detail) = match &outcome {
            FinalizeOutcome::Error { message } => {
                return ItemResult::failed(trade.id, &ticker, action, message.clone());
            }
            FinalizeOutcome::Voided => {
                trade.status = TradeStatus::Disabled;
                trade.finalized_at = Some(now);
                trade.note = Some("void: no entry fill at the broker".to_string());
                (
                    format!("{ticker}: trade {} voided, no entry fill found", trade.id),
                    "disabled".to_string(),
                )
            }
            FinalizeOutcome::Reopened { entry_qty } => {
                trade.status = TradeStatus::Open;
                trade.closed_at = None;
                trade.close_reason = None;
                (
                    format!("{ticker}: trade {} reopened, {entry_qty} entered and no exit fill", trade.id),
                    "reopened".to_string(),
                )
            }
            FinalizeOutcome::Finalized(realized) => {
                apply_realized(&mut trade, realized, now);
                (
                    format!(
                        "{ticker}: closed {} PnL {} ({}R)",
                        realized.close_reason,
                        realized.pnl.round_dp(2),
                        realized.r.round_dp(2)
                    ),
                    format!("pnl {} r {}", realized.pnl, realized.r),
                )
            }
        };

        if let Err(e) = self.save(&mut trade, now).await {
            warn!(trade_id = trade.id, %ticker, error = %e, "finalize result not saved");
            return ItemResult::failed(trade.id, &ticker, action, format!("not saved: {e}"));
        }

        if let FinalizeOutcome::Finalized(realized) = &outcome {
            self.record_result(&trade, realized, now).await;
        }
        self.notifier
            .notify(
                &format!("finalize:{}:{action}", trade.id),
                self.notify_ttl_secs,
                &message,
            )
            .await;
        ItemResult::ok(trade.id, &ticker, action, detail)
    }

    /// Feeds an automated trade's result into the guardrails.
    async fn record_result(&self, trade: &Trade, realized: &Realized, now: DateTime<Utc>) {
        if trade.source != TradeSource::AutoEntry {
            return;
        }
        let result = match realized.pnl.cmp(&Decimal::ZERO) {
            Ordering::Less => self
                .gate
                .record_failure(Some(trade.closed_at.unwrap_or(now)), now)
                .await
                .map(|_| ()),
            Ordering::Greater => self.gate.guardrails().record_success(now).await,
            Ordering::Equal => Ok(()),
        };
        if let Err(e) = result {
            warn!(trade_id = trade.id, error = %e, "guardrail update after close failed");
        }
    }

    /// Selectively resets today's guardrail counters.
    pub async fn reset_guardrails(&self, options: ResetOptions, now: DateTime<Utc>) -> MaintenanceSummary {
        let mut summary = MaintenanceSummary::start("reset_guardrails", now);
        summary.checked = 1;
        match self.gate.guardrails().reset(options, now).await {
            Ok(reset) => {
                for field in reset.cleared {
                    summary.push(ItemResult {
                        trade_id: None,
                        ticker: String::new(),
                        action: "reset".to_string(),
                        ok: true,
                        detail: Some(format!("{} {field}", reset.day)),
                    });
                }
            }
            Err(e) => summary.push(ItemResult {
                trade_id: None,
                ticker: String::new(),
                action: "reset".to_string(),
                ok: false,
                detail: Some(e.to_string()),
            }),
        }
        summary.finish()
    }
}

fn apply_realized(trade: &mut Trade, realized: &Realized, now: DateTime<Utc>) {
    trade.realized_pnl = Some(realized.pnl);
    trade.realized_r = Some(realized.r);
    trade.exit_price = Some(realized.exit_vwap);
    let keep_existing = realized.close_reason == CloseReason::ExitFill && trade.close_reason.is_some();
    if !keep_existing {
        trade.close_reason = Some(realized.close_reason.to_string());
    }
    if trade.closed_at.is_none() {
        trade.closed_at = Some(now);
    }
    trade.finalized_at = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use autotrade_core::Side;
    use rust_decimal_macros::dec;

    fn realized(reason: CloseReason) -> Realized {
        Realized {
            pnl: dec!(20),
            r: dec!(1),
            entry_vwap: dec!(100),
            exit_vwap: dec!(102),
            matched_qty: dec!(10),
            close_reason: reason,
        }
    }

    #[test]
    fn generic_exit_keeps_known_reason() {
        let now = Utc::now();
        let mut trade = Trade::new(1, "AAPL", Side::Long, now).with_status(TradeStatus::Closed);
        trade.close_reason = Some("cut_loss".to_string());
        apply_realized(&mut trade, &realized(CloseReason::ExitFill), now);
        assert_eq!(trade.close_reason.as_deref(), Some("cut_loss"));
        assert_eq!(trade.exit_price, Some(dec!(102)));
        assert_eq!(trade.finalized_at, Some(now));

        apply_realized(&mut trade, &realized(CloseReason::StopLoss), now);
        assert_eq!(trade.close_reason.as_deref(), Some("stop_loss"));
    }
}
