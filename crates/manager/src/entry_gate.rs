//! Admission checks for automated entries.
//!
//! Fails closed: a missing guardrail store or an incomplete broker truth
//! blocks the entry.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use autotrade_core::{
    decide_replacement, normalize_ticker, ReplacementDecision, TradeId, TradeStatus,
};
use autotrade_store::{GuardrailState, GuardrailStore, StoreError, TradeStore};

use crate::broker_truth::{BrokerTruth, BrokerTruthCache};
use crate::canonical::group_canonical;
use crate::cut_loss::trade_unrealized_r;
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryBlock {
    StoreUnavailable,
    AutoEntryDisabled,
    DayAutoDisabled,
    MaxEntries,
    MaxFailures,
    LossCooldown,
    TickerCooldown,
    BrokerTruthError,
    PositionExists,
    OpenOrderExists,
    MaxOpenPositions,
}

impl EntryBlock {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StoreUnavailable => "store_unavailable",
            Self::AutoEntryDisabled => "auto_entry_disabled",
            Self::DayAutoDisabled => "day_auto_disabled",
            Self::MaxEntries => "max_entries",
            Self::MaxFailures => "max_failures",
            Self::LossCooldown => "loss_cooldown",
            Self::TickerCooldown => "ticker_cooldown",
            Self::BrokerTruthError => "broker_truth_error",
            Self::PositionExists => "position_exists",
            Self::OpenOrderExists => "open_order_exists",
            Self::MaxOpenPositions => "max_open_positions",
        }
    }
}

impl fmt::Display for EntryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The open trade a candidate would replace, with the decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementCandidate {
    pub trade_id: TradeId,
    pub ticker: String,
    pub unrealized_r: Option<Decimal>,
    pub decision: ReplacementDecision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDecision {
    pub ticker: String,
    pub allowed: bool,
    pub blocked_by: Vec<EntryBlock>,
    /// Set when the book is full; `decision.execute` says whether to replace.
    pub replacement: Option<ReplacementCandidate>,
    pub guardrails: GuardrailState,
    pub broker_error: Option<String>,
}

pub struct EntryGate {
    guardrails: GuardrailStore,
    truth: Arc<BrokerTruthCache>,
    trades: Arc<dyn TradeStore>,
    notifier: Arc<dyn Notifier>,
    r_clamp_abs: Decimal,
    dedupe_ttl_secs: u64,
}

impl fmt::Debug for EntryGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryGate")
            .field("guardrails", &self.guardrails)
            .finish_non_exhaustive()
    }
}

fn cooling_down(since: Option<DateTime<Utc>>, minutes: i64, now: DateTime<Utc>) -> bool {
    match since {
        Some(at) if minutes > 0 => now < at + Duration::minutes(minutes),
        _ => false,
    }
}

impl EntryGate {
    #[must_use]
    pub fn new(
        guardrails: GuardrailStore,
        truth: Arc<BrokerTruthCache>,
        trades: Arc<dyn TradeStore>,
        notifier: Arc<dyn Notifier>,
        r_clamp_abs: Decimal,
        dedupe_ttl_secs: u64,
    ) -> Self {
        Self {
            guardrails,
            truth,
            trades,
            notifier,
            r_clamp_abs,
            dedupe_ttl_secs,
        }
    }

    #[must_use]
    pub fn guardrails(&self) -> &GuardrailStore {
        &self.guardrails
    }

    /// Decides whether an automated entry in `ticker` may be placed now.
    /// Every failing check is reported, not just the first.
    pub async fn check_entry(
        &self,
        ticker: &str,
        candidate_score: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> EntryDecision {
        let ticker = normalize_ticker(ticker);
        let config = self.guardrails.config();
        let state = self.guardrails.state(now).await;
        let mut blocked_by = Vec::new();

        if !state.store_available {
            blocked_by.push(EntryBlock::StoreUnavailable);
        } else {
            if !state.auto_entry_enabled {
                blocked_by.push(EntryBlock::AutoEntryDisabled);
            }
            if state.auto_disabled_reason.is_some() {
                blocked_by.push(EntryBlock::DayAutoDisabled);
            }
            if state.entries_today >= config.max_entries_per_day {
                blocked_by.push(EntryBlock::MaxEntries);
            }
            if state.consecutive_failures >= config.max_consecutive_failures {
                blocked_by.push(EntryBlock::MaxFailures);
            }
            if cooling_down(state.last_loss_at, config.loss_cooldown_minutes, now) {
                blocked_by.push(EntryBlock::LossCooldown);
            }
            let last_ticker_entry = state.ticker_entries.get(&ticker).copied();
            if cooling_down(last_ticker_entry, config.ticker_cooldown_minutes, now) {
                blocked_by.push(EntryBlock::TickerCooldown);
            }
        }

        let truth = self.truth.fetch().await;
        let mut replacement = None;
        if truth.is_clean() {
            if truth.position(&ticker).is_some() {
                blocked_by.push(EntryBlock::PositionExists);
            }
            if truth.has_open_order(&ticker) {
                blocked_by.push(EntryBlock::OpenOrderExists);
            }
            if truth.positions.len() >= config.max_open_positions {
                replacement = self
                    .weakest_replacement(&truth, candidate_score.unwrap_or(Decimal::ZERO))
                    .await;
                if !replacement.as_ref().is_some_and(|r| r.decision.execute) {
                    blocked_by.push(EntryBlock::MaxOpenPositions);
                }
            }
        } else {
            blocked_by.push(EntryBlock::BrokerTruthError);
        }

        let allowed = blocked_by.is_empty();
        if allowed {
            info!(%ticker, replace = ?replacement.as_ref().map(|r| r.trade_id), "entry allowed");
        } else {
            let codes: Vec<&str> = blocked_by.iter().map(EntryBlock::as_str).collect();
            info!(%ticker, blocked_by = ?codes, "entry blocked");
        }

        EntryDecision {
            ticker,
            allowed,
            blocked_by,
            replacement,
            guardrails: state,
            broker_error: truth.error(),
        }
    }

    /// Runs the replacement rule against the weakest canonical open trade:
    /// lowest known R, or an unknown-R trade when none is known.
    async fn weakest_replacement(
        &self,
        truth: &BrokerTruth,
        candidate_score: Decimal,
    ) -> Option<ReplacementCandidate> {
        let open = match self.trades.list_by_status(TradeStatus::Open).await {
            Ok(open) => open,
            Err(e) => {
                warn!(error = %e, "cannot load open trades for replacement");
                return None;
            }
        };
        let canonical_ids: Vec<TradeId> = group_canonical(&open)
            .into_iter()
            .map(|s| s.canonical_id)
            .collect();

        let weakest = open
            .iter()
            .filter(|t| canonical_ids.contains(&t.id))
            .filter_map(|trade| {
                let position = truth.position(&trade.ticker)?;
                let price = position.current_price;
                let r = trade_unrealized_r(trade, price, self.r_clamp_abs)
                    .ok()
                    .map(|r| r.value);
                Some((trade, r))
            })
            .min_by(|(a, ra), (b, rb)| match (ra, rb) {
                (Some(x), Some(y)) => x.cmp(y).then(a.id.cmp(&b.id)),
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, None) => a.id.cmp(&b.id),
            })?;

        let (trade, r) = weakest;
        let decision = decide_replacement(
            r,
            trade.score.unwrap_or(Decimal::ZERO),
            candidate_score,
            &self.guardrails.config().replacement,
        );
        info!(
            trade_id = trade.id,
            ticker = %trade.ticker,
            execute = decision.execute,
            reason = decision.reason.as_str(),
            "replacement evaluated"
        );
        Some(ReplacementCandidate {
            trade_id: trade.id,
            ticker: trade.normalized_ticker(),
            unrealized_r: r,
            decision,
        })
    }

    /// Counts an automated entry.
    ///
    /// # Errors
    /// Store errors.
    pub async fn record_entry(&self, ticker: &str, now: DateTime<Utc>) -> Result<i64, StoreError> {
        self.guardrails.record_entry(ticker, now).await
    }

    /// Counts a failure; reaching the cap auto-disables entries for the day
    /// and tells a human.
    ///
    /// # Errors
    /// Store errors.
    pub async fn record_failure(
        &self,
        loss_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let failures = self.guardrails.record_failure(loss_at, now).await?;
        let cap = self.guardrails.config().max_consecutive_failures;
        if cap > 0 && failures >= cap {
            let reason = format!("{failures} consecutive failures");
            self.guardrails.set_auto_disabled(Some(&reason), now).await?;
            let day = self.guardrails.trading_day(now);
            warn!(%day, failures, "automated entries disabled for the day");
            self.notifier
                .notify(
                    &format!("guardrails:auto_disabled:{day}"),
                    self.dedupe_ttl_secs,
                    &format!("Auto-entry disabled for {day}: {reason}"),
                )
                .await;
        }
        Ok(failures)
    }
}
