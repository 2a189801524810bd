//! Risk-multiple (R) math and replacement decisions. No I/O.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trade::Side;

/// Why an R value could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidR {
    #[error("invalid_side")]
    InvalidSide,
    #[error("missing_price")]
    MissingPrice,
    #[error("non_positive_price")]
    NonPositivePrice,
    #[error("non_positive_risk")]
    NonPositiveRisk,
}

impl InvalidR {
    /// Stable reason code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSide => "invalid_side",
            Self::MissingPrice => "missing_price",
            Self::NonPositivePrice => "non_positive_price",
            Self::NonPositiveRisk => "non_positive_risk",
        }
    }
}

/// A computed, signed R. Positive when price moved in the trade's favour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnrealizedR {
    pub value: Decimal,
    /// The raw value exceeded the clamp and was limited to it.
    pub clamped: bool,
}

impl UnrealizedR {
    /// Informational reason code, set only when clamped.
    #[must_use]
    pub fn reason(&self) -> Option<&'static str> {
        self.clamped.then_some("clamped")
    }
}

/// Unrealized R of a position.
///
/// Risk per share is `|entry - stop|` oriented by side, so a stop on the
/// wrong side of entry yields `NonPositiveRisk`.
///
/// # Errors
/// Returns a reason code when side or any price is missing or invalid.
pub fn compute_unrealized_r(
    side: Option<Side>,
    entry_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    current_price: Option<Decimal>,
    clamp_abs: Option<Decimal>,
) -> Result<UnrealizedR, InvalidR> {
    let side = side.ok_or(InvalidR::InvalidSide)?;
    let (Some(entry), Some(stop), Some(current)) = (entry_price, stop_price, current_price) else {
        return Err(InvalidR::MissingPrice);
    };
    if entry <= Decimal::ZERO || stop <= Decimal::ZERO || current <= Decimal::ZERO {
        return Err(InvalidR::NonPositivePrice);
    }

    let risk_per_share = (entry - stop) * side.sign();
    if risk_per_share <= Decimal::ZERO {
        return Err(InvalidR::NonPositiveRisk);
    }

    let raw = (current - entry) * side.sign() / risk_per_share;

    match clamp_abs {
        Some(limit) if limit > Decimal::ZERO && raw.abs() > limit => Ok(UnrealizedR {
            value: if raw.is_sign_negative() { -limit } else { limit },
            clamped: true,
        }),
        _ => Ok(UnrealizedR {
            value: raw,
            clamped: false,
        }),
    }
}

/// Knobs for replacing an open position with a new candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacementPolicy {
    /// Candidate must beat the open score by at least this much.
    pub min_score_delta: Decimal,
    /// Allow replacing a position whose R cannot be computed.
    pub allow_unknown_r_override: bool,
    /// Score delta required when overriding an unknown R.
    pub override_score_delta: Decimal,
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        Self {
            min_score_delta: Decimal::from(10),
            allow_unknown_r_override: false,
            override_score_delta: Decimal::from(25),
        }
    }
}

/// Reason attached to a replacement decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementReason {
    UnknownR,
    UnknownROverride,
    OpenWinning,
    ScoreDeltaTooSmall,
    CandidateBetter,
}

impl ReplacementReason {
    /// Stable reason code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownR => "unknown_r",
            Self::UnknownROverride => "unknown_r_override",
            Self::OpenWinning => "open_winning",
            Self::ScoreDeltaTooSmall => "score_delta_too_small",
            Self::CandidateBetter => "candidate_better",
        }
    }
}

/// Outcome of [`decide_replacement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementDecision {
    pub execute: bool,
    pub reason: ReplacementReason,
    pub score_delta: Decimal,
}

/// Decides whether an open position should give way to a candidate.
///
/// Winners are never abandoned; losers are only replaced by something
/// meaningfully better.
#[must_use]
pub fn decide_replacement(
    open_unrealized_r: Option<Decimal>,
    open_score: Decimal,
    candidate_score: Decimal,
    policy: &ReplacementPolicy,
) -> ReplacementDecision {
    let score_delta = candidate_score - open_score;
    let decision = |execute, reason| ReplacementDecision {
        execute,
        reason,
        score_delta,
    };

    let Some(r) = open_unrealized_r else {
        if policy.allow_unknown_r_override && score_delta >= policy.override_score_delta {
            return decision(true, ReplacementReason::UnknownROverride);
        }
        return decision(false, ReplacementReason::UnknownR);
    };

    if r > Decimal::ZERO {
        return decision(false, ReplacementReason::OpenWinning);
    }
    if score_delta < policy.min_score_delta {
        return decision(false, ReplacementReason::ScoreDeltaTooSmall);
    }
    decision(true, ReplacementReason::CandidateBetter)
}
