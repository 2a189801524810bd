//! Per-trading-day guardrail counters and the global auto-entry switch.
//!
//! One hash per trading day (`guardrails:YYYY-MM-DD`, day taken in the
//! configured exchange timezone) holds the counters. Every mutation refreshes
//! the key's expiry to the retention window so old days disappear on their own.

use autotrade_core::GuardrailConfig;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::kv::KvStore;

const ENTRIES_TODAY: &str = "entries_today";
const LAST_ENTRY_AT: &str = "last_entry_at";
const LAST_LOSS_AT: &str = "last_loss_at";
const CONSECUTIVE_FAILURES: &str = "consecutive_failures";
const AUTO_DISABLED_REASON: &str = "auto_disabled_reason";
const TICKER_PREFIX: &str = "ticker:";

const AUTO_ENTRY_KEY: &str = "guardrails:auto_entry";
const AUTO_ENTRY_ENABLED: &str = "enabled";
const AUTO_ENTRY_REASON: &str = "reason";
const AUTO_ENTRY_UPDATED_AT: &str = "updated_at";

/// Snapshot of one trading day plus the global switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailState {
    pub day: NaiveDate,
    pub entries_today: i64,
    pub last_entry_at: Option<DateTime<Utc>>,
    pub last_loss_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub auto_disabled_reason: Option<String>,
    /// Ticker -> last automated entry.
    pub ticker_entries: BTreeMap<String, DateTime<Utc>>,
    pub auto_entry_enabled: bool,
    pub auto_entry_reason: Option<String>,
    /// False when the store is absent or failed; the state is then the disabled default.
    pub store_available: bool,
    pub error: Option<String>,
}

impl GuardrailState {
    fn unavailable(day: NaiveDate, error: Option<String>) -> Self {
        Self {
            day,
            entries_today: 0,
            last_entry_at: None,
            last_loss_at: None,
            consecutive_failures: 0,
            auto_disabled_reason: None,
            ticker_entries: BTreeMap::new(),
            auto_entry_enabled: false,
            auto_entry_reason: Some("guardrail store unavailable".to_string()),
            store_available: false,
            error,
        }
    }
}

/// Global auto-entry switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoEntryFlag {
    pub enabled: bool,
    pub reason: Option<String>,
    /// False when the configured default applied.
    pub explicit: bool,
}

/// What [`GuardrailStore::reset`] clears.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetOptions {
    /// Entries counter, last-entry time and per-ticker entries.
    pub entries: bool,
    pub failures: bool,
    pub auto_disabled: bool,
    pub last_loss: bool,
}

impl ResetOptions {
    #[must_use]
    pub fn all() -> Self {
        Self {
            entries: true,
            failures: true,
            auto_disabled: true,
            last_loss: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetSummary {
    pub day: NaiveDate,
    pub cleared: Vec<String>,
}

#[derive(Clone)]
pub struct GuardrailStore {
    kv: Option<Arc<dyn KvStore>>,
    config: GuardrailConfig,
    tz: Tz,
}

impl std::fmt::Debug for GuardrailStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardrailStore")
            .field("store", &self.kv.is_some())
            .field("tz", &self.tz)
            .finish_non_exhaustive()
    }
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn parse_count(hash: &HashMap<String, String>, field: &str) -> i64 {
    hash.get(field)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0)
}

impl GuardrailStore {
    /// # Errors
    /// `Configuration` when the timezone is not a valid IANA name.
    pub fn new(kv: Option<Arc<dyn KvStore>>, config: GuardrailConfig) -> Result<Self> {
        let tz: Tz = config.timezone.parse().map_err(|_| {
            StoreError::Configuration(format!("unknown timezone {:?}", config.timezone))
        })?;
        Ok(Self { kv, config, tz })
    }

    #[must_use]
    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Calendar day of `now` in the exchange timezone.
    #[must_use]
    pub fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    #[must_use]
    pub fn day_key(day: NaiveDate) -> String {
        format!("guardrails:{}", day.format("%Y-%m-%d"))
    }

    fn retention_secs(&self) -> u64 {
        self.config.retention_days.max(1) * 86_400
    }

    fn store(&self) -> Result<&Arc<dyn KvStore>> {
        self.kv
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("no shared store configured".to_string()))
    }

    async fn touch(&self, kv: &Arc<dyn KvStore>, key: &str) -> Result<()> {
        kv.expire(key, self.retention_secs()).await?;
        Ok(())
    }

    /// Counts an automated entry for `ticker`. Returns the new entries-today count.
    ///
    /// # Errors
    /// Store errors.
    pub async fn record_entry(&self, ticker: &str, now: DateTime<Utc>) -> Result<i64> {
        let kv = self.store()?;
        let key = Self::day_key(self.trading_day(now));
        let ts = now.to_rfc3339();
        let ticker = ticker.trim().to_uppercase();

        let entries = kv.hincr(&key, ENTRIES_TODAY, 1).await?;
        kv.hset(&key, LAST_ENTRY_AT, &ts).await?;
        kv.hset(&key, &format!("{TICKER_PREFIX}{ticker}"), &ts).await?;
        self.touch(kv, &key).await?;

        info!(%ticker, entries_today = entries, "guardrail entry recorded");
        Ok(entries)
    }

    /// Counts a failure, optionally stamping a loss. Returns the consecutive-failure count.
    ///
    /// # Errors
    /// Store errors.
    pub async fn record_failure(
        &self,
        loss_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let kv = self.store()?;
        let key = Self::day_key(self.trading_day(now));

        let failures = kv.hincr(&key, CONSECUTIVE_FAILURES, 1).await?;
        if let Some(at) = loss_at {
            kv.hset(&key, LAST_LOSS_AT, &at.to_rfc3339()).await?;
        }
        self.touch(kv, &key).await?;

        warn!(consecutive_failures = failures, loss = loss_at.is_some(), "guardrail failure recorded");
        Ok(failures)
    }

    /// Clears the consecutive-failure streak after a winning close.
    ///
    /// # Errors
    /// Store errors.
    pub async fn record_success(&self, now: DateTime<Utc>) -> Result<()> {
        let kv = self.store()?;
        let key = Self::day_key(self.trading_day(now));
        kv.hset(&key, CONSECUTIVE_FAILURES, "0").await?;
        self.touch(kv, &key).await
    }

    /// Sets or clears the day's auto-disabled reason.
    ///
    /// # Errors
    /// Store errors.
    pub async fn set_auto_disabled(&self, reason: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let kv = self.store()?;
        let key = Self::day_key(self.trading_day(now));
        match reason {
            Some(reason) => {
                kv.hset(&key, AUTO_DISABLED_REASON, reason).await?;
                warn!(%reason, "auto-entry disabled for the day");
            }
            None => {
                kv.hdel(&key, &[AUTO_DISABLED_REASON]).await?;
                info!("day auto-disable cleared");
            }
        }
        self.touch(kv, &key).await
    }

    /// Selectively resets the day's counters.
    ///
    /// # Errors
    /// Store errors.
    pub async fn reset(&self, options: ResetOptions, now: DateTime<Utc>) -> Result<ResetSummary> {
        let kv = self.store()?;
        let day = self.trading_day(now);
        let key = Self::day_key(day);
        let mut cleared = Vec::new();

        if options.entries {
            kv.hset(&key, ENTRIES_TODAY, "0").await?;
            let hash = kv.hget_all(&key).await?;
            let mut fields: Vec<&str> = hash
                .keys()
                .filter(|f| f.starts_with(TICKER_PREFIX))
                .map(String::as_str)
                .collect();
            fields.push(LAST_ENTRY_AT);
            kv.hdel(&key, &fields).await?;
            cleared.push(ENTRIES_TODAY.to_string());
        }
        if options.failures {
            kv.hset(&key, CONSECUTIVE_FAILURES, "0").await?;
            cleared.push(CONSECUTIVE_FAILURES.to_string());
        }
        if options.auto_disabled {
            kv.hdel(&key, &[AUTO_DISABLED_REASON]).await?;
            cleared.push(AUTO_DISABLED_REASON.to_string());
        }
        if options.last_loss {
            kv.hdel(&key, &[LAST_LOSS_AT]).await?;
            cleared.push(LAST_LOSS_AT.to_string());
        }
        self.touch(kv, &key).await?;

        info!(%day, ?cleared, "guardrails reset");
        Ok(ResetSummary { day, cleared })
    }

    /// Reads the global switch, falling back to the configured default when unset.
    ///
    /// # Errors
    /// Store errors.
    pub async fn auto_entry(&self) -> Result<AutoEntryFlag> {
        let kv = self.store()?;
        let hash = kv.hget_all(AUTO_ENTRY_KEY).await?;
        let explicit = hash
            .get(AUTO_ENTRY_ENABLED)
            .map(|v| matches!(v.trim(), "1" | "true"));
        Ok(AutoEntryFlag {
            enabled: explicit.unwrap_or(self.config.auto_entry_default_enabled),
            reason: hash.get(AUTO_ENTRY_REASON).filter(|r| !r.is_empty()).cloned(),
            explicit: explicit.is_some(),
        })
    }

    /// Sets the global switch. It has no expiry.
    ///
    /// # Errors
    /// Store errors.
    pub async fn set_auto_entry(
        &self,
        enabled: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let kv = self.store()?;
        kv.hset(AUTO_ENTRY_KEY, AUTO_ENTRY_ENABLED, if enabled { "1" } else { "0" })
            .await?;
        match reason {
            Some(reason) => kv.hset(AUTO_ENTRY_KEY, AUTO_ENTRY_REASON, reason).await?,
            None => kv.hdel(AUTO_ENTRY_KEY, &[AUTO_ENTRY_REASON]).await?,
        }
        kv.hset(AUTO_ENTRY_KEY, AUTO_ENTRY_UPDATED_AT, &now.to_rfc3339())
            .await?;
        info!(enabled, reason = reason.unwrap_or(""), "auto-entry switch set");
        Ok(())
    }

    /// Current state. Never fails: without a working store it reports the
    /// disabled default with `store_available = false`.
    pub async fn state(&self, now: DateTime<Utc>) -> GuardrailState {
        let day = self.trading_day(now);
        if self.kv.is_none() {
            return GuardrailState::unavailable(day, None);
        }
        match self.read_state(day).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "guardrail state read failed");
                GuardrailState::unavailable(day, Some(e.to_string()))
            }
        }
    }

    async fn read_state(&self, day: NaiveDate) -> Result<GuardrailState> {
        let kv = self.store()?;
        let hash = kv.hget_all(&Self::day_key(day)).await?;
        let flag = self.auto_entry().await?;

        let ticker_entries = hash
            .iter()
            .filter_map(|(field, value)| {
                let ticker = field.strip_prefix(TICKER_PREFIX)?;
                Some((ticker.to_string(), parse_ts(value)?))
            })
            .collect();

        Ok(GuardrailState {
            day,
            entries_today: parse_count(&hash, ENTRIES_TODAY),
            last_entry_at: hash.get(LAST_ENTRY_AT).and_then(|v| parse_ts(v)),
            last_loss_at: hash.get(LAST_LOSS_AT).and_then(|v| parse_ts(v)),
            consecutive_failures: parse_count(&hash, CONSECUTIVE_FAILURES),
            auto_disabled_reason: hash
                .get(AUTO_DISABLED_REASON)
                .filter(|r| !r.is_empty())
                .cloned(),
            ticker_entries,
            auto_entry_enabled: flag.enabled,
            auto_entry_reason: flag.reason,
            store_available: true,
            error: None,
        })
    }
}
