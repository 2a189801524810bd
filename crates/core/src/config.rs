use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::ReplacementPolicy;
use crate::tick::TickBand;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub manager: ManagerConfig,
    pub guardrails: GuardrailConfig,
    pub ticks: TickConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    /// HTTP client timeout; per-call hard timeouts live in `ManagerConfig`.
    pub timeout_secs: u64,
    pub requests_per_minute: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://paper-api.alpaca.markets".to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            timeout_secs: 10,
            requests_per_minute: 180,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `None` runs without a shared store: guardrails report disabled, locks unavailable.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

/// Auto-manage pass settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub lock_key: String,
    pub lock_ttl_secs: u64,
    pub broker_truth_ttl_secs: u64,
    /// Hard timeout for each broker call made by the manager.
    pub broker_timeout_ms: u64,
    pub cut_loss_enabled: bool,
    /// Cut when unrealized R is at or below this (e.g. -1.0).
    pub cut_loss_threshold_r: Decimal,
    /// Unrealized R magnitude clamp.
    pub r_clamp_abs: Decimal,
    pub trailing_enabled: bool,
    /// R at which trailing starts.
    pub trail_trigger_r: Decimal,
    /// Trail distance behind current price, in R.
    pub trail_distance_r: Decimal,
    pub rescue_enabled: bool,
    pub run_interval_secs: u64,
    pub run_log_max: usize,
    /// Only closes newer than this are finalized.
    pub finalize_lookback_hours: i64,
    /// Padding around a trade's open/close times when querying fills.
    pub fill_window_pad_minutes: i64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lock_key: "auto-manage".to_string(),
            lock_ttl_secs: 120,
            broker_truth_ttl_secs: 15,
            broker_timeout_ms: 8_000,
            cut_loss_enabled: true,
            cut_loss_threshold_r: Decimal::NEGATIVE_ONE,
            r_clamp_abs: Decimal::from(20),
            trailing_enabled: true,
            trail_trigger_r: Decimal::ONE,
            trail_distance_r: Decimal::ONE,
            rescue_enabled: true,
            run_interval_secs: 60,
            run_log_max: 200,
            finalize_lookback_hours: 72,
            fill_window_pad_minutes: 10,
        }
    }
}

/// Daily safety limits for automated entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// IANA zone that defines the trading day.
    pub timezone: String,
    /// Days a day-key survives after its last write.
    pub retention_days: u64,
    /// Used when no global enable flag has been stored.
    pub auto_entry_default_enabled: bool,
    pub max_entries_per_day: i64,
    pub max_consecutive_failures: i64,
    pub loss_cooldown_minutes: i64,
    pub ticker_cooldown_minutes: i64,
    pub max_open_positions: usize,
    pub replacement: ReplacementPolicy,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            retention_days: 7,
            auto_entry_default_enabled: false,
            max_entries_per_day: 5,
            max_consecutive_failures: 3,
            loss_cooldown_minutes: 30,
            ticker_cooldown_minutes: 240,
            max_open_positions: 5,
            replacement: ReplacementPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    pub bands: Vec<TickBand>,
    pub default_tick: Decimal,
    /// Minimum absolute bracket leg offset.
    pub min_bracket_offset: Decimal,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            bands: vec![TickBand {
                below: Decimal::ONE,
                tick: Decimal::new(1, 4),
            }],
            default_tick: Decimal::new(1, 2),
            min_bracket_offset: Decimal::new(2, 2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub dedupe_ttl_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            dedupe_ttl_secs: 3_600,
        }
    }
}
