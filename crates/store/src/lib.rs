//! Shared state for automated position management.
//!
//! - [`KvStore`]: atomic key-value primitives, backed by Redis ([`RedisKv`])
//!   or process memory ([`MemoryKv`])
//! - [`LockManager`]: named TTL locks (`lock:{name}`) with owner-checked release
//! - [`GuardrailStore`]: per-trading-day counters and the global auto-entry switch
//! - [`RunLog`]: capped list of recent run summaries
//! - [`TradeStore`]: trade persistence in Postgres ([`PgTradeStore`]) or memory
//!
//! Every component takes `Option<Arc<dyn KvStore>>`; `None` stands for "no
//! shared store" and degrades to unavailable/disabled results instead of errors
//! that crash a pass.

pub mod error;
pub mod guardrails;
pub mod kv;
pub mod lock;
pub mod runlog;
pub mod trades;

pub use error::{Result, StoreError};
pub use guardrails::{AutoEntryFlag, GuardrailState, GuardrailStore, ResetOptions, ResetSummary};
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use lock::{LockInfo, LockManager, LockOutcome};
pub use runlog::{RunLog, DEFAULT_RUN_LOG_KEY};
pub use trades::{MemoryTradeStore, PgTradeStore, TradeStore};
