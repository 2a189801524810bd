//! Capped list of recent run summaries, newest first.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::kv::KvStore;

pub const DEFAULT_RUN_LOG_KEY: &str = "automanage:runs";

#[derive(Clone)]
pub struct RunLog {
    kv: Option<Arc<dyn KvStore>>,
    key: String,
    max_entries: usize,
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("key", &self.key)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

impl RunLog {
    #[must_use]
    pub fn new(kv: Option<Arc<dyn KvStore>>, max_entries: usize) -> Self {
        Self {
            kv,
            key: DEFAULT_RUN_LOG_KEY.to_string(),
            max_entries: max_entries.max(1),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    fn store(&self) -> Result<&Arc<dyn KvStore>> {
        self.kv
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("no shared store configured".to_string()))
    }

    /// Prepends an entry and trims the list to its cap.
    ///
    /// # Errors
    /// Serialization or store errors.
    pub async fn push<T: Serialize + Sync>(&self, entry: &T) -> Result<()> {
        let kv = self.store()?;
        let json = serde_json::to_string(entry)?;
        kv.lpush(&self.key, &json).await?;
        let last = isize::try_from(self.max_entries).unwrap_or(isize::MAX) - 1;
        kv.ltrim(&self.key, 0, last).await
    }

    /// Up to `limit` most recent entries. Unreadable entries are skipped.
    ///
    /// # Errors
    /// Store errors.
    pub async fn recent<T: DeserializeOwned>(&self, limit: usize) -> Result<Vec<T>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let kv = self.store()?;
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        let raw = kv.lrange(&self.key, 0, stop).await?;
        Ok(raw
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(key = %self.key, error = %e, "skipping unreadable run log entry");
                    None
                }
            })
            .collect())
    }
}
