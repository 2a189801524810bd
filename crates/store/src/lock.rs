//! Named, TTL-bounded mutual exclusion in the shared store.
//!
//! A lock is the key `lock:{name}` holding a token unique to one acquisition.
//! Only the holder presenting that token can release it; a crashed holder's
//! lock simply expires.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::kv::KvStore;

/// Result of [`LockManager::with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was held for the duration of the closure, which returned `T`.
    Acquired(T),
    /// Someone else holds the lock; the closure did not run.
    Locked { holder: Option<String> },
    /// No store, or it failed; the closure did not run.
    Unavailable(String),
}

impl<T> LockOutcome<T> {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquired(_) => "acquired",
            Self::Locked { .. } => "locked",
            Self::Unavailable(_) => "unavailable",
        }
    }

    #[must_use]
    pub fn acquired(self) -> Option<T> {
        match self {
            Self::Acquired(value) => Some(value),
            _ => None,
        }
    }
}

/// Current state of a lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub key: String,
    pub holder: Option<String>,
    pub ttl_secs: Option<u64>,
}

#[derive(Clone)]
pub struct LockManager {
    kv: Option<Arc<dyn KvStore>>,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("store", &self.kv.is_some())
            .finish()
    }
}

impl LockManager {
    #[must_use]
    pub fn new(kv: Option<Arc<dyn KvStore>>) -> Self {
        Self { kv }
    }

    #[must_use]
    pub fn lock_key(name: &str) -> String {
        format!("lock:{name}")
    }

    /// Runs `f` while holding the named lock.
    ///
    /// Never waits: if the lock is taken the call returns `Locked` at once.
    /// After `f` completes the lock is released only if it still holds this
    /// acquisition's token.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        ttl_secs: u64,
        owner: &str,
        f: F,
    ) -> LockOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(kv) = &self.kv else {
            return LockOutcome::Unavailable("no shared store configured".to_string());
        };
        let key = Self::lock_key(name);
        let token = format!("{owner}:{}", Uuid::new_v4());

        match kv.set_nx_ex(&key, &token, ttl_secs).await {
            Ok(true) => {}
            Ok(false) => {
                let holder = kv.get(&key).await.ok().flatten();
                debug!(%key, holder = holder.as_deref().unwrap_or("?"), "lock held elsewhere");
                return LockOutcome::Locked { holder };
            }
            Err(e) => {
                warn!(%key, error = %e, "lock store unavailable");
                return LockOutcome::Unavailable(e.to_string());
            }
        }

        debug!(%key, %token, ttl_secs, "lock acquired");
        let value = f().await;

        match kv.delete_if_equals(&key, &token).await {
            Ok(true) => debug!(%key, "lock released"),
            Ok(false) => warn!(%key, "lock expired or was taken over before release"),
            Err(e) => warn!(%key, error = %e, "lock release failed; it will expire"),
        }

        LockOutcome::Acquired(value)
    }

    /// Reports the holder and remaining TTL of a lock.
    ///
    /// # Errors
    /// `Unavailable` without a store; backend errors otherwise.
    pub async fn inspect(&self, name: &str) -> Result<LockInfo> {
        let kv = self.store()?;
        let key = Self::lock_key(name);
        let holder = kv.get(&key).await?;
        let ttl_secs = if holder.is_some() {
            kv.ttl(&key).await?
        } else {
            None
        };
        Ok(LockInfo {
            key,
            holder,
            ttl_secs,
        })
    }

    /// Deletes a lock regardless of holder. For manual recovery only.
    ///
    /// # Errors
    /// `Unavailable` without a store; backend errors otherwise.
    pub async fn force_unlock(&self, name: &str) -> Result<bool> {
        let kv = self.store()?;
        let key = Self::lock_key(name);
        let removed = kv.del(&key).await?;
        info!(%key, removed, "lock force-unlocked");
        Ok(removed)
    }

    fn store(&self) -> Result<&Arc<dyn KvStore>> {
        self.kv
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("no shared store configured".to_string()))
    }
}
