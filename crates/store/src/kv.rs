//! Shared key-value store.
//!
//! The primitives are the ones Redis offers atomically: conditional
//! set-with-expiry, compare-and-delete, hash increment and capped lists.
//! [`RedisKv`] is the production backend; [`MemoryKv`] is a process-local
//! stand-in for tests and single-process dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::error::{Result, StoreError};

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Sets `key` only if absent, with a TTL. Returns whether it was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Returns whether a key was removed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Atomically deletes `key` only if it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Remaining TTL in seconds; `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<u64>>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    /// Atomic hash-field increment, returning the new value.
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()>;

    async fn lpush(&self, key: &str, value: &str) -> Result<()>;

    /// Inclusive range; negative indexes count from the tail.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;
}

// =============================================================================
// Redis
// =============================================================================

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis backend over a multiplexed async connection.
#[derive(Clone)]
pub struct RedisKv {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}

impl RedisKv {
    /// Connects and verifies the connection.
    ///
    /// # Errors
    /// `Unavailable` when the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Configuration(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis connect failed: {e}")))?;
        info!("redis connection established");
        Ok(Self { conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        // -2 missing, -1 no expiry
        Ok(u64::try_from(ttl).ok())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn();
        let set: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(map)
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let values: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.conn();
        let () = redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expire_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expire_at.is_some_and(|at| now >= at)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

/// Resolves Redis-style inclusive, possibly negative, bounds.
fn list_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

/// Process-local [`KvStore`] with lazy expiry.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    offline: Mutex<bool>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `Unavailable` while set.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<()> {
        if *self.offline.lock() {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    /// Runs `f` against the live (non-expired) entry map.
    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T>) -> Result<T> {
        self.check_online()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| !e.is_expired(now));
        f(&mut entries)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expire_at: Some(Instant::now() + Duration::from_secs(ttl_secs.max(1))),
                },
            );
            debug!(key, "memory set_nx_ex acquired");
            Ok(true)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.with_entries(|entries| Ok(entries.remove(key).is_some()))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        self.with_entries(|entries| {
            let matches = matches!(
                entries.get(key),
                Some(Entry { value: Value::Str(s), .. }) if s == expected
            );
            if matches {
                entries.remove(key);
            }
            Ok(matches)
        })
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>> {
        self.with_entries(|entries| {
            Ok(entries.get(key).and_then(|e| e.expire_at).map(|at| {
                let remaining = at.saturating_duration_since(Instant::now());
                // round up like Redis does for a partially elapsed second
                remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)
            }))
        })
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expire_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                Ok(true)
            }
            None => Ok(false),
        })
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expire_at: None,
            });
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let current = match hash.get(field) {
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    StoreError::Backend(format!("hash value {key}.{field} is not an integer"))
                })?,
                None => 0,
            };
            let next = current + delta;
            hash.insert(field.to_string(), next.to_string());
            Ok(next)
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expire_at: None,
            });
            let Value::Hash(hash) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            hash.insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        self.with_entries(|entries| {
            let remove_key = match entries.get_mut(key) {
                None => return Ok(()),
                Some(Entry {
                    value: Value::Hash(hash),
                    ..
                }) => {
                    for field in fields {
                        hash.remove(*field);
                    }
                    hash.is_empty()
                }
                Some(_) => return Err(wrong_type(key)),
            };
            if remove_key {
                entries.remove(key);
            }
            Ok(())
        })
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expire_at: None,
            });
            let Value::List(list) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            list.push_front(value.to_string());
            Ok(())
        })
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(match list_bounds(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.with_entries(|entries| {
            let keep = match entries.get_mut(key) {
                None => return Ok(()),
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => match list_bounds(list.len(), start, stop) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                        true
                    }
                    None => false,
                },
                Some(_) => return Err(wrong_type(key)),
            };
            if !keep {
                entries.remove(key);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_once() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_ex("k", "a", 60).await.unwrap());
        assert!(!kv.set_nx_ex("k", "b", 60).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
        let ttl = kv.ttl("k").await.unwrap().unwrap();
        assert!(ttl <= 60 && ttl >= 59);
    }

    #[tokio::test]
    async fn expired_key_can_be_reacquired() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_ex("k", "a", 1).await.unwrap());
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(kv.set_nx_ex("k", "b", 1).await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete() {
        let kv = MemoryKv::new();
        kv.set_nx_ex("k", "mine", 60).await.unwrap();
        assert!(!kv.delete_if_equals("k", "theirs").await.unwrap());
        assert!(kv.get("k").await.unwrap().is_some());
        assert!(kv.delete_if_equals("k", "mine").await.unwrap());
        assert!(kv.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hash_increment_and_delete() {
        let kv = MemoryKv::new();
        assert_eq!(kv.hincr("h", "n", 1).await.unwrap(), 1);
        assert_eq!(kv.hincr("h", "n", 2).await.unwrap(), 3);
        kv.hset("h", "s", "x").await.unwrap();
        kv.hdel("h", &["s"]).await.unwrap();
        let all = kv.hget_all("h").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["n"], "3");
        assert!(kv.get("h").await.is_err());
    }

    #[tokio::test]
    async fn capped_list() {
        let kv = MemoryKv::new();
        for i in 0..5 {
            kv.lpush("l", &i.to_string()).await.unwrap();
            kv.ltrim("l", 0, 2).await.unwrap();
        }
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["4", "3", "2"]);
        assert_eq!(kv.lrange("l", 0, 0).await.unwrap(), vec!["4"]);
        assert!(kv.lrange("l", 5, 9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let kv = MemoryKv::new();
        kv.set_offline(true);
        assert!(kv.get("k").await.unwrap_err().is_unavailable());
    }

    #[test]
    fn list_bounds_like_redis() {
        assert_eq!(list_bounds(5, 0, -1), Some((0, 4)));
        assert_eq!(list_bounds(5, -2, -1), Some((3, 4)));
        assert_eq!(list_bounds(5, 1, 100), Some((1, 4)));
        assert_eq!(list_bounds(0, 0, -1), None);
        assert_eq!(list_bounds(3, 2, 1), None);
    }
}
