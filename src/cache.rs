//! Versioned query cache.
//!
//! Entries are keyed by the query key together with the cache version that was
//! current when they were computed. Writes to the store call
//! [`QueryCache::invalidate`], which bumps the version; older entries can no
//! longer be hit and are purged. A value computed concurrently with an
//! invalidation is stored under the old version and therefore never served.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use moka::sync::Cache;

pub struct QueryCache<V> {
    inner: Cache<(String, u64), V>,
    version: Arc<AtomicU64>,
}

impl<V: Clone + Send + Sync + 'static> QueryCache<V> {
    /// Entries expire `ttl` after they were stored.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Cache::builder().time_to_live(ttl).build(),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.get(&(key.to_string(), self.version()))
    }

    /// Store `value` for `key` under `version`. Values computed for a stale version are dropped.
    pub fn insert(&self, key: &str, version: u64, value: V) {
        if version != self.version() {
            return;
        }
        self.inner.insert((key.to_string(), version), value);
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    pub fn get_or_try_insert_with<F>(&self, key: &str, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        let version = self.version();
        if let Some(value) = self.inner.get(&(key.to_string(), version)) {
            return Ok(value);
        }
        let value = compute()?;
        self.insert(key, version, value.clone());
        Ok(value)
    }

    /// Bump the version and drop every entry. Returns the new version.
    pub fn invalidate(&self) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.invalidate_all();
        tracing::debug!(version, "Query cache invalidated");
        version
    }

    /// Entries currently held, after pending evictions have run.
    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Clone for QueryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            version: self.version.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn caches_until_invalidated() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_secs(60));
        let calls = Cell::new(0);
        let compute = || -> Result<u32> {
            calls.set(calls.get() + 1);
            Ok(calls.get())
        };

        assert_eq!(cache.get_or_try_insert_with("costs", compute).unwrap(), 1);
        assert_eq!(cache.get_or_try_insert_with("costs", compute).unwrap(), 1);
        assert_eq!(calls.get(), 1);

        assert_eq!(cache.invalidate(), 1);
        assert_eq!(cache.get("costs"), None);
        assert_eq!(cache.get_or_try_insert_with("costs", compute).unwrap(), 2);
    }

    #[test]
    fn keys_are_independent() {
        let cache: QueryCache<&'static str> = QueryCache::new(Duration::from_secs(60));
        cache.insert("a", 0, "first");
        cache.insert("b", 0, "second");
        assert_eq!(cache.get("a"), Some("first"));
        assert_eq!(cache.get("b"), Some("second"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_are_not_served() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_millis(10));
        cache.insert("costs", 0, 7);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("costs"), None);
    }

    #[test]
    fn stale_version_inserts_are_dropped() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_secs(60));
        let version = cache.version();
        cache.invalidate();
        cache.insert("costs", version, 7);
        assert_eq!(cache.get("costs"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_computation_is_not_cached() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_secs(60));
        let result = cache.get_or_try_insert_with("costs", || anyhow::bail!("boom"));
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn clones_share_state() {
        let cache: QueryCache<u32> = QueryCache::new(Duration::from_secs(60));
        let other = cache.clone();
        cache.insert("costs", 0, 3);
        assert_eq!(other.get("costs"), Some(3));
        other.invalidate();
        assert_eq!(cache.version(), 1);
    }
}
