//! Versioned metadata cache
//!
//! All metadata caches are keyed by one process-wide counter. A configuration
//! write bumps the counter after its transaction commits; every entry built
//! under an older version is then treated as missing. Entries also expire
//! after a fixed time as a second line of defence against writes made by
//! other processes.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::Result;

static GLOBAL_VERSION: CacheVersion = CacheVersion::new();

/// Monotonic invalidation counter.
#[derive(Debug)]
pub struct CacheVersion(AtomicU64);

impl CacheVersion {
    pub const fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// The counter shared by every cache in the process.
    pub fn global() -> &'static CacheVersion {
        &GLOBAL_VERSION
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidate every cache built on this counter. Returns the new version.
    pub fn bump(&self) -> u64 {
        let next = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Registry metadata cache invalidated, version {}", next);
        next
    }
}

impl Default for CacheVersion {
    fn default() -> Self {
        Self::new()
    }
}

struct Entry<V> {
    version: u64,
    expires_at: Instant,
    value: V,
}

/// Map from key to value, valid for one counter version and a time window.
pub struct VersionedCache<K, V> {
    version: &'static CacheVersion,
    ttl: Duration,
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K, V> VersionedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(version: &'static CacheVersion, ttl: Duration) -> Self {
        Self {
            version,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn version(&self) -> &'static CacheVersion {
        self.version
    }

    /// Current value for `key`, if built under the current version and not
    /// expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let current = self.version.current();
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|e| e.version == current && e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    /// Store a value built while the counter read `built_at`.
    ///
    /// A value built before a concurrent bump is stored under the old
    /// version and is therefore never served.
    pub fn insert(&self, key: K, built_at: u64, value: V) {
        if let Ok(mut entries) = self.entries.write() {
            let now = Instant::now();
            let current = self.version.current();
            entries.retain(|_, e| e.version == current && e.expires_at > now);
            entries.insert(
                key,
                Entry {
                    version: built_at,
                    expires_at: now + self.ttl,
                    value,
                },
            );
        }
    }

    pub async fn get_or_try_insert_with<F, Fut>(&self, key: K, build: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        let built_at = self.version.current();
        let value = build().await?;
        self.insert(key, built_at, value.clone());
        Ok(value)
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}
