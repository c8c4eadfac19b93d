//! Time-bounded cache for statistics derived from a record window.
//!
//! An entry expires after its TTL, or earlier once the fraction of window
//! records that were added, removed or re-versioned since it was computed
//! reaches the invalidation fraction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Identity and version of every record in a window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowFingerprint(HashMap<Uuid, u64>);

impl WindowFingerprint {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (Uuid, u64)>) -> Self {
        Self(pairs.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Records added, removed or carrying a different version.
    pub fn changed_since(&self, earlier: &WindowFingerprint) -> usize {
        let changed_or_added = self
            .0
            .iter()
            .filter(|(id, version)| earlier.0.get(id) != Some(version))
            .count();
        let removed = earlier.0.keys().filter(|id| !self.0.contains_key(id)).count();
        changed_or_added + removed
    }
}

struct Entry<V> {
    value: Arc<V>,
    fingerprint: WindowFingerprint,
    computed_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

pub struct StatsCache<V> {
    ttl: Duration,
    invalidation_fraction: f64,
    entries: RwLock<HashMap<String, Entry<V>>>,
    stats: RwLock<CacheStats>,
}

impl<V> StatsCache<V> {
    pub fn new(ttl: Duration, invalidation_fraction: f64) -> Self {
        Self {
            ttl,
            invalidation_fraction,
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Return the cached value for `key` if it is fresh for `fingerprint`,
    /// otherwise compute, store and return a new one.
    pub async fn get_or_compute(
        &self,
        key: &str,
        fingerprint: WindowFingerprint,
        compute: impl FnOnce() -> V,
    ) -> Arc<V> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if self.is_fresh(entry, &fingerprint) {
                    self.stats.write().await.hits += 1;
                    return entry.value.clone();
                }
            }
        }

        let value = Arc::new(compute());
        let mut entries = self.entries.write().await;
        let replaced = entries
            .insert(
                key.to_string(),
                Entry { value: value.clone(), fingerprint, computed_at: Instant::now() },
            )
            .is_some();

        let mut stats = self.stats.write().await;
        stats.misses += 1;
        if replaced {
            stats.invalidations += 1;
        }
        value
    }

    fn is_fresh(&self, entry: &Entry<V>, fingerprint: &WindowFingerprint) -> bool {
        if entry.computed_at.elapsed() >= self.ttl {
            return false;
        }
        let changed = fingerprint.changed_since(&entry.fingerprint);
        if changed == 0 {
            return true;
        }
        let base = entry.fingerprint.len().max(1);
        #[allow(clippy::cast_precision_loss)]
        let fraction = changed as f64 / base as f64;
        fraction < self.invalidation_fraction
    }

    pub async fn invalidate_all(&self) {
        self.entries.write().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        *self.stats.read().await
    }
}
