//! Generic get-or-create map with per-entry expiry.
//!
//! Backs both the discovery result cache (expire after write) and the
//! position counter table (expire after last access). Entries are expired
//! lazily on access; `sweep` drops dead entries eagerly for callers that care
//! about memory.

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

struct Entry<V> {
    value: V,
    // Written once at insert, bumped on access when sliding expiry is on.
    stamp: AtomicU64,
}

/// Map whose entries vanish after a TTL.
///
/// By default the TTL runs from insertion. With [`ExpiringMap::sliding`],
/// every read refreshes the entry's lease, turning the TTL into an
/// inactivity window.
pub struct ExpiringMap<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
    sliding: bool,
    clock: Arc<dyn Clock>,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// TTL runs from insertion time.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            sliding: false,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// TTL runs from the most recent access (inactivity window).
    pub fn sliding(ttl: Duration) -> Self {
        Self { sliding: true, ..Self::new(ttl) }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn is_live(&self, entry: &Entry<V>, now: u64) -> bool {
        let ttl_millis = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        now.saturating_sub(entry.stamp.load(Ordering::Acquire)) < ttl_millis
    }

    /// Fetch a live entry, refreshing its lease when sliding expiry is on.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_millis();
        let guard = self.entries.read().expect("expiring map poisoned");
        let entry = guard.get(key)?;
        if !self.is_live(entry, now) {
            return None;
        }
        if self.sliding {
            entry.stamp.store(now, Ordering::Release);
        }
        Some(entry.value.clone())
    }

    /// Insert or replace, restarting the entry's TTL.
    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now_millis();
        let mut guard = self.entries.write().expect("expiring map poisoned");
        guard.insert(key, Entry { value, stamp: AtomicU64::new(now) });
    }

    /// Get the live entry for `key`, or create one with `make`.
    ///
    /// Creation happens under the write lock, so concurrent callers for the
    /// same key observe exactly one created value.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let now = self.clock.now_millis();
        let mut guard = self.entries.write().expect("expiring map poisoned");
        // Re-check: another caller may have created the entry between locks.
        if let Some(entry) = guard.get(&key) {
            if self.is_live(entry, now) {
                if self.sliding {
                    entry.stamp.store(now, Ordering::Release);
                }
                return entry.value.clone();
            }
        }
        let value = make();
        guard.insert(key, Entry { value: value.clone(), stamp: AtomicU64::new(now) });
        value
    }

    /// Drop all expired entries.
    pub fn sweep(&self) {
        let now = self.clock.now_millis();
        let mut guard = self.entries.write().expect("expiring map poisoned");
        guard.retain(|_, entry| {
            let ttl_millis = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
            now.saturating_sub(entry.stamp.load(Ordering::Acquire)) < ttl_millis
        });
    }

    /// Number of entries currently stored, live or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.read().expect("expiring map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
