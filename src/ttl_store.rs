//! Process-scoped key/value state with expiry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Expiring map used for rate-limit counters and device-flow sessions.
/// Callers pass `now` so expiry is deterministic under test.
pub trait TtlStore<K, V>: Send + Sync {
    fn get(&self, key: &K, now: Instant) -> Option<V>;
    fn set(&self, key: K, value: V, ttl: Duration, now: Instant);
    fn delete(&self, key: &K) -> Option<V>;
    /// Drop expired entries; returns how many were removed.
    fn sweep(&self, now: Instant) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
}

/// In-memory [`TtlStore`] with a hard entry cap. When full, the entry
/// inserted longest ago is evicted.
pub struct MemoryTtlStore<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> MemoryTtlStore<K, V> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Atomically read-modify-write one entry. `f` receives the live value
    /// (if any) and returns the value to store. The expiry restarts at
    /// `now + ttl`; the insertion time used for eviction does not.
    pub fn update<R>(
        &self,
        key: K,
        ttl: Duration,
        now: Instant,
        f: impl FnOnce(Option<&V>) -> (V, R),
    ) -> R {
        let mut entries = self.lock();
        let live = entries.get(&key).filter(|e| e.expires_at > now);
        let (value, result) = f(live.map(|e| &e.value));
        match entries.get_mut(&key).filter(|e| e.expires_at > now) {
            Some(entry) => {
                entry.value = value;
                entry.expires_at = now + ttl;
            }
            None => {
                entries.remove(&key);
                Self::insert_bounded(&mut entries, self.max_entries, key, value, ttl, now);
            }
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_bounded(
        entries: &mut HashMap<K, Entry<V>>,
        max_entries: usize,
        key: K,
        value: V,
        ttl: Duration,
        now: Instant,
    ) {
        if !entries.contains_key(&key) && entries.len() >= max_entries {
            entries.retain(|_, e| e.expires_at > now);
            while entries.len() >= max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        entries.remove(&k);
                    }
                    None => break,
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
            },
        );
    }
}

impl<K, V> TtlStore<K, V> for MemoryTtlStore<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K, now: Instant) -> Option<V> {
        self.lock()
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone())
    }

    fn set(&self, key: K, value: V, ttl: Duration, now: Instant) {
        let mut entries = self.lock();
        Self::insert_bounded(&mut entries, self.max_entries, key, value, ttl, now);
    }

    fn delete(&self, key: &K) -> Option<V> {
        self.lock().remove(key).map(|e| e.value)
    }

    fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}
