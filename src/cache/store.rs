//! Cache storage.
//!
//! [`CacheStore`] is the seam the engine talks to; [`MemoryStore`] is the
//! in-process implementation backed by a sharded concurrent map.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use dashmap::DashMap;
use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::keys::sibling_keys;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_CACHE_EXPIRED_TOTAL: &str = "verbatim_cache_expired_total";
pub(crate) const METRIC_CACHE_ENTRIES: &str = "verbatim_cache_entries";

/// Key/value storage with prefix-scoped bulk removal.
///
/// Every operation is total: missing keys are reported as absent and removing
/// them is a no-op. Implementations synchronize internally; callers never lock.
///
/// A key `K` may own sibling entries `K:contenttype` and `K:etag`. They are
/// ordinary entries, but removing `K` removes them too.
pub trait CacheStore: Send + Sync {
    /// Whether `key` holds an unexpired value.
    fn contains(&self, key: &str) -> bool;

    /// The unexpired value stored under `key`.
    fn get(&self, key: &str) -> Option<Bytes>;

    /// Store `value` until `absolute_expiration`, optionally recording it as a
    /// dependent of `depends_on` (its base key).
    fn add(
        &self,
        key: &str,
        value: Bytes,
        absolute_expiration: OffsetDateTime,
        depends_on: Option<&str>,
    );

    /// Remove `key` and its siblings.
    fn remove(&self, key: &str);

    /// Remove every key starting with `prefix`, plus everything recorded as
    /// depending on such a key. Returns the number of entries removed.
    fn remove_by_prefix(&self, prefix: &str) -> usize;

    /// Snapshot of stored keys, in no particular order. May include entries
    /// that expired but were not yet swept.
    fn all_keys(&self) -> Vec<String>;

    /// Proactively drop expired entries. Returns the number removed.
    fn purge_expired(&self) -> usize {
        0
    }
}

struct StoredEntry {
    value: Bytes,
    expires_at: OffsetDateTime,
    depends_on: Option<String>,
}

/// In-memory [`CacheStore`].
///
/// Point operations share a read gate and run concurrently against the
/// sharded map. Removals take the gate exclusively so a reader never sees a
/// variant without its siblings.
pub struct MemoryStore {
    entries: DashMap<String, StoredEntry>,
    /// base key → keys added with `depends_on == base key`
    dependents: DashMap<String, HashSet<String>>,
    sweep_gate: RwLock<()>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            dependents: DashMap::new(),
            sweep_gate: RwLock::new(()),
            clock,
        }
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys currently recorded as dependents of `base_key`.
    pub fn dependents_of(&self, base_key: &str) -> HashSet<String> {
        self.dependents
            .get(base_key)
            .map(|keys| keys.value().clone())
            .unwrap_or_default()
    }

    fn lookup(&self, key: &str) -> Option<Bytes> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some((key, entry)) = self.entries.remove_if(key, |_, e| e.expires_at <= now) {
                self.forget_dependency(&key, entry.depends_on.as_deref());
                counter!(METRIC_CACHE_EXPIRED_TOTAL).increment(1);
                trace!(key = %key, "dropped expired entry on access");
            }
        }
        None
    }

    /// Remove one key without touching the gate. Returns whether it existed.
    fn evict(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((key, entry)) => {
                self.forget_dependency(&key, entry.depends_on.as_deref());
                true
            }
            None => false,
        }
    }

    fn forget_dependency(&self, key: &str, depends_on: Option<&str>) {
        let Some(base) = depends_on else {
            return;
        };
        let now_empty = match self.dependents.get_mut(base) {
            Some(mut keys) => {
                keys.remove(key);
                keys.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.dependents.remove_if(base, |_, keys| keys.is_empty());
        }
    }

    fn record_size(&self) {
        gauge!(METRIC_CACHE_ENTRIES).set(self.entries.len() as f64);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryStore {
    fn contains(&self, key: &str) -> bool {
        let _gate = rw_read(&self.sweep_gate, SOURCE, "contains");
        self.lookup(key).is_some()
    }

    fn get(&self, key: &str) -> Option<Bytes> {
        let _gate = rw_read(&self.sweep_gate, SOURCE, "get");
        self.lookup(key)
    }

    fn add(
        &self,
        key: &str,
        value: Bytes,
        absolute_expiration: OffsetDateTime,
        depends_on: Option<&str>,
    ) {
        let _gate = rw_read(&self.sweep_gate, SOURCE, "add");
        let now = self.clock.now();
        let expires_at = absolute_expiration.max(now);

        if let Some(base) = depends_on {
            self.dependents
                .entry(base.to_string())
                .or_default()
                .insert(key.to_string());
        }

        let previous = self.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                expires_at,
                depends_on: depends_on.map(str::to_string),
            },
        );

        // Re-adding a key under a different base must not leave it in the old scope.
        if let Some(previous) = previous {
            if previous.depends_on.as_deref() != depends_on {
                self.forget_dependency(key, previous.depends_on.as_deref());
            }
        }

        self.record_size();
    }

    fn remove(&self, key: &str) {
        let _gate = rw_write(&self.sweep_gate, SOURCE, "remove");
        self.evict(key);
        for sibling in sibling_keys(key) {
            self.evict(&sibling);
        }
        self.record_size();
    }

    fn remove_by_prefix(&self, prefix: &str) -> usize {
        let _gate = rw_write(&self.sweep_gate, SOURCE, "remove_by_prefix");

        let mut doomed: HashSet<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();

        let scopes: Vec<String> = self
            .dependents
            .iter()
            .filter(|scope| scope.key().starts_with(prefix))
            .map(|scope| scope.key().clone())
            .collect();
        for scope in scopes {
            if let Some((_, keys)) = self.dependents.remove(&scope) {
                doomed.extend(keys);
            }
        }

        let mut removed = 0;
        for key in &doomed {
            if self.evict(key) {
                removed += 1;
            }
            for sibling in sibling_keys(key) {
                if !doomed.contains(&sibling) && self.evict(&sibling) {
                    removed += 1;
                }
            }
        }

        self.record_size();
        debug!(prefix, removed, "removed keys by prefix");
        removed
    }

    fn all_keys(&self) -> Vec<String> {
        let _gate = rw_read(&self.sweep_gate, SOURCE, "all_keys");
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    fn purge_expired(&self) -> usize {
        let _gate = rw_write(&self.sweep_gate, SOURCE, "purge_expired");
        let now = self.clock.now();

        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired.iter().filter(|key| self.evict(key)).count();
        if removed > 0 {
            counter!(METRIC_CACHE_EXPIRED_TOTAL).increment(removed as u64);
        }
        self.record_size();
        removed
    }
}
