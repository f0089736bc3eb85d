//! Concurrent keyed stores with per-entry time-to-live.
//!
//! Every flow and context lookup in the datapath goes through one of
//! these. A successful `get` resets the entry's TTL, so an active flow
//! stays cached while an abandoned handshake ages out. Expired entries
//! are dropped lazily: a sweep runs at most once per purge interval,
//! piggy-backed on regular traffic.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

const PURGE_INTERVAL: Duration = Duration::from_secs(10);

struct Entry<V> {
    value: V,
    ttl: Duration,
    expires: Instant,
}

/// A concurrent map whose entries expire unless refreshed by lookups.
pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    default_ttl: Duration,
    last_purge: Mutex<Instant>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    /// Create a cache with the given default entry lifetime.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
            last_purge: Mutex::new(Instant::now()),
        }
    }

    /// Fetch a live entry and reset its TTL. Expired entries are treated
    /// as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        self.maybe_purge();
        let mut entry = self.entries.get_mut(key)?;
        let now = Instant::now();
        if entry.expires <= now {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        entry.expires = now + entry.ttl;
        Some(entry.value.clone())
    }

    /// Insert or replace an entry with the default TTL.
    pub fn add_or_update(&self, key: K, value: V) {
        self.maybe_purge();
        let ttl = self.default_ttl;
        self.entries.insert(
            key,
            Entry {
                value,
                ttl,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Remove an entry, returning its value when it was present and live.
    pub fn remove(&self, key: &K) -> Option<V> {
        let (_, entry) = self.entries.remove(key)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        Some(entry.value)
    }

    /// Rewrite the TTL of a live entry. Returns false when the entry is
    /// absent or already expired.
    pub fn set_time_out(&self, key: &K, ttl: Duration) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires > Instant::now() => {
                entry.ttl = ttl;
                entry.expires = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    /// Number of entries, including any not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn maybe_purge(&self) {
        let mut last = match self.last_purge.try_lock() {
            Some(guard) => guard,
            // Another worker is sweeping.
            None => return,
        };
        let now = Instant::now();
        if now.duration_since(*last) < PURGE_INTERVAL {
            return;
        }
        *last = now;
        drop(last);
        self.entries.retain(|_, entry| entry.expires > now);
    }
}
