//! TTL cache keyed on caller-supplied time.
//!
//! Expiry is evaluated against the `now` passed in, not a wall clock, so
//! windows can be driven by an injected clock. The cache is bounded:
//! expired entries are swept on insert at most once per TTL, and when a
//! new key would exceed `max_entries` the entry closest to expiry is
//! evicted.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Entry cap used by `TtlCache::new`.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    /// Insertion order, breaks expiry ties on eviction.
    seq: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    last_sweep: Option<DateTime<Utc>>,
    next_seq: u64,
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: usize,
    state: RwLock<CacheState<K, V>>,
    stats: CacheStats,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self::with_max_entries(ttl, DEFAULT_MAX_ENTRIES)
    }

    /// `max_entries` is raised to at least 1.
    pub fn with_max_entries(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                last_sweep: None,
                next_seq: 0,
            }),
            stats: CacheStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn get(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        {
            let state = self.state.read();
            match state.entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Expired: drop it unless someone refreshed it meanwhile.
        let mut state = self.state.write();
        if matches!(state.entries.get(key), Some(e) if e.expires_at <= now) {
            state.entries.remove(key);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: K, value: V, now: DateTime<Utc>) {
        let mut state = self.state.write();
        self.place(&mut state, key, value, now);
    }

    /// Read-modify-write under one lock; the entry's TTL restarts.
    /// Expired entries are passed to `f` as `None`.
    pub fn upsert<F>(&self, key: K, now: DateTime<Utc>, f: F) -> V
    where
        F: FnOnce(Option<V>) -> V,
    {
        let mut state = self.state.write();
        let current = state
            .entries
            .remove(&key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value);
        let value = f(current);
        self.place(&mut state, key, value.clone(), now);
        value
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        self.sweep(&mut state, now)
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    pub fn clear(&self) {
        self.state.write().entries.clear();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn place(&self, state: &mut CacheState<K, V>, key: K, value: V, now: DateTime<Utc>) {
        let sweep_due = state.last_sweep.map_or(true, |at| now - at >= self.ttl);
        if sweep_due {
            self.sweep(state, now);
        }

        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
            if !sweep_due {
                self.sweep(state, now);
            }
            while state.entries.len() >= self.max_entries {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| (e.expires_at, e.seq))
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        state.entries.remove(&k);
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
                seq,
            },
        );
    }

    fn sweep(&self, state: &mut CacheState<K, V>, now: DateTime<Utc>) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, e| e.expires_at > now);
        state.last_sweep = Some(now);
        let removed = before - state.entries.len();
        if removed > 0 {
            self.stats.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            log::debug!("CACHE_SWEPT removed={} remaining={}", removed, state.entries.len());
        }
        removed
    }
}
