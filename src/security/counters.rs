//! Rate and velocity counters.
//!
//! Windowed unit counters per IP, per email and per voter identity, all
//! scoped to an event. Updates are two-phase: a request reserves its units
//! before the ledger write (pending units are visible to concurrent
//! readers), then commits after the ledger transaction or releases on any
//! failure. A reservation that is dropped without commit is released.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::models::EventId;

/// Identifies the counters touched by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterKeys {
    pub event_id: EventId,
    pub ip: String,
    pub email: Option<String>,
    pub identity: String,
}

/// Window totals observed for one request, excluding its own units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterTotals {
    pub ip_hour: u64,
    pub ip_day: u64,
    pub email_hour: Option<u64>,
    pub email_day: Option<u64>,
    pub identity_window: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(u64);

/// Counter backend. Implementations may be eventually consistent.
pub trait CounterStore: Send + Sync {
    fn totals(&self, keys: &CounterKeys, now: DateTime<Utc>) -> Result<CounterTotals>;

    /// Add `units` as pending to every window for `keys`.
    fn reserve(&self, keys: &CounterKeys, units: u64, now: DateTime<Utc>) -> Result<ReservationId>;

    fn commit(&self, id: ReservationId) -> Result<()>;

    fn release(&self, id: ReservationId) -> Result<()>;
}

/// Pending reservation. Released on drop unless committed.
pub struct CounterReservation<'a> {
    store: &'a dyn CounterStore,
    id: Option<ReservationId>,
}

impl<'a> CounterReservation<'a> {
    pub fn acquire(
        store: &'a dyn CounterStore,
        keys: &CounterKeys,
        units: u64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let id = store.reserve(keys, units, now)?;
        Ok(Self {
            store,
            id: Some(id),
        })
    }

    pub fn commit(mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => self.store.commit(id),
            None => Ok(()),
        }
    }

    pub fn release(mut self) -> Result<()> {
        match self.id.take() {
            Some(id) => self.store.release(id),
            None => Ok(()),
        }
    }
}

impl Drop for CounterReservation<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.store.release(id) {
                log::warn!("COUNTER_RELEASE_FAILED reservation={:?} error={}", id, e);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CounterKey {
    Ip(EventId, String),
    Email(EventId, String),
    Identity(EventId, String),
}

#[derive(Debug, Clone)]
struct WindowEntry {
    at: DateTime<Utc>,
    units: u64,
    reservation: ReservationId,
}

#[derive(Debug, Default)]
struct CounterState {
    series: HashMap<CounterKey, VecDeque<WindowEntry>>,
    pending: HashMap<ReservationId, Vec<CounterKey>>,
    last_sweep: Option<DateTime<Utc>>,
}

impl CounterState {
    fn sum_since(&self, key: &CounterKey, since: DateTime<Utc>) -> u64 {
        self.series
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.at > since)
                    .map(|e| e.units)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn prune_key(&mut self, key: &CounterKey, cutoff: DateTime<Utc>) {
        if let Some(entries) = self.series.get_mut(key) {
            while matches!(entries.front(), Some(e) if e.at <= cutoff) {
                entries.pop_front();
            }
            if entries.is_empty() {
                self.series.remove(key);
            }
        }
    }

    /// Drop idle keys. Runs at most once per `every`.
    fn sweep(&mut self, now: DateTime<Utc>, cutoff: DateTime<Utc>, every: Duration) {
        if self.last_sweep.map_or(false, |at| now - at < every) {
            return;
        }
        self.series.retain(|_, entries| {
            while matches!(entries.front(), Some(e) if e.at <= cutoff) {
                entries.pop_front();
            }
            !entries.is_empty()
        });
        self.last_sweep = Some(now);
    }
}

/// In-process sliding-window counters.
pub struct InMemoryCounters {
    velocity_window: Duration,
    state: Mutex<CounterState>,
    next_id: AtomicU64,
}

impl InMemoryCounters {
    pub fn new(velocity_window: Duration) -> Self {
        Self {
            velocity_window,
            state: Mutex::new(CounterState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn retention(&self) -> Duration {
        std::cmp::max(Duration::days(1), self.velocity_window)
    }

    fn keys_for(keys: &CounterKeys) -> Vec<CounterKey> {
        let mut out = vec![
            CounterKey::Ip(keys.event_id, keys.ip.clone()),
            CounterKey::Identity(keys.event_id, keys.identity.clone()),
        ];
        if let Some(email) = &keys.email {
            out.push(CounterKey::Email(keys.event_id, email.to_lowercase()));
        }
        out
    }

    /// Number of open reservations.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of counter series currently held.
    pub fn tracked_keys(&self) -> usize {
        self.state.lock().series.len()
    }
}

impl CounterStore for InMemoryCounters {
    fn totals(&self, keys: &CounterKeys, now: DateTime<Utc>) -> Result<CounterTotals> {
        let state = self.state.lock();
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::days(1);

        let ip_key = CounterKey::Ip(keys.event_id, keys.ip.clone());
        let identity_key = CounterKey::Identity(keys.event_id, keys.identity.clone());
        let email_key = keys
            .email
            .as_ref()
            .map(|e| CounterKey::Email(keys.event_id, e.to_lowercase()));

        Ok(CounterTotals {
            ip_hour: state.sum_since(&ip_key, hour_ago),
            ip_day: state.sum_since(&ip_key, day_ago),
            email_hour: email_key.as_ref().map(|k| state.sum_since(k, hour_ago)),
            email_day: email_key.as_ref().map(|k| state.sum_since(k, day_ago)),
            identity_window: state.sum_since(&identity_key, now - self.velocity_window),
        })
    }

    fn reserve(&self, keys: &CounterKeys, units: u64, now: DateTime<Utc>) -> Result<ReservationId> {
        let id = ReservationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let counter_keys = Self::keys_for(keys);

        let cutoff = now - self.retention();
        let mut state = self.state.lock();
        for key in &counter_keys {
            state.prune_key(key, cutoff);
        }
        state.sweep(now, cutoff, self.retention());
        for key in &counter_keys {
            state.series.entry(key.clone()).or_default().push_back(WindowEntry {
                at: now,
                units,
                reservation: id,
            });
        }
        state.pending.insert(id, counter_keys);

        log::debug!("COUNTER_RESERVED reservation={} units={}", id.0, units);
        Ok(id)
    }

    fn commit(&self, id: ReservationId) -> Result<()> {
        let mut state = self.state.lock();
        state.pending.remove(&id);
        log::debug!("COUNTER_COMMITTED reservation={}", id.0);
        Ok(())
    }

    fn release(&self, id: ReservationId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(keys) = state.pending.remove(&id) {
            for key in keys {
                if let Some(entries) = state.series.get_mut(&key) {
                    entries.retain(|e| e.reservation != id);
                }
            }
            log::debug!("COUNTER_RELEASED reservation={}", id.0);
        }
        Ok(())
    }
}
