//! Voter identity and device fingerprints.
//!
//! The voter identity joins a voter's transactions without using raw PII as
//! the key. The device fingerprint tracks how many distinct events one
//! device has touched within the retention window.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::security::cache::TtlCache;
use crate::security::headers::RequestHeaders;
use crate::storage::models::EventId;

fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// `sha256("{email}:{ip}")`, email lowercased, absent email as "".
pub fn voter_identity(email: Option<&str>, ip: &str) -> String {
    let email = email.map(|e| e.trim().to_lowercase()).unwrap_or_default();
    sha256_hex(&format!("{}:{}", email, ip))
}

/// `sha256(user_agent|accept_language|accept_encoding|ip)`.
pub fn device_fingerprint(headers: &RequestHeaders, ip: &str) -> String {
    let components = [
        headers.get("user-agent").unwrap_or(""),
        headers.get("accept-language").unwrap_or(""),
        headers.get("accept-encoding").unwrap_or(""),
        ip,
    ];
    sha256_hex(&components.join("|"))
}

/// Fingerprint -> set of events touched, with a sliding TTL.
pub struct FingerprintRegistry {
    events: TtlCache<String, BTreeSet<EventId>>,
}

impl FingerprintRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            events: TtlCache::new(ttl),
        }
    }

    pub fn with_max_entries(ttl: Duration, max_entries: usize) -> Self {
        Self {
            events: TtlCache::with_max_entries(ttl, max_entries),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Distinct events already recorded for this fingerprint.
    pub fn distinct_events(&self, fingerprint: &str, now: DateTime<Utc>) -> usize {
        self.events
            .get(&fingerprint.to_string(), now)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Record that the fingerprint voted on `event_id`. Idempotent per event.
    pub fn record(&self, fingerprint: &str, event_id: EventId, now: DateTime<Utc>) -> usize {
        self.events
            .upsert(fingerprint.to_string(), now, |current| {
                let mut set = current.unwrap_or_default();
                set.insert(event_id);
                set
            })
            .len()
    }
}
