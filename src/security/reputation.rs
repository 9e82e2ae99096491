//! IP and email reputation.
//!
//! Verdicts come from a pluggable provider and are cached for 24 hours.
//! Provider calls are bounded by a timeout; a timeout or provider failure
//! yields a neutral verdict that is not cached, so vote admission never
//! stalls on a slow provider.

use std::collections::HashSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::structured::LogContext;
use crate::security::cache::TtlCache;

lazy_static! {
    /// Email shape.
    static ref EMAIL_PATTERN: Regex = Regex::new(
        r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$"
    ).unwrap();
}

/// Known disposable mailbox domains.
pub const DISPOSABLE_DOMAINS: &[&str] = &[
    "tempmail.com",
    "guerrillamail.com",
    "mailinator.com",
    "10minutemail.com",
    "throwaway.email",
];

/// Large free mailbox providers.
pub const FREE_PROVIDER_DOMAINS: &[&str] = &["gmail.com", "yahoo.com", "hotmail.com", "outlook.com"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpReputation {
    pub blacklisted: bool,
    pub abuse_score: u32,
    pub is_proxy: bool,
    pub is_vpn: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailReputation {
    pub disposable: bool,
    pub free_provider: bool,
    pub valid: bool,
}

impl Default for EmailReputation {
    fn default() -> Self {
        Self {
            disposable: false,
            free_provider: false,
            valid: true,
        }
    }
}

/// Cached provider verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputationRecord<T> {
    pub verdict: T,
    pub checked_at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("reputation provider unavailable: {0}")]
    Unavailable(String),

    #[error("reputation provider timed out after {0:?}")]
    Timeout(StdDuration),
}

/// External reputation capability.
pub trait ReputationProvider: Send + Sync {
    fn check_ip(&self, ip: &str) -> Result<IpReputation, ProviderError>;

    fn check_email(&self, email: &str) -> Result<EmailReputation, ProviderError>;

    /// Whether calls may block on I/O. Non-blocking providers are called
    /// inline instead of on a timeout-guarded worker thread.
    fn is_blocking(&self) -> bool {
        true
    }
}

/// Provider that knows nothing and flags nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeutralReputationProvider;

impl ReputationProvider for NeutralReputationProvider {
    fn check_ip(&self, _ip: &str) -> Result<IpReputation, ProviderError> {
        Ok(IpReputation::default())
    }

    fn check_email(&self, _email: &str) -> Result<EmailReputation, ProviderError> {
        Ok(EmailReputation::default())
    }

    fn is_blocking(&self) -> bool {
        false
    }
}

/// Offline provider backed by static domain lists and an optional IP
/// blacklist.
#[derive(Debug, Clone)]
pub struct StaticReputationProvider {
    disposable: HashSet<String>,
    free: HashSet<String>,
    blacklisted_ips: HashSet<String>,
}

impl Default for StaticReputationProvider {
    fn default() -> Self {
        Self {
            disposable: DISPOSABLE_DOMAINS.iter().map(|s| s.to_string()).collect(),
            free: FREE_PROVIDER_DOMAINS.iter().map(|s| s.to_string()).collect(),
            blacklisted_ips: HashSet::new(),
        }
    }
}

impl StaticReputationProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blacklisted_ips<I, S>(mut self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklisted_ips.extend(ips.into_iter().map(Into::into));
        self
    }
}

/// Lowercased domain part of an email address, if any.
pub fn email_domain(email: &str) -> Option<String> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim().to_lowercase())
        .filter(|d| !d.is_empty())
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email.trim())
}

impl ReputationProvider for StaticReputationProvider {
    fn check_ip(&self, ip: &str) -> Result<IpReputation, ProviderError> {
        let blacklisted = self.blacklisted_ips.contains(ip);
        Ok(IpReputation {
            blacklisted,
            abuse_score: if blacklisted { 100 } else { 0 },
            ..IpReputation::default()
        })
    }

    fn check_email(&self, email: &str) -> Result<EmailReputation, ProviderError> {
        let domain = email_domain(email).unwrap_or_default();
        Ok(EmailReputation {
            disposable: self.disposable.contains(&domain),
            free_provider: self.free.contains(&domain),
            valid: is_valid_email(email),
        })
    }

    fn is_blocking(&self) -> bool {
        false
    }
}

fn call_with_timeout<T, F>(timeout: StdDuration, f: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("reputation-lookup".to_string())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(ProviderError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => Err(ProviderError::Unavailable(
            "provider worker exited without a verdict".to_string(),
        )),
    }
}

/// Reputation lookups with a 24h cache in front of the provider.
pub struct ReputationCache {
    provider: Arc<dyn ReputationProvider>,
    timeout: StdDuration,
    ips: TtlCache<String, ReputationRecord<IpReputation>>,
    emails: TtlCache<String, ReputationRecord<EmailReputation>>,
}

impl ReputationCache {
    pub fn new(provider: Arc<dyn ReputationProvider>, timeout: StdDuration, ttl: Duration) -> Self {
        Self {
            provider,
            timeout,
            ips: TtlCache::new(ttl),
            emails: TtlCache::new(ttl),
        }
    }

    /// Cap each of the IP and email caches at `max_entries`.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        let ttl = self.ips.ttl();
        self.ips = TtlCache::with_max_entries(ttl, max_entries);
        self.emails = TtlCache::with_max_entries(ttl, max_entries);
        self
    }

    fn fetch<T, F>(&self, f: F) -> Result<T, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn ReputationProvider>) -> Result<T, ProviderError> + Send + 'static,
    {
        let provider = Arc::clone(&self.provider);
        if provider.is_blocking() {
            call_with_timeout(self.timeout, move || f(provider))
        } else {
            f(provider)
        }
    }

    pub fn lookup_ip(&self, ip: &str, now: DateTime<Utc>, ctx: &LogContext) -> IpReputation {
        let key = ip.to_string();
        if let Some(record) = self.ips.get(&key, now) {
            log::debug!("{} IP_REPUTATION_CACHE_HIT ip={}", ctx, ip);
            return record.verdict;
        }

        let owned = key.clone();
        match self.fetch(move |p| p.check_ip(&owned)) {
            Ok(verdict) => {
                log::debug!(
                    "{} IP_REPUTATION_FETCHED ip={} blacklisted={} abuse_score={}",
                    ctx,
                    ip,
                    verdict.blacklisted,
                    verdict.abuse_score
                );
                self.ips.insert(
                    key,
                    ReputationRecord {
                        verdict,
                        checked_at: now,
                    },
                    now,
                );
                verdict
            }
            Err(e) => {
                log::warn!("{} IP_REPUTATION_DEGRADED ip={} error={}", ctx, ip, e);
                IpReputation::default()
            }
        }
    }

    pub fn lookup_email(&self, email: &str, now: DateTime<Utc>, ctx: &LogContext) -> EmailReputation {
        let key = email.trim().to_lowercase();
        if let Some(record) = self.emails.get(&key, now) {
            log::debug!("{} EMAIL_REPUTATION_CACHE_HIT", ctx);
            return record.verdict;
        }

        let owned = key.clone();
        match self.fetch(move |p| p.check_email(&owned)) {
            Ok(verdict) => {
                log::debug!(
                    "{} EMAIL_REPUTATION_FETCHED disposable={} free={} valid={}",
                    ctx,
                    verdict.disposable,
                    verdict.free_provider,
                    verdict.valid
                );
                self.emails.insert(
                    key,
                    ReputationRecord {
                        verdict,
                        checked_at: now,
                    },
                    now,
                );
                verdict
            }
            Err(e) => {
                log::warn!("{} EMAIL_REPUTATION_DEGRADED error={}", ctx, e);
                EmailReputation::default()
            }
        }
    }

    pub fn cached_ip(&self, ip: &str, now: DateTime<Utc>) -> Option<ReputationRecord<IpReputation>> {
        self.ips.get(&ip.to_string(), now)
    }

    pub fn cached_email(&self, email: &str, now: DateTime<Utc>) -> Option<ReputationRecord<EmailReputation>> {
        self.emails.get(&email.trim().to_lowercase(), now)
    }
}
