//! Engine configuration.
//!
//! Defaults carry the production fraud policy. Deployments override the
//! signing secret (required) and a few operational knobs from the
//! environment.

use std::env;
use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Fraud thresholds and risk deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudPolicy {
    pub max_units_per_hour_per_ip: u64,
    pub max_units_per_day_per_ip: u64,
    pub max_units_per_hour_per_email: u64,
    pub max_units_per_day_per_email: u64,
    pub velocity_window_minutes: i64,
    pub max_units_per_velocity_window: u64,

    pub ip_hour_delta: u32,
    pub ip_day_delta: u32,
    pub email_hour_delta: u32,
    pub email_day_delta: u32,
    pub velocity_delta: u32,

    /// More distinct events than this per fingerprint is suspicious.
    pub max_events_per_fingerprint: usize,
    pub fingerprint_ttl_days: i64,
    pub multi_event_delta: u32,

    pub behavioral_history_len: usize,
    pub abnormal_volume_multiplier: u64,
    pub abnormal_volume_delta: u32,
    pub rapid_sequential_secs: i64,
    pub rapid_sequential_delta: u32,

    pub geographic_anomaly_delta: u32,

    pub blacklisted_ip_delta: u32,
    pub high_abuse_threshold: u32,
    pub high_abuse_delta: u32,
    pub disposable_email_delta: u32,
    pub free_email_delta: u32,

    pub concentrated_units_threshold: u64,
    pub concentrated_delta: u32,

    pub missing_user_agent_delta: u32,
    pub bot_user_agent_delta: u32,
    pub missing_referer_delta: u32,
    pub invalid_headers_delta: u32,

    /// Raw risk at or above this quarantines the vote.
    pub quarantine_threshold: u32,
}

impl Default for FraudPolicy {
    fn default() -> Self {
        Self {
            max_units_per_hour_per_ip: 100,
            max_units_per_day_per_ip: 500,
            max_units_per_hour_per_email: 50,
            max_units_per_day_per_email: 200,
            velocity_window_minutes: 15,
            max_units_per_velocity_window: 10,

            ip_hour_delta: 20,
            ip_day_delta: 25,
            email_hour_delta: 20,
            email_day_delta: 25,
            velocity_delta: 30,

            max_events_per_fingerprint: 5,
            fingerprint_ttl_days: 30,
            multi_event_delta: 15,

            behavioral_history_len: 10,
            abnormal_volume_multiplier: 3,
            abnormal_volume_delta: 20,
            rapid_sequential_secs: 300,
            rapid_sequential_delta: 25,

            geographic_anomaly_delta: 30,

            blacklisted_ip_delta: 50,
            high_abuse_threshold: 75,
            high_abuse_delta: 35,
            disposable_email_delta: 20,
            free_email_delta: 5,

            concentrated_units_threshold: 50,
            concentrated_delta: 25,

            missing_user_agent_delta: 15,
            bot_user_agent_delta: 40,
            missing_referer_delta: 5,
            invalid_headers_delta: 20,

            quarantine_threshold: 5,
        }
    }
}

/// HMAC key for vote signatures. Never printed.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningSecret(String);

impl SigningSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigningSecret([REDACTED; {}])", self.0.len())
    }
}

fn default_cache_max_entries() -> usize {
    crate::security::cache::DEFAULT_MAX_ENTRIES
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub policy: FraudPolicy,
    pub signing_secret: SigningSecret,
    /// Upper bound on a single reputation provider call.
    pub reputation_timeout_ms: u64,
    pub reputation_ttl_secs: i64,
    /// Entry cap for each reputation and fingerprint cache.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    pub min_units: u32,
    pub max_units: u32,
}

impl EngineConfig {
    pub fn new(signing_secret: SigningSecret) -> Self {
        Self {
            policy: FraudPolicy::default(),
            signing_secret,
            reputation_timeout_ms: 250,
            reputation_ttl_secs: 86_400,
            cache_max_entries: default_cache_max_entries(),
            min_units: 1,
            max_units: 10_000,
        }
    }

    pub fn reputation_timeout(&self) -> Duration {
        Duration::from_millis(self.reputation_timeout_ms)
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let secret = env::var("PAGEANTRY_SIGNING_SECRET")
            .context("PAGEANTRY_SIGNING_SECRET environment variable is required")?;
        if secret.trim().is_empty() {
            return Err(anyhow::anyhow!("PAGEANTRY_SIGNING_SECRET must not be empty"));
        }

        let mut config = Self::new(SigningSecret::new(secret));

        if let Ok(timeout) = env::var("PAGEANTRY_REPUTATION_TIMEOUT_MS") {
            config.reputation_timeout_ms = timeout
                .parse()
                .context("Invalid PAGEANTRY_REPUTATION_TIMEOUT_MS value")?;
        }

        if let Ok(ttl) = env::var("PAGEANTRY_REPUTATION_TTL_SECS") {
            config.reputation_ttl_secs = ttl
                .parse()
                .context("Invalid PAGEANTRY_REPUTATION_TTL_SECS value")?;
        }

        if let Ok(cap) = env::var("PAGEANTRY_CACHE_MAX_ENTRIES") {
            config.cache_max_entries = cap
                .parse()
                .context("Invalid PAGEANTRY_CACHE_MAX_ENTRIES value")?;
        }

        if let Ok(threshold) = env::var("PAGEANTRY_QUARANTINE_THRESHOLD") {
            config.policy.quarantine_threshold = threshold
                .parse()
                .context("Invalid PAGEANTRY_QUARANTINE_THRESHOLD value")?;
        }

        log::info!(
            "ENGINE_CONFIG_LOADED reputation_timeout_ms={} reputation_ttl_secs={} cache_max_entries={} quarantine_threshold={}",
            config.reputation_timeout_ms,
            config.reputation_ttl_secs,
            config.cache_max_entries,
            config.policy.quarantine_threshold
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_constants() {
        let policy = FraudPolicy::default();
        assert_eq!(policy.max_units_per_hour_per_ip, 100);
        assert_eq!(policy.max_units_per_day_per_email, 200);
        assert_eq!(policy.velocity_window_minutes, 15);
        assert_eq!(policy.quarantine_threshold, 5);
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = SigningSecret::new("super-secret");
        let printed = format!("{:?}", secret);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = EngineConfig::new(SigningSecret::new("k"));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.policy, config.policy);
        assert_eq!(parsed.max_units, 10_000);
        assert_eq!(parsed.cache_max_entries, 100_000);
    }

    #[test]
    fn test_cache_cap_defaults_when_absent() {
        let config = EngineConfig::new(SigningSecret::new("k"));
        let mut json = serde_json::to_value(&config).unwrap();
        json.as_object_mut().unwrap().remove("cache_max_entries");
        let parsed: EngineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.cache_max_entries, 100_000);
    }
}
