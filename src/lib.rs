//! Pageantry Core - Vote fraud scoring and ledger integrity
//!
//! This crate provides the vote engine behind Pageantry's paid voting,
//! optionally exposed to Python via PyO3. The implementation prioritizes:
//!
//! 1. **Fail-closed security** - Every vote is scored; scorer failures quarantine
//! 2. **Tamper evidence** - Each vote carries a content hash and HMAC signature
//! 3. **Logging** - Every decision point logged with request context
//!
//! ## Architecture
//!
//! The crate is organized into modules:
//! - `pipeline` - Vote casting orchestrator (`VoteEngine`)
//! - `security` - Rate counters, reputation, fingerprints, risk scoring
//! - `admission` - Admit or quarantine decisions
//! - `integrity` - Canonical content hashing and vote signatures
//! - `storage` - Domain models and the vote ledger
//! - `analytics` - Event rollups, leaderboards, live counter
//! - `config` - Fraud policy and engine configuration
//! - `logging` - Structured logging with request context

pub mod admission;
pub mod analytics;
pub mod clock;
pub mod config;
pub mod error;
pub mod integrity;
pub mod logging;
pub mod pipeline;
pub mod security;
pub mod storage;

#[cfg(feature = "python")]
mod python;

pub use config::{EngineConfig, FraudPolicy, SigningSecret};
pub use error::{Result, VoteError};
pub use pipeline::{CastVoteReceipt, CastVoteRequest, VoteEngine};

/// Initialize the process-wide logger. Safe to call more than once.
pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_millis()
        .try_init();
}
