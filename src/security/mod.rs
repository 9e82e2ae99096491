//! Security module.
//!
//! Fraud signals for vote requests and the scorer that combines them:
//! - Rate and velocity counters
//! - IP / email reputation with a TTL cache
//! - Voter identity and device fingerprints
//! - Request header heuristics

pub mod cache;
pub mod counters;
pub mod fingerprint;
pub mod flags;
pub mod headers;
pub mod reputation;
pub mod scorer;

pub use counters::{CounterReservation, CounterStore, InMemoryCounters};
pub use flags::{FlagKind, FraudFlag};
pub use headers::{resolve_client_ip, RequestHeaders};
pub use reputation::{
    NeutralReputationProvider, ReputationCache, ReputationProvider, StaticReputationProvider,
};
pub use scorer::{CheckSet, FraudScorer, RiskAssessment, ScoreRequest, VoteHistory};
