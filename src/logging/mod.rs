//! Structured logging with request context.
//!
//! Every log line carries request_id (and vote_id once assigned) for
//! easy correlation across scoring, ledger and analytics.

pub mod structured;

pub use structured::*;
