//! Vote integrity module.
//!
//! Tamper evidence for ledger rows:
//! - SHA-256 content hash over canonical JSON
//! - HMAC-SHA256 signature over (vote, event, IP)

pub mod hash;
pub mod signature;

pub use hash::{compute_hash, verify_hash, VoteContent};
pub use signature::VoteSigner;
