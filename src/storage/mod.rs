//! Storage module.
//!
//! Ledger records and the in-process vote ledger that owns them.

pub mod ledger;
pub mod models;

pub use ledger::{EventSnapshot, VoteDraft, VoteLedger};
pub use models::*;
