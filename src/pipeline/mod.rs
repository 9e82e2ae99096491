//! Pipeline orchestration module.
//!
//! Vote casting pipeline that coordinates:
//! - Client resolution and input validation
//! - Fraud scoring
//! - Admission (admit or quarantine)
//! - Ledger commit with integrity sealing
//! - Analytics refresh

pub mod casting;
pub mod context;

pub use casting::*;
pub use context::*;
