//! Admission module.
//!
//! Maps a risk assessment to admit or quarantine.

pub mod decision;

pub use decision::*;
