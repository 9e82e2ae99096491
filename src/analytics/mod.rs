//! Analytics module.
//!
//! Derived, rebuildable views over the ledger:
//! - Event rollups (volume, revenue, fraud, time buckets)
//! - Contestant rankings and leaderboards
//! - Live vote counter

pub mod leaderboard;
pub mod rollup;

pub use leaderboard::{leaderboard, live_counter, LeaderboardEntry, LiveCounter, SortKey};
pub use rollup::{build_rollup, Aggregator, EventRollup};
