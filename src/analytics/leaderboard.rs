//! Leaderboards and the live vote counter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::analytics::rollup::{ratio, EventRollup};
use crate::error::{Result, VoteError};
use crate::storage::ledger::EventSnapshot;
use crate::storage::models::{ContestantId, EventId, Money, PaymentStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    Votes,
    Revenue,
    Momentum,
}

impl SortKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortKey::Votes => "votes",
            SortKey::Revenue => "revenue",
            SortKey::Momentum => "momentum",
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SortKey {
    type Err = VoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "votes" | "" => Ok(SortKey::Votes),
            "revenue" => Ok(SortKey::Revenue),
            "momentum" => Ok(SortKey::Momentum),
            other => Err(VoteError::validation(format!("unknown sort key: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub contestant_id: ContestantId,
    pub name: String,
    pub total_votes: u64,
    pub total_revenue: Money,
    pub momentum: u64,
    pub percentage_of_total: Decimal,
}

/// Top `limit` contestants by `sort`. Ties fall back to total units, then
/// registration order. Ranks are assigned here, on every read.
pub fn leaderboard(rollup: &EventRollup, sort: SortKey, limit: usize) -> Vec<LeaderboardEntry> {
    let mut rows: Vec<_> = rollup.contestants.iter().collect();
    rows.sort_by(|a, b| {
        let primary = match sort {
            SortKey::Votes => b.total_votes.cmp(&a.total_votes),
            SortKey::Revenue => b.total_revenue.cmp(&a.total_revenue),
            SortKey::Momentum => b.momentum.cmp(&a.momentum),
        };
        primary
            .then(b.total_votes.cmp(&a.total_votes))
            .then(a.registration_seq.cmp(&b.registration_seq))
    });

    rows.into_iter()
        .take(limit)
        .enumerate()
        .map(|(idx, c)| LeaderboardEntry {
            rank: idx as u32 + 1,
            contestant_id: c.contestant_id,
            name: c.name.clone(),
            total_votes: c.total_votes,
            total_revenue: c.total_revenue,
            momentum: c.momentum,
            percentage_of_total: c.percentage_of_total,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderSummary {
    pub contestant_id: ContestantId,
    pub name: String,
    pub total_votes: u64,
}

/// Recent completed-vote activity for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveCounter {
    pub event_id: EventId,
    pub total_votes: u64,
    pub votes_last_minute: u64,
    pub votes_last_hour: u64,
    pub votes_last_24_hours: u64,
    /// Units per minute over the last hour.
    pub velocity_per_minute: Decimal,
    pub leader: Option<LeaderSummary>,
    pub as_of: DateTime<Utc>,
}

pub fn live_counter(snapshot: &EventSnapshot, rollup: &EventRollup, now: DateTime<Utc>) -> LiveCounter {
    let since = |window: Duration| -> u64 {
        let cutoff = now - window;
        snapshot
            .records
            .iter()
            .filter(|r| r.vote.payment_status == PaymentStatus::Completed && r.vote.created_at >= cutoff)
            .map(|r| u64::from(r.vote.units))
            .sum()
    };
    let last_hour = since(Duration::hours(1));

    let leader = rollup
        .contestants
        .iter()
        .find(|c| c.vote_rank == 1 && c.total_votes > 0)
        .map(|c| LeaderSummary {
            contestant_id: c.contestant_id,
            name: c.name.clone(),
            total_votes: c.total_votes,
        });

    LiveCounter {
        event_id: snapshot.event.id,
        total_votes: rollup.analytics.total_votes,
        votes_last_minute: since(Duration::minutes(1)),
        votes_last_hour: last_hour,
        votes_last_24_hours: since(Duration::hours(24)),
        velocity_per_minute: ratio(last_hour, 60),
        leader,
        as_of: now,
    }
}
