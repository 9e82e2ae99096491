//! Event analytics rollups.
//!
//! A rollup is rebuilt from a ledger snapshot and never edited in place.
//! Volume and revenue figures count completed payments only. Status counts
//! and fraud figures cover every vote. Recent-activity windows are anchored
//! on the latest completed vote rather than the wall clock, and all maps are
//! ordered, so a rebuild over unchanged input serializes to identical bytes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Duration, DurationRound, NaiveDate, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::logging::structured::LogContext;
use crate::storage::ledger::{EventSnapshot, VoteLedger};
use crate::storage::models::{ContestantId, DeviceClass, EventId, Money, PaymentStatus, VoteRecord};

/// Span of the hourly series, back from the latest completed vote.
pub const TIMELINE_HOURS: i64 = 24;

/// `numerator * 100 / denominator` to two places; zero when the
/// denominator is zero.
pub(crate) fn percentage(numerator: u64, denominator: u64) -> Decimal {
    ratio(numerator * 100, denominator)
}

/// `numerator / denominator` to two places; zero when the denominator is
/// zero.
pub(crate) fn ratio(numerator: u64, denominator: u64) -> Decimal {
    if denominator == 0 {
        return Decimal::new(0, 2);
    }
    let mut value = (Decimal::from(numerator) / Decimal::from(denominator)).round_dp(2);
    value.rescale(2);
    value
}

/// Event-level volume and payment figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAnalytics {
    pub event_id: EventId,
    /// Completed units.
    pub total_votes: u64,
    /// Distinct voter identities with a completed vote.
    pub unique_voters: usize,
    pub total_vote_amount: Money,
    pub average_vote_price: Money,
    pub completed_payments: usize,
    pub pending_payments: usize,
    pub failed_payments: usize,
    pub refunded_payments: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudSummary {
    pub flagged_votes: usize,
    pub quarantined_votes: usize,
    /// `flagged / (completed units + flagged) * 100`.
    pub fraud_detection_rate: Decimal,
}

/// Amount by payment status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueSummary {
    pub completed: Money,
    pub pending: Money,
    pub failed: Money,
    pub refunded: Money,
    /// completed + pending + failed; refunds are reported apart.
    pub total: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour_start: DateTime<Utc>,
    pub vote_count: u64,
    pub unique_voters: usize,
    pub revenue: Money,
    pub avg_votes_per_voter: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySnapshot {
    pub date: NaiveDate,
    pub vote_count: u64,
    pub unique_voters: usize,
    pub revenue: Money,
}

/// Completed units per device class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBreakdown {
    pub device_class: DeviceClass,
    pub votes: u64,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestantAnalytics {
    pub contestant_id: ContestantId,
    pub name: String,
    pub registration_seq: u64,
    pub total_votes: u64,
    pub total_revenue: Money,
    /// 1-based, by total units then registration order.
    pub vote_rank: u32,
    pub percentage_of_total: Decimal,
    pub votes_in_last_hour: u64,
    pub votes_in_last_24_hours: u64,
    /// Units in the hour up to the latest completed vote.
    pub momentum: u64,
}

/// Everything the dashboard shows for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRollup {
    pub event_id: EventId,
    /// Ledger revision the rollup was built from.
    pub revision: u64,
    /// Creation time of the latest completed vote; `None` before any.
    pub as_of: Option<DateTime<Utc>>,
    pub analytics: EventAnalytics,
    pub fraud: FraudSummary,
    pub revenue: RevenueSummary,
    pub hourly: Vec<HourlyBucket>,
    pub daily: Vec<DailySnapshot>,
    /// Largest share first.
    pub devices: Vec<DeviceBreakdown>,
    /// Ranked.
    pub contestants: Vec<ContestantAnalytics>,
}

#[derive(Default)]
struct BucketAcc {
    units: u64,
    revenue: Vec<Money>,
    voters: BTreeSet<String>,
}

impl BucketAcc {
    fn add(&mut self, record: &VoteRecord) {
        self.units += u64::from(record.vote.units);
        self.revenue.push(record.vote.amount);
        self.voters.insert(record.vote.voter_identity.clone());
    }

    fn revenue(&self) -> Money {
        self.revenue.iter().copied().sum()
    }
}

fn completed(records: &[VoteRecord]) -> impl Iterator<Item = &VoteRecord> {
    records
        .iter()
        .filter(|r| r.vote.payment_status == PaymentStatus::Completed)
}

fn amount_with_status(records: &[VoteRecord], status: PaymentStatus) -> Money {
    records
        .iter()
        .filter(|r| r.vote.payment_status == status)
        .map(|r| r.vote.amount)
        .sum()
}

fn count_with_status(records: &[VoteRecord], status: PaymentStatus) -> usize {
    records
        .iter()
        .filter(|r| r.vote.payment_status == status)
        .count()
}

/// Sort contestants by units descending, ties by registration order, and
/// assign 1-based ranks.
pub fn rank_contestants(contestants: &mut [ContestantAnalytics]) {
    contestants.sort_by(|a, b| {
        b.total_votes
            .cmp(&a.total_votes)
            .then(a.registration_seq.cmp(&b.registration_seq))
    });
    for (idx, c) in contestants.iter_mut().enumerate() {
        c.vote_rank = idx as u32 + 1;
    }
}

/// Build a rollup from a snapshot. Pure: the same snapshot always gives
/// the same rollup.
pub fn build_rollup(snapshot: &EventSnapshot) -> EventRollup {
    let records = &snapshot.records;
    let event_id = snapshot.event.id;

    let as_of = completed(records).map(|r| r.vote.created_at).max();
    let within = |span: Duration, at: DateTime<Utc>| as_of.map_or(false, |anchor| at >= anchor - span);

    let mut overall = BucketAcc::default();
    let mut hourly: BTreeMap<DateTime<Utc>, BucketAcc> = BTreeMap::new();
    let mut daily: BTreeMap<NaiveDate, BucketAcc> = BTreeMap::new();
    let mut devices: BTreeMap<DeviceClass, u64> = BTreeMap::new();
    let mut per_contestant: HashMap<ContestantId, (BucketAcc, u64, u64)> = HashMap::new();

    for record in completed(records) {
        let created = record.vote.created_at;
        let units = u64::from(record.vote.units);
        overall.add(record);

        if within(Duration::hours(TIMELINE_HOURS), created) {
            let hour = created.duration_trunc(Duration::hours(1)).unwrap_or(created);
            hourly.entry(hour).or_default().add(record);
        }
        daily.entry(created.date_naive()).or_default().add(record);
        *devices.entry(record.vote.device_class).or_default() += units;

        let entry = per_contestant.entry(record.vote.contestant_id).or_default();
        entry.0.add(record);
        if within(Duration::hours(1), created) {
            entry.1 += units;
        }
        if within(Duration::hours(24), created) {
            entry.2 += units;
        }
    }

    let analytics = EventAnalytics {
        event_id,
        total_votes: overall.units,
        unique_voters: overall.voters.len(),
        total_vote_amount: overall.revenue(),
        average_vote_price: overall.revenue().average_over(overall.units),
        completed_payments: count_with_status(records, PaymentStatus::Completed),
        pending_payments: count_with_status(records, PaymentStatus::Pending),
        failed_payments: count_with_status(records, PaymentStatus::Failed),
        refunded_payments: count_with_status(records, PaymentStatus::Refunded),
    };

    let flagged = records.iter().filter(|r| r.fraud.is_suspicious).count();
    let fraud = FraudSummary {
        flagged_votes: flagged,
        quarantined_votes: records.iter().filter(|r| r.fraud.is_quarantined).count(),
        fraud_detection_rate: if overall.units > 0 {
            percentage(flagged as u64, overall.units + flagged as u64)
        } else {
            Decimal::new(0, 2)
        },
    };

    let completed_amount = amount_with_status(records, PaymentStatus::Completed);
    let pending_amount = amount_with_status(records, PaymentStatus::Pending);
    let failed_amount = amount_with_status(records, PaymentStatus::Failed);
    let revenue = RevenueSummary {
        completed: completed_amount,
        pending: pending_amount,
        failed: failed_amount,
        refunded: amount_with_status(records, PaymentStatus::Refunded),
        total: [completed_amount, pending_amount, failed_amount].into_iter().sum(),
    };

    let hourly = hourly
        .into_iter()
        .map(|(hour_start, acc)| HourlyBucket {
            hour_start,
            vote_count: acc.units,
            unique_voters: acc.voters.len(),
            revenue: acc.revenue(),
            avg_votes_per_voter: ratio(acc.units, acc.voters.len() as u64),
        })
        .collect();

    let daily = daily
        .into_iter()
        .map(|(date, acc)| DailySnapshot {
            date,
            vote_count: acc.units,
            unique_voters: acc.voters.len(),
            revenue: acc.revenue(),
        })
        .collect();

    let mut devices: Vec<DeviceBreakdown> = devices
        .into_iter()
        .map(|(device_class, votes)| DeviceBreakdown {
            device_class,
            votes,
            percentage: percentage(votes, overall.units),
        })
        .collect();
    // Stable sort keeps class order for ties.
    devices.sort_by(|a, b| b.votes.cmp(&a.votes));

    let mut contestants: Vec<ContestantAnalytics> = snapshot
        .contestants
        .iter()
        .map(|c| {
            let (units, revenue, last_hour, last_day) = per_contestant
                .get(&c.id)
                .map(|(acc, h, d)| (acc.units, acc.revenue(), *h, *d))
                .unwrap_or((0, Money::zero(), 0, 0));
            ContestantAnalytics {
                contestant_id: c.id,
                name: c.name.clone(),
                registration_seq: c.registration_seq,
                total_votes: units,
                total_revenue: revenue,
                vote_rank: 0,
                percentage_of_total: percentage(units, overall.units),
                votes_in_last_hour: last_hour,
                votes_in_last_24_hours: last_day,
                momentum: last_hour,
            }
        })
        .collect();
    rank_contestants(&mut contestants);

    EventRollup {
        event_id,
        revision: snapshot.revision,
        as_of,
        analytics,
        fraud,
        revenue,
        hourly,
        daily,
        devices,
        contestants,
    }
}

/// Stored rollups, one per event.
#[derive(Default)]
pub struct Aggregator {
    rollups: RwLock<HashMap<EventId, EventRollup>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `rollup` unless a rollup from a newer ledger revision is
    /// already stored. Returns whichever rollup is current afterwards.
    pub fn store(&self, rollup: EventRollup) -> EventRollup {
        let mut rollups = self.rollups.write();
        match rollups.get(&rollup.event_id) {
            Some(existing) if existing.revision > rollup.revision => {
                log::debug!(
                    "ROLLUP_STALE_DISCARDED event={} revision={} stored_revision={}",
                    rollup.event_id,
                    rollup.revision,
                    existing.revision
                );
                existing.clone()
            }
            _ => {
                rollups.insert(rollup.event_id, rollup.clone());
                rollup
            }
        }
    }

    /// Current rollup for an event. Rebuilds from the ledger only when the
    /// ledger revision has moved past the stored rollup.
    pub fn recompute(&self, ledger: &VoteLedger, event_id: EventId, ctx: &LogContext) -> Result<EventRollup> {
        let revision = ledger.revision();
        if let Some(current) = self.get(event_id).filter(|r| r.revision == revision) {
            log::debug!("{} ROLLUP_UP_TO_DATE event={} revision={}", ctx, event_id, revision);
            return Ok(current);
        }
        let snapshot = ledger.event_snapshot(event_id)?;
        Ok(self.refresh(&snapshot, ctx))
    }

    /// Rollup for `snapshot`, reusing the stored one when it was built
    /// from the same revision.
    pub fn refresh(&self, snapshot: &EventSnapshot, ctx: &LogContext) -> EventRollup {
        let event_id = snapshot.event.id;
        if let Some(current) = self.get(event_id).filter(|r| r.revision == snapshot.revision) {
            return current;
        }
        let rollup = build_rollup(snapshot);
        log::debug!(
            "{} ROLLUP_RECOMPUTED event={} revision={} total_votes={} contestants={}",
            ctx,
            event_id,
            rollup.revision,
            rollup.analytics.total_votes,
            rollup.contestants.len()
        );
        self.store(rollup)
    }

    pub fn get(&self, event_id: EventId) -> Option<EventRollup> {
        self.rollups.read().get(&event_id).cloned()
    }
}
