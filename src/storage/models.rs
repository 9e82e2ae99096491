//! Ledger models.
//!
//! These models represent the records owned by the vote ledger plus the
//! catalog entities (events, categories, contestants) it validates against.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VoteError};
use crate::security::flags::FraudFlag;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = VoteError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| VoteError::validation(format!("invalid {}: {}", stringify!($name), e)))
            }
        }
    };
}

id_type!(
    /// Voting contest identifier.
    EventId
);
id_type!(CategoryId);
id_type!(ContestantId);
id_type!(
    /// Ledger row identifier.
    VoteId
);

/// Fixed-point currency amount, two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const SCALE: u32 = 2;

    pub fn zero() -> Self {
        Self(Decimal::new(0, Self::SCALE))
    }

    pub fn from_cents(cents: i64) -> Self {
        Self(Decimal::new(cents, Self::SCALE))
    }

    /// Parse a decimal string such as "2.50". More than two decimal places
    /// is rejected rather than rounded.
    pub fn parse(s: &str) -> Result<Self> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| VoteError::validation(format!("invalid amount {:?}: {}", s, e)))?;
        Self::from_decimal(value)
    }

    pub fn from_decimal(value: Decimal) -> Result<Self> {
        if value.is_sign_negative() {
            return Err(VoteError::validation("amount must not be negative"));
        }
        if value.scale() > Self::SCALE && value.round_dp(Self::SCALE) != value {
            return Err(VoteError::validation(format!(
                "amount {} has more than {} decimal places",
                value,
                Self::SCALE
            )));
        }
        let mut value = value.round_dp(Self::SCALE);
        value.rescale(Self::SCALE);
        Ok(Self(value))
    }

    /// `self * units`, exact.
    pub fn times_units(&self, units: u32) -> Result<Self> {
        let mut product = self
            .0
            .checked_mul(Decimal::from(units))
            .ok_or_else(|| VoteError::validation("vote amount overflow"))?;
        product.rescale(Self::SCALE);
        Ok(Self(product))
    }

    pub fn checked_add(&self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(|mut v| {
            v.rescale(Self::SCALE);
            Money(v)
        })
    }

    /// `self / count` rounded to cents; zero when `count` is zero.
    pub fn average_over(&self, count: u64) -> Money {
        if count == 0 {
            return Money::zero();
        }
        let mut avg = (self.0 / Decimal::from(count)).round_dp(Self::SCALE);
        avg.rescale(Self::SCALE);
        Money(avg)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        let mut total = Decimal::new(0, Money::SCALE);
        for m in iter {
            total += m.0;
        }
        total.rescale(Money::SCALE);
        Money(total)
    }
}

/// A voting contest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub owner: String,
    pub name: String,
    pub price_per_vote: Money,
    pub published: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Votes are accepted only while published and inside whichever
    /// window bounds are set.
    pub fn accepts_votes_at(&self, now: DateTime<Utc>) -> bool {
        if !self.published {
            return false;
        }
        if matches!(self.starts_at, Some(start) if now < start) {
            return false;
        }
        if matches!(self.ends_at, Some(end) if now > end) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub event_id: EventId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contestant {
    pub id: ContestantId,
    pub category_id: CategoryId,
    pub name: String,
    /// Registration order within the ledger; ranking tie-breaker.
    pub registration_seq: u64,
    pub created_at: DateTime<Utc>,
}

/// Payment lifecycle of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    /// Allowed payment transitions. Same-status resubmission is handled
    /// by the ledger as a no-op before this is consulted.
    ///
    /// ```text
    /// pending   -> completed | failed | refunded
    /// failed    -> completed
    /// completed -> refunded
    /// ```
    /// Statuses a payment update may move a vote into.
    pub fn is_valid_target(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Refunded)
                | (Failed, Completed)
                | (Completed, Refunded)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = VoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(VoteError::validation(format!(
                "unknown payment status: {}",
                other
            ))),
        }
    }
}

/// Coarse device type of the submitting browser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
    #[default]
    Unknown,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The central ledger entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub contestant_id: ContestantId,
    pub event_id: EventId,
    pub voter_ip: String,
    pub voter_email: Option<String>,
    pub voter_identity: String,
    pub units: u32,
    pub amount: Money,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    #[serde(default)]
    pub device_class: DeviceClass,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Results of the individual sub-checks. `true` means passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcomes {
    pub velocity: bool,
    pub behavioral: bool,
    pub geographic: bool,
    pub ip_reputation: bool,
    pub email_reputation: bool,
}

impl Default for CheckOutcomes {
    fn default() -> Self {
        Self {
            velocity: true,
            behavioral: true,
            geographic: true,
            ip_reputation: true,
            email_reputation: true,
        }
    }
}

/// Fraud verdict persisted alongside each vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudDetection {
    pub vote_id: VoteId,
    pub device_fingerprint: String,
    /// Clamped to 0..=100 for reporting.
    pub risk_score: u32,
    /// Unclamped accumulation, kept for threshold tuning.
    pub raw_risk_score: u32,
    pub flags: Vec<FraudFlag>,
    pub checks: CheckOutcomes,
    pub is_suspicious: bool,
    pub is_quarantined: bool,
    pub signature: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A vote together with its fraud verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub vote: Vote,
    pub fraud: FraudDetection,
}

/// Audit log action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    VoteCreated,
    FraudDetected,
    SecurityEvaluationFailed,
    VoteRejected,
    PaymentUpdated,
    PaymentTransitionRejected,
    IntegrityVerified,
    IntegrityViolation,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::VoteCreated => "vote_created",
            AuditAction::FraudDetected => "fraud_detected",
            AuditAction::SecurityEvaluationFailed => "security_evaluation_failed",
            AuditAction::VoteRejected => "vote_rejected",
            AuditAction::PaymentUpdated => "payment_updated",
            AuditAction::PaymentTransitionRejected => "payment_transition_rejected",
            AuditAction::IntegrityVerified => "integrity_verified",
            AuditAction::IntegrityViolation => "integrity_violation",
        };
        f.write_str(s)
    }
}

/// Who caused an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Actor {
    System,
    Processor(String),
    Human(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => write!(f, "system"),
            Actor::Processor(name) => write!(f, "processor:{}", name),
            Actor::Human(name) => write!(f, "human:{}", name),
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub vote_id: Option<VoteId>,
    pub action: AuditAction,
    pub description: String,
    pub actor: Actor,
    pub metadata: BTreeMap<String, String>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        vote_id: Option<VoteId>,
        action: AuditAction,
        description: impl Into<String>,
        actor: Actor,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vote_id,
            action,
            description: description.into(),
            actor,
            metadata: BTreeMap::new(),
            ip: None,
            created_at,
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_ip(mut self, ip: Option<&str>) -> Self {
        self.ip = ip.map(|s| s.to_string());
        self
    }
}
