//! Vote ledger.
//!
//! In-process transactional store for votes, fraud verdicts and the
//! append-only audit log. Every mutation is a single write-lock critical
//! section that validates before it touches state, so a failed call leaves
//! nothing behind. The ledger owns the payment state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::admission::decision::{is_suspicious, AdmissionDecision};
use crate::error::{Result, VoteError};
use crate::integrity::hash::{compute_hash, verify_hash, VoteContent};
use crate::integrity::signature::VoteSigner;
use crate::logging::structured::LogContext;
use crate::security::scorer::{HistoryEntry, RiskAssessment, VoteHistory};
use crate::storage::models::{
    Actor, AuditAction, AuditLogEntry, Category, CategoryId, Contestant, ContestantId, DeviceClass,
    Event, EventId, FraudDetection, Money, PaymentStatus, Vote, VoteId, VoteRecord,
};

/// Validated input for a new vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteDraft {
    pub event_id: EventId,
    pub contestant_id: ContestantId,
    pub voter_ip: String,
    pub voter_email: Option<String>,
    pub voter_identity: String,
    pub units: u32,
    pub payment_reference: Option<String>,
    #[serde(default)]
    pub device_class: DeviceClass,
}

/// Consistent read of everything the analytics rollup needs for one event.
#[derive(Debug, Clone)]
pub struct EventSnapshot {
    pub event: Event,
    pub contestants: Vec<Contestant>,
    pub records: Vec<VoteRecord>,
    pub revision: u64,
}

#[derive(Debug, Default)]
struct LedgerState {
    events: HashMap<EventId, Event>,
    categories: HashMap<CategoryId, Category>,
    contestants: HashMap<ContestantId, Contestant>,
    next_registration_seq: u64,
    votes: HashMap<VoteId, Vote>,
    fraud: HashMap<VoteId, FraudDetection>,
    /// Insertion order per event.
    by_event: HashMap<EventId, Vec<VoteId>>,
    /// Insertion order per voter identity.
    by_identity: HashMap<String, Vec<VoteId>>,
    audit: Vec<AuditLogEntry>,
    revision: u64,
}

impl LedgerState {
    fn record(&self, id: VoteId) -> Option<VoteRecord> {
        let vote = self.votes.get(&id)?;
        let fraud = self.fraud.get(&id)?;
        Some(VoteRecord {
            vote: vote.clone(),
            fraud: fraud.clone(),
        })
    }

    /// Returns the price per vote on success.
    fn validate(&self, draft: &VoteDraft, min_units: u32, max_units: u32, now: DateTime<Utc>) -> Result<Money> {
        if draft.units < min_units || draft.units > max_units {
            return Err(VoteError::validation(format!(
                "units must be between {} and {}, got {}",
                min_units, max_units, draft.units
            )));
        }
        if draft.voter_ip.trim().is_empty() {
            return Err(VoteError::validation("voter IP is required"));
        }

        let event = self
            .events
            .get(&draft.event_id)
            .filter(|e| e.accepts_votes_at(now))
            .ok_or_else(|| VoteError::not_found("event", draft.event_id))?;

        let contestant = self
            .contestants
            .get(&draft.contestant_id)
            .ok_or_else(|| VoteError::not_found("contestant", draft.contestant_id))?;

        let in_event = self
            .categories
            .get(&contestant.category_id)
            .map(|c| c.event_id == draft.event_id)
            .unwrap_or(false);
        if !in_event {
            return Err(VoteError::validation(format!(
                "contestant {} does not belong to event {}",
                draft.contestant_id, draft.event_id
            )));
        }

        Ok(event.price_per_vote)
    }
}

pub struct VoteLedger {
    signer: VoteSigner,
    min_units: u32,
    max_units: u32,
    state: RwLock<LedgerState>,
}

impl VoteLedger {
    pub fn new(signer: VoteSigner, min_units: u32, max_units: u32) -> Self {
        Self {
            signer,
            min_units,
            max_units,
            state: RwLock::new(LedgerState::default()),
        }
    }

    pub fn signer(&self) -> &VoteSigner {
        &self.signer
    }

    /// Monotonic counter bumped by every change to a vote.
    pub fn revision(&self) -> u64 {
        self.state.read().revision
    }

    pub fn register_event(&self, event: Event) -> Result<()> {
        if event.name.trim().is_empty() {
            return Err(VoteError::validation("event name is required"));
        }
        if let (Some(start), Some(end)) = (event.starts_at, event.ends_at) {
            if end < start {
                return Err(VoteError::validation("event ends before it starts"));
            }
        }
        log::info!("EVENT_REGISTERED event={} published={}", event.id, event.published);
        self.state.write().events.insert(event.id, event);
        Ok(())
    }

    pub fn register_category(&self, category: Category) -> Result<()> {
        let mut state = self.state.write();
        if !state.events.contains_key(&category.event_id) {
            return Err(VoteError::not_found("event", category.event_id));
        }
        state.categories.insert(category.id, category);
        Ok(())
    }

    /// Adds a contestant; the registration sequence is assigned here.
    pub fn register_contestant(
        &self,
        category_id: CategoryId,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Contestant> {
        let mut state = self.state.write();
        if !state.categories.contains_key(&category_id) {
            return Err(VoteError::not_found("category", category_id));
        }
        state.next_registration_seq += 1;
        let contestant = Contestant {
            id: ContestantId::new(),
            category_id,
            name: name.to_string(),
            registration_seq: state.next_registration_seq,
            created_at: now,
        };
        state.contestants.insert(contestant.id, contestant.clone());
        Ok(contestant)
    }

    pub fn event(&self, id: EventId) -> Option<Event> {
        self.state.read().events.get(&id).cloned()
    }

    /// Check a draft without writing. Returns the price per vote.
    pub fn validate(&self, draft: &VoteDraft, now: DateTime<Utc>) -> Result<Money> {
        self.state
            .read()
            .validate(draft, self.min_units, self.max_units, now)
    }

    /// Persist a vote, its fraud verdict and audit entries as one unit.
    pub fn create_vote(
        &self,
        draft: &VoteDraft,
        assessment: &RiskAssessment,
        decision: &AdmissionDecision,
        now: DateTime<Utc>,
        ctx: &LogContext,
    ) -> Result<VoteRecord> {
        let mut state = self.state.write();
        let price = state.validate(draft, self.min_units, self.max_units, now)?;
        let amount = price.times_units(draft.units)?;

        let vote = Vote {
            id: VoteId::new(),
            contestant_id: draft.contestant_id,
            event_id: draft.event_id,
            voter_ip: draft.voter_ip.clone(),
            voter_email: draft.voter_email.clone(),
            voter_identity: draft.voter_identity.clone(),
            units: draft.units,
            amount,
            payment_status: PaymentStatus::Pending,
            payment_reference: draft.payment_reference.clone(),
            device_class: draft.device_class,
            created_at: now,
            updated_at: now,
        };
        let ctx = ctx
            .with_event(&vote.event_id.to_string())
            .with_vote(&vote.id.to_string());

        let content_hash = compute_hash(&VoteContent::from(&vote))?;
        let signature = self.signer.sign(vote.id, vote.event_id, &vote.voter_ip)?;

        let quarantined = decision.is_quarantined();
        let fraud = FraudDetection {
            vote_id: vote.id,
            device_fingerprint: assessment.device_fingerprint.clone(),
            risk_score: assessment.reported_score(),
            raw_risk_score: assessment.raw_score,
            flags: assessment.flags.clone(),
            checks: assessment.checks,
            is_suspicious: is_suspicious(assessment),
            is_quarantined: quarantined,
            signature,
            content_hash,
            created_at: now,
        };

        let ip = Some(vote.voter_ip.as_str());
        let mut entries = vec![AuditLogEntry::new(
            Some(vote.id),
            AuditAction::VoteCreated,
            format!("{} units for contestant {}", vote.units, vote.contestant_id),
            Actor::System,
            now,
        )
        .with_meta("event_id", vote.event_id)
        .with_meta("amount", vote.amount)
        .with_meta("risk_score", fraud.risk_score)
        .with_ip(ip)];

        if assessment.system_error {
            entries.push(
                AuditLogEntry::new(
                    Some(vote.id),
                    AuditAction::SecurityEvaluationFailed,
                    "fraud scorer failed; vote held at maximum risk",
                    Actor::System,
                    now,
                )
                .with_ip(ip),
            );
        }

        if let AdmissionDecision::Quarantine(reason) = decision {
            entries.push(
                AuditLogEntry::new(
                    Some(vote.id),
                    AuditAction::FraudDetected,
                    format!("vote quarantined: {}", reason),
                    Actor::System,
                    now,
                )
                .with_meta("risk_score", fraud.risk_score)
                .with_meta("raw_risk_score", fraud.raw_risk_score)
                .with_meta("flags", assessment.flag_tokens().join(","))
                .with_ip(ip),
            );
        }

        let record = VoteRecord {
            vote: vote.clone(),
            fraud: fraud.clone(),
        };

        state.by_event.entry(vote.event_id).or_default().push(vote.id);
        state
            .by_identity
            .entry(vote.voter_identity.clone())
            .or_default()
            .push(vote.id);
        state.fraud.insert(vote.id, fraud);
        state.votes.insert(vote.id, vote);
        state.audit.extend(entries);
        state.revision += 1;

        log::info!(
            "{} VOTE_CREATED units={} amount={} risk_score={} quarantined={}",
            ctx,
            record.vote.units,
            record.vote.amount,
            record.fraud.risk_score,
            quarantined
        );

        Ok(record)
    }

    /// Apply a payment status change.
    ///
    /// Only completed, failed and refunded are valid targets. Same-status
    /// resubmission of one of those returns the current record without an
    /// audit entry. A disallowed transition is audited and returned as
    /// `InvalidTransition`.
    pub fn update_payment(
        &self,
        vote_id: VoteId,
        status: PaymentStatus,
        reference: Option<&str>,
        actor: Actor,
        now: DateTime<Utc>,
        ctx: &LogContext,
    ) -> Result<VoteRecord> {
        let mut state = self.state.write();

        let (current, event_id) = state
            .votes
            .get(&vote_id)
            .map(|v| (v.payment_status, v.event_id))
            .ok_or_else(|| VoteError::not_found("vote", vote_id))?;
        let ctx = ctx
            .with_event(&event_id.to_string())
            .with_vote(&vote_id.to_string());

        let allowed = status.is_valid_target() && (current == status || current.can_transition_to(status));
        if allowed && current == status {
            log::debug!("{} PAYMENT_UPDATE_NOOP status={}", ctx, status);
            return state
                .record(vote_id)
                .ok_or_else(|| VoteError::not_found("vote", vote_id));
        }

        if !allowed {
            log::warn!("{} PAYMENT_TRANSITION_REJECTED from={} to={}", ctx, current, status);
            let entry = AuditLogEntry::new(
                Some(vote_id),
                AuditAction::PaymentTransitionRejected,
                format!("rejected payment transition {} -> {}", current, status),
                actor,
                now,
            )
            .with_meta("old_status", current)
            .with_meta("new_status", status)
            .with_meta("reference", reference.unwrap_or(""));
            state.audit.push(entry);
            return Err(VoteError::InvalidTransition {
                vote_id: vote_id.to_string(),
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        let reference = {
            let vote = state
                .votes
                .get_mut(&vote_id)
                .ok_or_else(|| VoteError::not_found("vote", vote_id))?;
            vote.payment_status = status;
            if let Some(r) = reference {
                vote.payment_reference = Some(r.to_string());
            }
            vote.updated_at = now;
            vote.payment_reference.clone().unwrap_or_default()
        };

        let entry = AuditLogEntry::new(
            Some(vote_id),
            AuditAction::PaymentUpdated,
            format!("payment {} -> {}", current, status),
            actor,
            now,
        )
        .with_meta("old_status", current)
        .with_meta("new_status", status)
        .with_meta("reference", &reference);
        state.audit.push(entry);
        state.revision += 1;

        log::info!("{} PAYMENT_UPDATED from={} to={}", ctx, current, status);

        state
            .record(vote_id)
            .ok_or_else(|| VoteError::not_found("vote", vote_id))
    }

    /// Audit a cast that never produced a vote.
    pub fn record_rejection(&self, draft: &VoteDraft, error: &VoteError, now: DateTime<Utc>) {
        let entry = AuditLogEntry::new(
            None,
            AuditAction::VoteRejected,
            error.to_string(),
            Actor::System,
            now,
        )
        .with_meta("event_id", draft.event_id)
        .with_meta("contestant_id", draft.contestant_id)
        .with_meta("units", draft.units)
        .with_meta("error", error.kind())
        .with_ip(Some(draft.voter_ip.as_str()).filter(|ip| !ip.is_empty()));
        self.state.write().audit.push(entry);
    }

    pub fn get(&self, vote_id: VoteId) -> Option<VoteRecord> {
        self.state.read().record(vote_id)
    }

    /// Recompute hash and signature for a stored vote. The outcome is
    /// audited either way.
    pub fn verify_integrity(&self, vote_id: VoteId, now: DateTime<Utc>, ctx: &LogContext) -> Result<VoteRecord> {
        let record = self
            .get(vote_id)
            .ok_or_else(|| VoteError::not_found("vote", vote_id))?;
        let ctx = ctx
            .with_event(&record.vote.event_id.to_string())
            .with_vote(&vote_id.to_string());

        let hash_ok = verify_hash(&VoteContent::from(&record.vote), &record.fraud.content_hash);
        let signature_ok = self.signer.verify(
            record.vote.id,
            record.vote.event_id,
            &record.vote.voter_ip,
            &record.fraud.signature,
            &ctx,
        );

        let failure = match (hash_ok, signature_ok) {
            (true, true) => None,
            (false, true) => Some("content hash mismatch"),
            (true, false) => Some("signature mismatch"),
            (false, false) => Some("content hash and signature mismatch"),
        };

        let entry = match failure {
            None => AuditLogEntry::new(
                Some(vote_id),
                AuditAction::IntegrityVerified,
                "hash and signature verified",
                Actor::System,
                now,
            ),
            Some(reason) => {
                log::error!("{} INTEGRITY_VIOLATION reason={}", ctx, reason);
                AuditLogEntry::new(Some(vote_id), AuditAction::IntegrityViolation, reason, Actor::System, now)
                    .with_meta("hash_ok", hash_ok)
                    .with_meta("signature_ok", signature_ok)
            }
        };
        self.state.write().audit.push(entry);

        match failure {
            None => {
                log::info!("{} INTEGRITY_VERIFIED", ctx);
                Ok(record)
            }
            Some(reason) => Err(VoteError::IntegrityViolation {
                vote_id: vote_id.to_string(),
                reason: reason.to_string(),
            }),
        }
    }

    pub fn audit_log(&self) -> Vec<AuditLogEntry> {
        self.state.read().audit.clone()
    }

    pub fn audit_for(&self, vote_id: VoteId) -> Vec<AuditLogEntry> {
        self.state
            .read()
            .audit
            .iter()
            .filter(|e| e.vote_id == Some(vote_id))
            .cloned()
            .collect()
    }

    /// Event, its contestants and all of its votes at one revision.
    pub fn event_snapshot(&self, event_id: EventId) -> Result<EventSnapshot> {
        let state = self.state.read();
        let event = state
            .events
            .get(&event_id)
            .cloned()
            .ok_or_else(|| VoteError::not_found("event", event_id))?;

        let mut contestants: Vec<Contestant> = state
            .contestants
            .values()
            .filter(|c| {
                state
                    .categories
                    .get(&c.category_id)
                    .map(|cat| cat.event_id == event_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        contestants.sort_by_key(|c| c.registration_seq);

        let records = state
            .by_event
            .get(&event_id)
            .map(|ids| ids.iter().filter_map(|id| state.record(*id)).collect())
            .unwrap_or_default();

        Ok(EventSnapshot {
            event,
            contestants,
            records,
            revision: state.revision,
        })
    }

    #[cfg(test)]
    pub(crate) fn tamper_vote<F: FnOnce(&mut Vote)>(&self, vote_id: VoteId, f: F) {
        if let Some(vote) = self.state.write().votes.get_mut(&vote_id) {
            f(vote);
        }
    }
}

impl VoteHistory for VoteLedger {
    fn recent_votes(&self, identity: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let state = self.state.read();
        let entries = state
            .by_identity
            .get(identity)
            .map(|ids| {
                ids.iter()
                    .rev()
                    .filter_map(|id| state.votes.get(id))
                    .take(limit)
                    .map(|v| HistoryEntry {
                        units: v.units,
                        created_at: v.created_at,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    fn contestant_units(&self, identity: &str, event_id: EventId, contestant_id: ContestantId) -> Result<u64> {
        let state = self.state.read();
        let total = state
            .by_identity
            .get(identity)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.votes.get(id))
                    .filter(|v| v.event_id == event_id && v.contestant_id == contestant_id)
                    .map(|v| u64::from(v.units))
                    .sum()
            })
            .unwrap_or(0);
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::decision::QuarantineReason;
    use crate::config::SigningSecret;
    use crate::security::flags::{FlagKind, FraudFlag};
    use crate::storage::models::CheckOutcomes;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        ledger: VoteLedger,
        event: Event,
        contestant: Contestant,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 20, 0, 0).unwrap()
    }

    fn fixture() -> Fixture {
        let signer = VoteSigner::new(SigningSecret::new("ledger-secret")).unwrap();
        let ledger = VoteLedger::new(signer, 1, 10_000);
        let event = Event {
            id: EventId::new(),
            owner: "org".to_string(),
            name: "Grand Finale".to_string(),
            price_per_vote: Money::parse("2.50").unwrap(),
            published: true,
            starts_at: Some(t0() - Duration::days(1)),
            ends_at: Some(t0() + Duration::days(1)),
        };
        ledger.register_event(event.clone()).unwrap();
        let category = Category {
            id: CategoryId::new(),
            event_id: event.id,
            name: "Main".to_string(),
        };
        ledger.register_category(category.clone()).unwrap();
        let contestant = ledger.register_contestant(category.id, "Ada", t0()).unwrap();
        Fixture {
            ledger,
            event,
            contestant,
        }
    }

    fn draft(f: &Fixture, units: u32) -> VoteDraft {
        VoteDraft {
            event_id: f.event.id,
            contestant_id: f.contestant.id,
            voter_ip: "198.51.100.7".to_string(),
            voter_email: Some("fan@example.org".to_string()),
            voter_identity: "identity-1".to_string(),
            units,
            payment_reference: None,
            device_class: DeviceClass::Desktop,
        }
    }

    fn clean() -> RiskAssessment {
        RiskAssessment {
            raw_score: 0,
            flags: Vec::new(),
            device_fingerprint: "fp".to_string(),
            checks: CheckOutcomes::default(),
            system_error: false,
        }
    }

    fn create(f: &Fixture, units: u32) -> VoteRecord {
        let ctx = LogContext::new("test");
        f.ledger
            .create_vote(&draft(f, units), &clean(), &AdmissionDecision::Admit, t0(), &ctx)
            .unwrap()
    }

    #[test]
    fn test_create_vote_amount_and_audit() {
        let f = fixture();
        let record = create(&f, 10);
        assert_eq!(record.vote.amount.to_string(), "25.00");
        assert_eq!(record.vote.payment_status, PaymentStatus::Pending);
        assert!(!record.fraud.is_quarantined);
        assert_eq!(record.fraud.risk_score, 0);

        let audit = f.ledger.audit_for(record.vote.id);
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, AuditAction::VoteCreated);
        assert_eq!(f.ledger.revision(), 1);
    }

    #[test]
    fn test_quarantined_vote_audited() {
        let f = fixture();
        let ctx = LogContext::new("test");
        let assessment = RiskAssessment {
            raw_score: 130,
            flags: vec![FraudFlag::bare(FlagKind::BotUserAgent)],
            ..clean()
        };
        let decision = AdmissionDecision::Quarantine(QuarantineReason::RiskThreshold {
            raw_score: 130,
            threshold: 5,
        });
        let record = f
            .ledger
            .create_vote(&draft(&f, 1), &assessment, &decision, t0(), &ctx)
            .unwrap();

        assert!(record.fraud.is_quarantined);
        assert!(record.fraud.is_suspicious);
        assert_eq!(record.fraud.risk_score, 100);
        assert_eq!(record.fraud.raw_risk_score, 130);

        let actions: Vec<AuditAction> = f.ledger.audit_for(record.vote.id).iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::VoteCreated, AuditAction::FraudDetected]);
    }

    #[test]
    fn test_system_error_audited() {
        let f = fixture();
        let ctx = LogContext::new("test");
        let assessment = RiskAssessment::system_error("fp".to_string());
        let decision = AdmissionDecision::Quarantine(QuarantineReason::SystemError);
        let record = f
            .ledger
            .create_vote(&draft(&f, 1), &assessment, &decision, t0(), &ctx)
            .unwrap();

        let actions: Vec<AuditAction> = f.ledger.audit_for(record.vote.id).iter().map(|e| e.action).collect();
        assert!(actions.contains(&AuditAction::SecurityEvaluationFailed));
        assert!(actions.contains(&AuditAction::FraudDetected));
    }

    #[test]
    fn test_validation_leaves_no_state() {
        let f = fixture();
        let ctx = LogContext::new("test");

        let err = f
            .ledger
            .create_vote(&draft(&f, 0), &clean(), &AdmissionDecision::Admit, t0(), &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = f
            .ledger
            .create_vote(&draft(&f, 10_001), &clean(), &AdmissionDecision::Admit, t0(), &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let mut d = draft(&f, 1);
        d.event_id = EventId::new();
        let err = f.ledger.validate(&d, t0()).unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let mut d = draft(&f, 1);
        d.contestant_id = ContestantId::new();
        let err = f.ledger.validate(&d, t0()).unwrap_err();
        assert_eq!(err.kind(), "not_found");

        // Outside the voting window.
        let err = f.ledger.validate(&draft(&f, 1), t0() + Duration::days(3)).unwrap_err();
        assert_eq!(err.kind(), "not_found");

        assert_eq!(f.ledger.revision(), 0);
        assert!(f.ledger.audit_log().is_empty());
    }

    #[test]
    fn test_contestant_from_other_event_rejected() {
        let f = fixture();
        let other = Event {
            id: EventId::new(),
            name: "Other".to_string(),
            ..f.event.clone()
        };
        f.ledger.register_event(other.clone()).unwrap();
        let category = Category {
            id: CategoryId::new(),
            event_id: other.id,
            name: "Side".to_string(),
        };
        f.ledger.register_category(category.clone()).unwrap();
        let stranger = f.ledger.register_contestant(category.id, "Bo", t0()).unwrap();
        assert_eq!(stranger.registration_seq, f.contestant.registration_seq + 1);

        let mut d = draft(&f, 1);
        d.contestant_id = stranger.id;
        assert_eq!(f.ledger.validate(&d, t0()).unwrap_err().kind(), "validation");
    }

    #[test]
    fn test_payment_state_machine() {
        let f = fixture();
        let ctx = LogContext::new("test");
        let id = create(&f, 2).vote.id;

        let record = f
            .ledger
            .update_payment(id, PaymentStatus::Completed, Some("ps_123"), Actor::Processor("paystack".into()), t0(), &ctx)
            .unwrap();
        assert_eq!(record.vote.payment_status, PaymentStatus::Completed);
        assert_eq!(record.vote.payment_reference.as_deref(), Some("ps_123"));

        // Idempotent resubmission writes nothing.
        let before = f.ledger.audit_for(id).len();
        f.ledger
            .update_payment(id, PaymentStatus::Completed, Some("ps_123"), Actor::System, t0(), &ctx)
            .unwrap();
        assert_eq!(f.ledger.audit_for(id).len(), before);

        let err = f
            .ledger
            .update_payment(id, PaymentStatus::Pending, None, Actor::System, t0(), &ctx)
            .unwrap_err();
        assert!(matches!(err, VoteError::InvalidTransition { .. }));
        let last = f.ledger.audit_for(id).pop().unwrap();
        assert_eq!(last.action, AuditAction::PaymentTransitionRejected);
        assert_eq!(last.metadata.get("old_status").map(String::as_str), Some("completed"));

        f.ledger
            .update_payment(id, PaymentStatus::Refunded, None, Actor::System, t0(), &ctx)
            .unwrap();
        assert!(f
            .ledger
            .update_payment(id, PaymentStatus::Completed, None, Actor::System, t0(), &ctx)
            .is_err());
    }

    #[test]
    fn test_pending_is_never_a_valid_target() {
        let f = fixture();
        let ctx = LogContext::new("test");
        let id = create(&f, 1).vote.id;
        let revision = f.ledger.revision();

        let err = f
            .ledger
            .update_payment(id, PaymentStatus::Pending, Some("x"), Actor::System, t0(), &ctx)
            .unwrap_err();
        assert_eq!(
            err,
            VoteError::InvalidTransition {
                vote_id: id.to_string(),
                from: "pending".to_string(),
                to: "pending".to_string(),
            }
        );
        let last = f.ledger.audit_for(id).pop().unwrap();
        assert_eq!(last.action, AuditAction::PaymentTransitionRejected);
        assert_eq!(f.ledger.revision(), revision);
        assert_eq!(f.ledger.get(id).unwrap().vote.payment_reference, None);
    }

    #[test]
    fn test_failed_then_late_success() {
        let f = fixture();
        let ctx = LogContext::new("test");
        let id = create(&f, 1).vote.id;
        f.ledger
            .update_payment(id, PaymentStatus::Failed, None, Actor::System, t0(), &ctx)
            .unwrap();
        let record = f
            .ledger
            .update_payment(id, PaymentStatus::Completed, Some("late"), Actor::System, t0(), &ctx)
            .unwrap();
        assert_eq!(record.vote.payment_status, PaymentStatus::Completed);
    }

    #[test]
    fn test_update_missing_vote() {
        let f = fixture();
        let ctx = LogContext::new("test");
        let err = f
            .ledger
            .update_payment(VoteId::new(), PaymentStatus::Completed, None, Actor::System, t0(), &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_integrity_detects_tampering() {
        let f = fixture();
        let ctx = LogContext::new("test");
        let id = create(&f, 3).vote.id;

        assert!(f.ledger.verify_integrity(id, t0(), &ctx).is_ok());

        f.ledger.tamper_vote(id, |v| v.units = 300);
        let err = f.ledger.verify_integrity(id, t0(), &ctx).unwrap_err();
        assert!(matches!(err, VoteError::IntegrityViolation { .. }));

        f.ledger.tamper_vote(id, |v| {
            v.units = 3;
            v.voter_ip = "203.0.113.99".to_string();
        });
        let err = f.ledger.verify_integrity(id, t0(), &ctx).unwrap_err();
        assert_eq!(
            err,
            VoteError::IntegrityViolation {
                vote_id: id.to_string(),
                reason: "signature mismatch".to_string()
            }
        );

        let actions: Vec<AuditAction> = f.ledger.audit_for(id).iter().map(|e| e.action).collect();
        assert!(actions.contains(&AuditAction::IntegrityVerified));
        assert_eq!(
            actions.iter().filter(|a| **a == AuditAction::IntegrityViolation).count(),
            2
        );
    }

    #[test]
    fn test_history_queries() {
        let f = fixture();
        create(&f, 5);
        create(&f, 7);

        let history = f.ledger.recent_votes("identity-1", 10).unwrap();
        assert_eq!(history.iter().map(|h| h.units).collect::<Vec<_>>(), vec![7, 5]);
        assert_eq!(f.ledger.recent_votes("identity-1", 1).unwrap().len(), 1);
        assert!(f.ledger.recent_votes("nobody", 10).unwrap().is_empty());

        assert_eq!(
            f.ledger
                .contestant_units("identity-1", f.event.id, f.contestant.id)
                .unwrap(),
            12
        );
    }

    #[test]
    fn test_rejection_audit_has_no_vote() {
        let f = fixture();
        let d = draft(&f, 0);
        f.ledger
            .record_rejection(&d, &VoteError::validation("units out of range"), t0());
        let log = f.ledger.audit_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, AuditAction::VoteRejected);
        assert_eq!(log[0].vote_id, None);
        assert_eq!(log[0].metadata.get("error").map(String::as_str), Some("validation"));
    }

    #[test]
    fn test_event_snapshot() {
        let f = fixture();
        create(&f, 1);
        create(&f, 2);
        let snapshot = f.ledger.event_snapshot(f.event.id).unwrap();
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.contestants.len(), 1);
        assert_eq!(snapshot.revision, 2);
        assert!(f.ledger.event_snapshot(EventId::new()).is_err());
    }
}
