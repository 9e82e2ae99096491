//! Vote casting pipeline.
//!
//! Coordinates one cast request end to end:
//! 1. Client resolution and input validation
//! 2. Fraud scoring (failures become a maximum-risk verdict)
//! 3. Admission decision
//! 4. Counter reservation
//! 5. Ledger commit (vote, fraud verdict, audit)
//! 6. Counter and fingerprint commit
//!
//! Flagged requests are persisted as quarantined votes, never dropped.
//! Analytics are rebuilt lazily on read once the ledger revision moves.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::admission::decision::decide_admission;
use crate::analytics::leaderboard::{leaderboard, live_counter, LeaderboardEntry, LiveCounter, SortKey};
use crate::analytics::rollup::{Aggregator, EventRollup};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Result, VoteError};
use crate::integrity::signature::VoteSigner;
use crate::logging::structured::LogContext;
use crate::security::counters::{CounterKeys, CounterReservation, CounterStore, InMemoryCounters};
use crate::security::fingerprint::{device_fingerprint, voter_identity, FingerprintRegistry};
use crate::security::flags::FraudFlag;
use crate::security::headers::{classify_device, resolve_client_ip, RequestHeaders};
use crate::security::reputation::{is_valid_email, ReputationCache, ReputationProvider, StaticReputationProvider};
use crate::security::scorer::{CheckSet, FraudScorer, GeographicCheck, RiskAssessment, ScoreRequest};
use crate::storage::ledger::{VoteDraft, VoteLedger};
use crate::storage::models::{
    Actor, AuditLogEntry, ContestantId, EventId, Money, PaymentStatus, VoteId, VoteRecord,
};

use super::context::RequestContext;

/// A vote submission as received from the web layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVoteRequest {
    pub event_id: EventId,
    pub contestant_id: ContestantId,
    pub units: u32,
    pub voter_email: Option<String>,
    /// Socket address of the submitting connection.
    pub remote_addr: String,
    #[serde(default)]
    pub headers: RequestHeaders,
    pub payment_reference: Option<String>,
    pub request_id: Option<String>,
}

/// Verdict returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastVoteReceipt {
    pub vote_id: VoteId,
    /// Clamped to 0..=100.
    pub risk_score: u32,
    pub flags: Vec<FraudFlag>,
    pub payment_status: PaymentStatus,
    pub total_cost: Money,
    pub quarantined: bool,
}

impl CastVoteReceipt {
    pub fn flag_tokens(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.token()).collect()
    }
}

/// The vote engine: scorer, ledger and aggregator behind one API.
pub struct VoteEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    ledger: Arc<VoteLedger>,
    counters: Arc<dyn CounterStore>,
    fingerprints: Arc<FingerprintRegistry>,
    scorer: FraudScorer,
    aggregator: Aggregator,
}

impl VoteEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn ReputationProvider>,
        counters: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        let signer = VoteSigner::new(config.signing_secret.clone())?;
        let ledger = Arc::new(VoteLedger::new(signer, config.min_units, config.max_units));
        let fingerprints = Arc::new(FingerprintRegistry::with_max_entries(
            Duration::days(config.policy.fingerprint_ttl_days),
            config.cache_max_entries,
        ));
        let reputation = Arc::new(
            ReputationCache::new(
                provider,
                config.reputation_timeout(),
                Duration::seconds(config.reputation_ttl_secs),
            )
            .with_max_entries(config.cache_max_entries),
        );
        let scorer = FraudScorer::new(
            config.policy.clone(),
            Arc::clone(&counters),
            reputation,
            Arc::clone(&fingerprints),
            ledger.clone(),
        );

        log::info!(
            "VOTE_ENGINE_READY quarantine_threshold={} reputation_timeout_ms={}",
            config.policy.quarantine_threshold,
            config.reputation_timeout_ms
        );

        Ok(Self {
            config,
            clock,
            ledger,
            counters,
            fingerprints,
            scorer,
            aggregator: Aggregator::new(),
        })
    }

    /// Wall clock, static reputation lists and in-memory counters.
    pub fn with_defaults(config: EngineConfig) -> Result<Self> {
        let counters = Arc::new(InMemoryCounters::new(Duration::minutes(
            config.policy.velocity_window_minutes,
        )));
        Self::new(
            config,
            Arc::new(SystemClock),
            Arc::new(StaticReputationProvider::new()),
            counters,
        )
    }

    pub fn with_checks(mut self, checks: CheckSet) -> Self {
        self.scorer = self.scorer.with_checks(checks);
        self
    }

    pub fn with_geographic_check(mut self, geo: Arc<dyn GeographicCheck>) -> Self {
        self.scorer = self.scorer.with_geographic_check(geo);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &VoteLedger {
        &self.ledger
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Score, admit or quarantine, and persist one vote.
    pub fn cast_vote(&self, request: CastVoteRequest) -> Result<CastVoteReceipt> {
        let now = self.clock.now();
        let rctx = RequestContext::new(request.request_id.as_deref(), now)
            .with_client(&request.headers, &request.remote_addr);
        let ctx = rctx.log_context().with_event(&request.event_id.to_string());

        log::info!(
            "{} CAST_RECEIVED contestant={} units={}",
            ctx,
            request.contestant_id,
            request.units
        );

        // [1] CLIENT RESOLUTION AND VALIDATION
        let voter_ip = resolve_client_ip(&request.headers, &request.remote_addr);
        let voter_email = request
            .voter_email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());

        let draft = VoteDraft {
            event_id: request.event_id,
            contestant_id: request.contestant_id,
            voter_identity: voter_identity(voter_email.as_deref(), &voter_ip),
            voter_ip,
            voter_email,
            units: request.units,
            payment_reference: request.payment_reference.clone(),
            device_class: classify_device(request.headers.user_agent()),
        };

        let validation = match &draft.voter_email {
            Some(email) if !is_valid_email(email) => {
                Err(VoteError::validation(format!("invalid voter email: {}", email)))
            }
            _ => self.ledger.validate(&draft, now).map(|_| ()),
        };
        if let Err(e) = validation {
            return Err(self.reject(&draft, e, now, &ctx));
        }

        // [2] FRAUD SCORING
        let assessment = self.assess(&draft, &request.headers, now, &ctx);

        // [3] ADMISSION
        let decision = decide_admission(&assessment, self.scorer.policy(), &ctx);

        // [4] COUNTER RESERVATION
        let keys = CounterKeys {
            event_id: draft.event_id,
            ip: draft.voter_ip.clone(),
            email: draft.voter_email.clone(),
            identity: draft.voter_identity.clone(),
        };
        let reservation =
            match CounterReservation::acquire(self.counters.as_ref(), &keys, u64::from(draft.units), now) {
                Ok(r) => Some(r),
                Err(e) => {
                    log::warn!("{} COUNTER_RESERVE_FAILED error={}", ctx, e);
                    None
                }
            };

        // [5] LEDGER COMMIT
        let record = match self.ledger.create_vote(&draft, &assessment, &decision, now, &ctx) {
            Ok(record) => record,
            Err(e) => {
                // Reservation is released on drop.
                drop(reservation);
                return Err(self.reject(&draft, e, now, &ctx));
            }
        };
        let ctx = ctx.with_vote(&record.vote.id.to_string());

        // [6] COUNTER AND FINGERPRINT COMMIT
        if let Some(reservation) = reservation {
            if let Err(e) = reservation.commit() {
                log::warn!("{} COUNTER_COMMIT_FAILED error={}", ctx, e);
            }
        }
        let events = self
            .fingerprints
            .record(&assessment.device_fingerprint, draft.event_id, now);
        log::debug!("{} FINGERPRINT_RECORDED events={}", ctx, events);

        log::info!(
            "{} CAST_COMPLETE decision={} risk_score={} flags={:?}",
            ctx,
            decision.as_str(),
            record.fraud.risk_score,
            assessment.flag_tokens()
        );

        Ok(CastVoteReceipt {
            vote_id: record.vote.id,
            risk_score: record.fraud.risk_score,
            flags: record.fraud.flags,
            payment_status: record.vote.payment_status,
            total_cost: record.vote.amount,
            quarantined: record.fraud.is_quarantined,
        })
    }

    /// Run the scorer. Errors and panics become a fail-closed verdict.
    fn assess(
        &self,
        draft: &VoteDraft,
        headers: &RequestHeaders,
        now: DateTime<Utc>,
        ctx: &LogContext,
    ) -> RiskAssessment {
        let request = ScoreRequest {
            event_id: draft.event_id,
            contestant_id: draft.contestant_id,
            voter_ip: &draft.voter_ip,
            voter_email: draft.voter_email.as_deref(),
            voter_identity: &draft.voter_identity,
            units: draft.units,
            headers,
            now,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.scorer.score(&request, ctx)));
        match outcome {
            Ok(Ok(assessment)) => assessment,
            Ok(Err(e)) => {
                log::error!("{} SECURITY_EVALUATION_FAILED error={}", ctx, e);
                RiskAssessment::system_error(device_fingerprint(headers, &draft.voter_ip))
            }
            Err(_) => {
                log::error!("{} SECURITY_EVALUATION_FAILED error=scorer_panicked", ctx);
                RiskAssessment::system_error(device_fingerprint(headers, &draft.voter_ip))
            }
        }
    }

    fn reject(&self, draft: &VoteDraft, error: VoteError, now: DateTime<Utc>, ctx: &LogContext) -> VoteError {
        log::warn!("{} CAST_REJECTED kind={} error={}", ctx, error.kind(), error);
        self.ledger.record_rejection(draft, &error, now);
        error
    }

    /// Apply a payment callback.
    pub fn update_vote_payment(
        &self,
        vote_id: VoteId,
        status: PaymentStatus,
        reference: Option<&str>,
        actor: Actor,
    ) -> Result<VoteRecord> {
        let now = self.clock.now();
        let ctx = RequestContext::new(None, now).log_context();
        self.ledger
            .update_payment(vote_id, status, reference, actor, now, &ctx)
    }

    /// Recompute-on-read event analytics. Unchanged ledger state yields
    /// the identical rollup regardless of when it is read.
    pub fn get_event_analytics(&self, event_id: EventId) -> Result<EventRollup> {
        let ctx = RequestContext::new(None, self.clock.now())
            .log_context()
            .with_event(&event_id.to_string());
        self.aggregator.recompute(&self.ledger, event_id, &ctx)
    }

    pub fn get_leaderboard(&self, event_id: EventId, limit: usize, sort: SortKey) -> Result<Vec<LeaderboardEntry>> {
        let rollup = self.get_event_analytics(event_id)?;
        Ok(leaderboard(&rollup, sort, limit))
    }

    pub fn get_live_counter(&self, event_id: EventId) -> Result<LiveCounter> {
        let now = self.clock.now();
        let ctx = RequestContext::new(None, now)
            .log_context()
            .with_event(&event_id.to_string());
        let snapshot = self.ledger.event_snapshot(event_id)?;
        let rollup = self.aggregator.refresh(&snapshot, &ctx);
        Ok(live_counter(&snapshot, &rollup, now))
    }

    pub fn get_vote(&self, vote_id: VoteId) -> Result<VoteRecord> {
        self.ledger
            .get(vote_id)
            .ok_or_else(|| VoteError::not_found("vote", vote_id))
    }

    /// Recheck a stored vote's hash and signature.
    pub fn verify_vote(&self, vote_id: VoteId) -> Result<VoteRecord> {
        let now = self.clock.now();
        let ctx = RequestContext::new(None, now).log_context();
        self.ledger.verify_integrity(vote_id, now, &ctx)
    }

    pub fn audit_trail(&self, vote_id: VoteId) -> Vec<AuditLogEntry> {
        self.ledger.audit_for(vote_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SigningSecret;
    use crate::security::counters::{CounterTotals, ReservationId};
    use crate::security::flags::FlagKind;
    use crate::storage::models::{AuditAction, Category, CategoryId, DeviceClass, Event};
    use chrono::TimeZone;

    struct Harness {
        engine: VoteEngine,
        clock: Arc<ManualClock>,
        counters: Arc<InMemoryCounters>,
        event_id: EventId,
        contestants: Vec<ContestantId>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 19, 0, 0).unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig::new(SigningSecret::new("test-signing-secret"))
    }

    fn seed(engine: &VoteEngine, published: bool) -> (EventId, Vec<ContestantId>) {
        let event = Event {
            id: EventId::new(),
            owner: "org".to_string(),
            name: "Miss Campus".to_string(),
            price_per_vote: Money::parse("2.50").unwrap(),
            published,
            starts_at: Some(t0() - Duration::days(1)),
            ends_at: Some(t0() + Duration::days(7)),
        };
        let event_id = event.id;
        engine.ledger().register_event(event).unwrap();
        let category = Category {
            id: CategoryId::new(),
            event_id,
            name: "Main".to_string(),
        };
        engine.ledger().register_category(category.clone()).unwrap();
        let contestants = ["Ada", "Bea", "Cy"]
            .iter()
            .map(|n| engine.ledger().register_contestant(category.id, n, t0()).unwrap().id)
            .collect();
        (event_id, contestants)
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let counters = Arc::new(InMemoryCounters::new(Duration::minutes(15)));
        let engine = VoteEngine::new(
            config(),
            clock.clone(),
            Arc::new(StaticReputationProvider::new()),
            counters.clone(),
        )
        .unwrap();
        let (event_id, contestants) = seed(&engine, true);
        Harness {
            engine,
            clock,
            counters,
            event_id,
            contestants,
        }
    }

    fn browser() -> RequestHeaders {
        RequestHeaders::new()
            .with("User-Agent", "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0")
            .with("Accept", "text/html,application/json")
            .with("Accept-Language", "en-GB")
            .with("Referer", "https://pageantry.example.org/vote")
    }

    fn request(h: &Harness, contestant: usize, units: u32, email: Option<&str>, ip: &str) -> CastVoteRequest {
        CastVoteRequest {
            event_id: h.event_id,
            contestant_id: h.contestants[contestant],
            units,
            voter_email: email.map(str::to_string),
            remote_addr: ip.to_string(),
            headers: browser(),
            payment_reference: None,
            request_id: None,
        }
    }

    #[test]
    fn test_clean_vote() {
        let h = harness();
        let receipt = h
            .engine
            .cast_vote(request(&h, 0, 10, Some("fan@example.org"), "198.51.100.1"))
            .unwrap();

        assert_eq!(receipt.total_cost.to_string(), "25.00");
        assert_eq!(receipt.risk_score, 0);
        assert!(receipt.flags.is_empty());
        assert_eq!(receipt.payment_status, PaymentStatus::Pending);
        assert!(!receipt.quarantined);
        assert_eq!(h.counters.pending_count(), 0);

        let record = h.engine.verify_vote(receipt.vote_id).unwrap();
        assert_eq!(record.fraud.signature.len(), 64);
    }

    #[test]
    fn test_bot_user_agent_quarantined() {
        let h = harness();
        let mut req = request(&h, 0, 1, Some("fan@example.org"), "198.51.100.1");
        req.headers.insert("User-Agent", "curl/7.68.0");

        let receipt = h.engine.cast_vote(req).unwrap();
        assert!(receipt.flag_tokens().contains(&"bot_user_agent".to_string()));
        assert!(receipt.risk_score >= 40);
        assert!(receipt.quarantined);

        let actions: Vec<AuditAction> = h
            .engine
            .audit_trail(receipt.vote_id)
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec![AuditAction::VoteCreated, AuditAction::FraudDetected]);
    }

    #[test]
    fn test_hundred_and_first_vote_hits_ip_hour_limit() {
        let h = harness();
        for i in 0..100 {
            let email = format!("voter{}@example.org", i);
            h.engine
                .cast_vote(request(&h, i % 3, 1, Some(&email), "203.0.113.50"))
                .unwrap();
            h.clock.advance(Duration::seconds(20));
        }

        let receipt = h
            .engine
            .cast_vote(request(&h, 0, 1, Some("late@example.org"), "203.0.113.50"))
            .unwrap();
        assert!(receipt.flag_tokens().contains(&"rate_limit_ip_hour:100".to_string()));
        assert!(receipt.risk_score >= 20);
        assert!(receipt.quarantined);
    }

    #[test]
    fn test_volume_spike_after_small_vote() {
        let h = harness();
        let first = h
            .engine
            .cast_vote(request(&h, 1, 5, Some("fan@example.org"), "198.51.100.9"))
            .unwrap();
        assert_eq!(first.risk_score, 0);

        h.clock.advance(Duration::minutes(1));
        let second = h
            .engine
            .cast_vote(request(&h, 1, 50, Some("fan@example.org"), "198.51.100.9"))
            .unwrap();

        let tokens = second.flag_tokens();
        assert!(tokens.contains(&"abnormal_voting_volume:50".to_string()));
        assert!(tokens.contains(&"rapid_sequential_voting:60s".to_string()));
        assert!(second.risk_score >= 45);
        assert!(second.quarantined);

        let record = h.engine.get_vote(second.vote_id).unwrap();
        assert!(record.fraud.raw_risk_score > 100);
        assert!(!record.fraud.checks.behavioral);
        assert!(!record.fraud.checks.velocity);
    }

    #[test]
    fn test_forwarded_for_used_as_voter_ip() {
        let h = harness();
        let mut req = request(&h, 0, 1, None, "10.0.0.1");
        req.headers.insert("X-Forwarded-For", "203.0.113.77, 10.0.0.1");
        let receipt = h.engine.cast_vote(req).unwrap();
        let record = h.engine.get_vote(receipt.vote_id).unwrap();
        assert_eq!(record.vote.voter_ip, "203.0.113.77");
        assert_eq!(record.vote.voter_identity, voter_identity(None, "203.0.113.77"));
    }

    #[test]
    fn test_rejections_are_audited() {
        let h = harness();

        let err = h
            .engine
            .cast_vote(request(&h, 0, 0, None, "198.51.100.1"))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = h
            .engine
            .cast_vote(request(&h, 0, 1, Some("not-an-email"), "198.51.100.1"))
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let mut req = request(&h, 0, 1, None, "198.51.100.1");
        req.event_id = EventId::new();
        assert_eq!(h.engine.cast_vote(req).unwrap_err().kind(), "not_found");

        let rejected = h
            .engine
            .ledger()
            .audit_log()
            .into_iter()
            .filter(|e| e.action == AuditAction::VoteRejected)
            .count();
        assert_eq!(rejected, 3);
        assert_eq!(h.counters.pending_count(), 0);
        assert_eq!(h.engine.ledger().revision(), 0);
    }

    #[test]
    fn test_unpublished_event_not_found() {
        let h = harness();
        let (event_id, contestants) = seed(&h.engine, false);
        let mut req = request(&h, 0, 1, None, "198.51.100.1");
        req.event_id = event_id;
        req.contestant_id = contestants[0];
        let err = h.engine.cast_vote(req).unwrap_err();
        assert_eq!(err, VoteError::not_found("event", event_id));
    }

    struct BrokenCounters;

    impl CounterStore for BrokenCounters {
        fn totals(&self, _keys: &CounterKeys, _now: DateTime<Utc>) -> Result<CounterTotals> {
            Err(VoteError::SecurityEvaluation("counter backend offline".to_string()))
        }

        fn reserve(&self, _keys: &CounterKeys, _units: u64, _now: DateTime<Utc>) -> Result<ReservationId> {
            Err(VoteError::SecurityEvaluation("counter backend offline".to_string()))
        }

        fn commit(&self, _id: ReservationId) -> Result<()> {
            Ok(())
        }

        fn release(&self, _id: ReservationId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_scorer_failure_fails_closed() {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = VoteEngine::new(
            config(),
            clock,
            Arc::new(StaticReputationProvider::new()),
            Arc::new(BrokenCounters),
        )
        .unwrap();
        let (event_id, contestants) = seed(&engine, true);

        let receipt = engine
            .cast_vote(CastVoteRequest {
                event_id,
                contestant_id: contestants[0],
                units: 3,
                voter_email: Some("fan@example.org".to_string()),
                remote_addr: "198.51.100.1".to_string(),
                headers: browser(),
                payment_reference: None,
                request_id: Some("req-broken".to_string()),
            })
            .unwrap();

        assert_eq!(receipt.risk_score, 100);
        assert_eq!(receipt.flag_tokens(), vec!["system_error".to_string()]);
        assert!(receipt.quarantined);

        let actions: Vec<AuditAction> = engine
            .audit_trail(receipt.vote_id)
            .iter()
            .map(|e| e.action)
            .collect();
        assert!(actions.contains(&AuditAction::SecurityEvaluationFailed));
        assert!(actions.contains(&AuditAction::FraudDetected));
    }

    #[test]
    fn test_payment_flow_and_analytics() {
        let h = harness();
        let a = h
            .engine
            .cast_vote(request(&h, 0, 4, Some("a@example.org"), "198.51.100.1"))
            .unwrap();
        let b = h
            .engine
            .cast_vote(request(&h, 1, 6, Some("b@example.org"), "198.51.100.2"))
            .unwrap();

        let rollup = h.engine.get_event_analytics(h.event_id).unwrap();
        assert_eq!(rollup.analytics.total_votes, 0);
        assert_eq!(rollup.analytics.pending_payments, 2);

        h.engine
            .update_vote_payment(a.vote_id, PaymentStatus::Completed, Some("ref-a"), Actor::Processor("gateway".into()))
            .unwrap();
        h.engine
            .update_vote_payment(b.vote_id, PaymentStatus::Completed, Some("ref-b"), Actor::Processor("gateway".into()))
            .unwrap();

        let err = h
            .engine
            .update_vote_payment(a.vote_id, PaymentStatus::Pending, None, Actor::System)
            .unwrap_err();
        assert!(matches!(err, VoteError::InvalidTransition { .. }));

        let rollup = h.engine.get_event_analytics(h.event_id).unwrap();
        assert_eq!(rollup.analytics.total_votes, 10);
        assert_eq!(rollup.analytics.total_vote_amount.to_string(), "25.00");
        assert_eq!(rollup.revenue.completed.to_string(), "25.00");

        let board = h.engine.get_leaderboard(h.event_id, 2, SortKey::Votes).unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board[0].contestant_id, h.contestants[1]);
        assert_eq!(board[0].rank, 1);

        let live = h.engine.get_live_counter(h.event_id).unwrap();
        assert_eq!(live.votes_last_minute, 10);
        assert_eq!(live.leader.map(|l| l.contestant_id), Some(h.contestants[1]));

        // Nothing changed, so recompute is stable.
        let first = serde_json::to_vec(&h.engine.get_event_analytics(h.event_id).unwrap()).unwrap();
        let second = serde_json::to_vec(&h.engine.get_event_analytics(h.event_id).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_analytics_identical_as_clock_advances() {
        let h = harness();
        let receipt = h
            .engine
            .cast_vote(request(&h, 0, 3, Some("a@example.org"), "198.51.100.1"))
            .unwrap();
        h.engine
            .update_vote_payment(receipt.vote_id, PaymentStatus::Completed, Some("ref-a"), Actor::System)
            .unwrap();

        let first = serde_json::to_vec(&h.engine.get_event_analytics(h.event_id).unwrap()).unwrap();
        h.clock.advance(Duration::minutes(30));
        let second = serde_json::to_vec(&h.engine.get_event_analytics(h.event_id).unwrap()).unwrap();
        h.clock.advance(Duration::days(3));
        let third = h.engine.get_event_analytics(h.event_id).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, serde_json::to_vec(&third).unwrap());
        assert_eq!(third.as_of, Some(t0()));
        assert_eq!(third.contestants[0].votes_in_last_hour, 3);

        // Live counter reads the clock but leaves the stored rollup alone.
        let live = h.engine.get_live_counter(h.event_id).unwrap();
        assert_eq!(live.votes_last_24_hours, 0);
        let fourth = serde_json::to_vec(&h.engine.get_event_analytics(h.event_id).unwrap()).unwrap();
        assert_eq!(first, fourth);
    }

    #[test]
    fn test_device_class_recorded_and_broken_down() {
        let h = harness();
        let desktop = h
            .engine
            .cast_vote(request(&h, 0, 2, Some("a@example.org"), "198.51.100.1"))
            .unwrap();
        let mut req = request(&h, 1, 6, Some("b@example.org"), "198.51.100.2");
        req.headers.insert(
            "User-Agent",
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148 Safari/604.1",
        );
        let phone = h.engine.cast_vote(req).unwrap();
        assert_eq!(
            h.engine.get_vote(phone.vote_id).unwrap().vote.device_class,
            DeviceClass::Mobile
        );

        for id in [desktop.vote_id, phone.vote_id] {
            h.engine
                .update_vote_payment(id, PaymentStatus::Completed, None, Actor::System)
                .unwrap();
        }
        let rollup = h.engine.get_event_analytics(h.event_id).unwrap();
        let devices: Vec<(DeviceClass, u64)> = rollup.devices.iter().map(|d| (d.device_class, d.votes)).collect();
        assert_eq!(devices, vec![(DeviceClass::Mobile, 6), (DeviceClass::Desktop, 2)]);
        assert_eq!(rollup.devices[0].percentage.to_string(), "75.00");
    }

    #[test]
    fn test_verify_vote_reports_tampering() {
        let h = harness();
        let receipt = h
            .engine
            .cast_vote(request(&h, 0, 2, Some("fan@example.org"), "198.51.100.1"))
            .unwrap();
        h.engine
            .ledger()
            .tamper_vote(receipt.vote_id, |v| v.voter_email = Some("other@example.org".to_string()));

        let err = h.engine.verify_vote(receipt.vote_id).unwrap_err();
        assert!(matches!(err, VoteError::IntegrityViolation { .. }));
        assert_eq!(h.engine.verify_vote(VoteId::new()).unwrap_err().kind(), "not_found");
    }

    #[test]
    fn test_concurrent_casts_leave_no_pending_reservations() {
        let h = harness();
        std::thread::scope(|s| {
            for t in 0..4 {
                let h = &h;
                s.spawn(move || {
                    for i in 0..10 {
                        let email = format!("t{}v{}@example.org", t, i);
                        let ip = format!("192.0.2.{}", t + 1);
                        h.engine
                            .cast_vote(request(h, i % 3, 1, Some(&email), &ip))
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(h.counters.pending_count(), 0);
        let rollup = h.engine.get_event_analytics(h.event_id).unwrap();
        assert_eq!(rollup.analytics.pending_payments, 40);
        assert_eq!(h.engine.ledger().revision(), 40);
    }

    #[test]
    fn test_disabled_header_checks() {
        let h = harness();
        let engine = h.engine.with_checks(CheckSet {
            headers: false,
            ..CheckSet::default()
        });
        let receipt = engine
            .cast_vote(CastVoteRequest {
                event_id: h.event_id,
                contestant_id: h.contestants[0],
                units: 1,
                voter_email: None,
                remote_addr: "198.51.100.1".to_string(),
                headers: RequestHeaders::new(),
                payment_reference: None,
                request_id: None,
            })
            .unwrap();
        assert_eq!(receipt.risk_score, 0);
        assert!(!receipt.flags.iter().any(|f| f.kind == FlagKind::MissingUserAgent));
    }
}
