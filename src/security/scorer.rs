//! Composite fraud scoring.
//!
//! Runs independent checks over one vote request, each adding a
//! non-negative risk delta and zero or more flags:
//! 1. Rate limits (IP / email, hour / day)
//! 2. Velocity window (voter identity)
//! 3. Device fingerprint reuse across events
//! 4. Behavioral anomalies (volume, rapid sequence)
//! 5. Geographic anomalies (pluggable, neutral by default)
//! 6. IP reputation
//! 7. Email reputation
//! 8. Concentrated voting on one contestant
//! 9. Request header heuristics
//!
//! The score accumulates without a ceiling. Clamping happens only when
//! reporting. The scorer reads shared state but never writes counters or
//! fingerprints; those are committed after the ledger write.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FraudPolicy;
use crate::error::Result;
use crate::logging::structured::LogContext;
use crate::security::counters::{CounterKeys, CounterStore};
use crate::security::fingerprint::{device_fingerprint, FingerprintRegistry};
use crate::security::flags::{FlagKind, FraudFlag};
use crate::security::headers::{inspect_headers, RequestHeaders};
use crate::security::reputation::ReputationCache;
use crate::storage::models::{CheckOutcomes, ContestantId, EventId};

/// Reported risk never exceeds this.
pub const MAX_REPORTED_RISK: u32 = 100;

/// One prior transaction of a voter identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub units: u32,
    pub created_at: DateTime<Utc>,
}

/// Read access to the ledger's per-identity history.
pub trait VoteHistory: Send + Sync {
    /// Most recent first, at most `limit` entries, across all events.
    fn recent_votes(&self, identity: &str, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// Units the identity has already cast for `contestant` in `event`.
    fn contestant_units(&self, identity: &str, event_id: EventId, contestant_id: ContestantId) -> Result<u64>;
}

/// Geographic anomaly capability (impossible travel and similar).
pub trait GeographicCheck: Send + Sync {
    fn is_anomalous(&self, identity: &str, ip: &str, now: DateTime<Utc>) -> bool;
}

/// No geolocation available; never anomalous.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeographicCheck;

impl GeographicCheck for NoGeographicCheck {
    fn is_anomalous(&self, _identity: &str, _ip: &str, _now: DateTime<Utc>) -> bool {
        false
    }
}

/// Which checks run. All enabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSet {
    pub rate_limits: bool,
    pub velocity: bool,
    pub device_fingerprint: bool,
    pub behavioral: bool,
    pub geographic: bool,
    pub ip_reputation: bool,
    pub email_reputation: bool,
    pub concentrated_voting: bool,
    pub headers: bool,
}

impl Default for CheckSet {
    fn default() -> Self {
        Self {
            rate_limits: true,
            velocity: true,
            device_fingerprint: true,
            behavioral: true,
            geographic: true,
            ip_reputation: true,
            email_reputation: true,
            concentrated_voting: true,
            headers: true,
        }
    }
}

/// Everything the scorer looks at for one request.
#[derive(Debug, Clone)]
pub struct ScoreRequest<'a> {
    pub event_id: EventId,
    pub contestant_id: ContestantId,
    pub voter_ip: &'a str,
    pub voter_email: Option<&'a str>,
    pub voter_identity: &'a str,
    pub units: u32,
    pub headers: &'a RequestHeaders,
    pub now: DateTime<Utc>,
}

impl ScoreRequest<'_> {
    pub fn counter_keys(&self) -> CounterKeys {
        CounterKeys {
            event_id: self.event_id,
            ip: self.voter_ip.to_string(),
            email: self.voter_email.map(|e| e.to_string()),
            identity: self.voter_identity.to_string(),
        }
    }
}

/// Scorer output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub raw_score: u32,
    pub flags: Vec<FraudFlag>,
    pub device_fingerprint: String,
    pub checks: CheckOutcomes,
    pub system_error: bool,
}

impl RiskAssessment {
    /// Fail-closed verdict for a scorer that could not finish.
    pub fn system_error(device_fingerprint: String) -> Self {
        Self {
            raw_score: MAX_REPORTED_RISK,
            flags: vec![FraudFlag::bare(FlagKind::SystemError)],
            device_fingerprint,
            checks: CheckOutcomes::default(),
            system_error: true,
        }
    }

    pub fn reported_score(&self) -> u32 {
        self.raw_score.min(MAX_REPORTED_RISK)
    }

    pub fn has_flag(&self, kind: FlagKind) -> bool {
        self.flags.iter().any(|f| f.kind == kind)
    }

    pub fn flag_tokens(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.token()).collect()
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    score: u32,
    flags: Vec<FraudFlag>,
}

impl Accumulator {
    fn add(&mut self, delta: u32, flag: Option<FraudFlag>) {
        self.score = self.score.saturating_add(delta);
        if let Some(flag) = flag {
            self.flags.push(flag);
        }
    }
}

pub struct FraudScorer {
    policy: FraudPolicy,
    checks: CheckSet,
    counters: Arc<dyn CounterStore>,
    reputation: Arc<ReputationCache>,
    fingerprints: Arc<FingerprintRegistry>,
    history: Arc<dyn VoteHistory>,
    geo: Arc<dyn GeographicCheck>,
}

impl FraudScorer {
    pub fn new(
        policy: FraudPolicy,
        counters: Arc<dyn CounterStore>,
        reputation: Arc<ReputationCache>,
        fingerprints: Arc<FingerprintRegistry>,
        history: Arc<dyn VoteHistory>,
    ) -> Self {
        Self {
            policy,
            checks: CheckSet::default(),
            counters,
            reputation,
            fingerprints,
            history,
            geo: Arc::new(NoGeographicCheck),
        }
    }

    pub fn with_checks(mut self, checks: CheckSet) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_geographic_check(mut self, geo: Arc<dyn GeographicCheck>) -> Self {
        self.geo = geo;
        self
    }

    pub fn policy(&self) -> &FraudPolicy {
        &self.policy
    }

    pub fn score(&self, req: &ScoreRequest<'_>, ctx: &LogContext) -> Result<RiskAssessment> {
        log::debug!("{} RISK_SCORE_START units={}", ctx, req.units);

        let mut acc = Accumulator::default();
        let mut outcomes = CheckOutcomes::default();
        let fingerprint = device_fingerprint(req.headers, req.voter_ip);

        if self.checks.rate_limits || self.checks.velocity {
            self.check_counters(req, &mut acc, &mut outcomes, ctx)?;
        }
        if self.checks.device_fingerprint {
            self.check_device_fingerprint(req, &fingerprint, &mut acc, ctx);
        }
        if self.checks.behavioral {
            self.check_behavioral(req, &mut acc, &mut outcomes, ctx)?;
        }
        if self.checks.geographic && self.geo.is_anomalous(req.voter_identity, req.voter_ip, req.now) {
            log::info!("{} GEOGRAPHIC_ANOMALY ip={}", ctx, req.voter_ip);
            outcomes.geographic = false;
            acc.add(
                self.policy.geographic_anomaly_delta,
                Some(FraudFlag::bare(FlagKind::GeographicAnomaly)),
            );
        }
        if self.checks.ip_reputation {
            self.check_ip_reputation(req, &mut acc, &mut outcomes, ctx);
        }
        if self.checks.email_reputation {
            self.check_email_reputation(req, &mut acc, &mut outcomes, ctx);
        }
        if self.checks.concentrated_voting {
            self.check_concentration(req, &mut acc, ctx)?;
        }
        if self.checks.headers {
            self.check_headers(req, &mut acc, ctx);
        }

        let assessment = RiskAssessment {
            raw_score: acc.score,
            flags: acc.flags,
            device_fingerprint: fingerprint,
            checks: outcomes,
            system_error: false,
        };

        log::info!(
            "{} RISK_ASSESSED raw_score={} reported={} flags={:?}",
            ctx,
            assessment.raw_score,
            assessment.reported_score(),
            assessment.flag_tokens()
        );

        Ok(assessment)
    }

    fn check_counters(
        &self,
        req: &ScoreRequest<'_>,
        acc: &mut Accumulator,
        outcomes: &mut CheckOutcomes,
        ctx: &LogContext,
    ) -> Result<()> {
        let p = &self.policy;
        let units = u64::from(req.units);
        let totals = self.counters.totals(&req.counter_keys(), req.now)?;

        log::debug!(
            "{} COUNTER_TOTALS ip_hour={} ip_day={} email_hour={:?} email_day={:?} window={}",
            ctx,
            totals.ip_hour,
            totals.ip_day,
            totals.email_hour,
            totals.email_day,
            totals.identity_window
        );

        if self.checks.rate_limits {
            let limits = [
                (Some(totals.ip_hour), p.max_units_per_hour_per_ip, p.ip_hour_delta, FlagKind::RateLimitIpHour),
                (Some(totals.ip_day), p.max_units_per_day_per_ip, p.ip_day_delta, FlagKind::RateLimitIpDay),
                (totals.email_hour, p.max_units_per_hour_per_email, p.email_hour_delta, FlagKind::RateLimitEmailHour),
                (totals.email_day, p.max_units_per_day_per_email, p.email_day_delta, FlagKind::RateLimitEmailDay),
            ];
            for (observed, limit, delta, kind) in limits {
                if let Some(observed) = observed {
                    if observed + units > limit {
                        log::info!("{} RATE_LIMIT_EXCEEDED kind={} observed={} limit={}", ctx, kind, observed, limit);
                        acc.add(delta, Some(FraudFlag::count(kind, observed)));
                    }
                }
            }
        }

        if self.checks.velocity && totals.identity_window + units > p.max_units_per_velocity_window {
            log::info!(
                "{} VELOCITY_EXCEEDED observed={} window_minutes={}",
                ctx,
                totals.identity_window,
                p.velocity_window_minutes
            );
            outcomes.velocity = false;
            acc.add(
                p.velocity_delta,
                Some(FraudFlag::count(FlagKind::VelocityCheck, totals.identity_window)),
            );
        }

        Ok(())
    }

    fn check_device_fingerprint(
        &self,
        req: &ScoreRequest<'_>,
        fingerprint: &str,
        acc: &mut Accumulator,
        ctx: &LogContext,
    ) {
        let events = self.fingerprints.distinct_events(fingerprint, req.now);
        if events > self.policy.max_events_per_fingerprint {
            log::info!("{} MULTI_EVENT_DEVICE events={}", ctx, events);
            acc.add(
                self.policy.multi_event_delta,
                Some(FraudFlag::count(FlagKind::MultiEventVoting, events as u64)),
            );
        }
    }

    fn check_behavioral(
        &self,
        req: &ScoreRequest<'_>,
        acc: &mut Accumulator,
        outcomes: &mut CheckOutcomes,
        ctx: &LogContext,
    ) -> Result<()> {
        let p = &self.policy;
        let history = self
            .history
            .recent_votes(req.voter_identity, p.behavioral_history_len)?;

        let Some(latest) = history.first() else {
            return Ok(());
        };

        // units > multiplier * mean, in integers: units * n > multiplier * sum
        let sum: u64 = history.iter().map(|h| u64::from(h.units)).sum();
        let n = history.len() as u64;
        if u64::from(req.units) * n > p.abnormal_volume_multiplier * sum {
            log::info!(
                "{} ABNORMAL_VOLUME units={} history_sum={} history_len={}",
                ctx,
                req.units,
                sum,
                n
            );
            outcomes.behavioral = false;
            acc.add(
                p.abnormal_volume_delta,
                Some(FraudFlag::count(FlagKind::AbnormalVotingVolume, u64::from(req.units))),
            );
        }

        let elapsed = req.now - latest.created_at;
        if elapsed < Duration::seconds(p.rapid_sequential_secs) {
            let secs = elapsed.num_seconds().max(0);
            log::info!("{} RAPID_SEQUENTIAL elapsed_secs={}", ctx, secs);
            outcomes.behavioral = false;
            acc.add(
                p.rapid_sequential_delta,
                Some(FraudFlag::seconds(FlagKind::RapidSequentialVoting, secs)),
            );
        }

        Ok(())
    }

    fn check_ip_reputation(
        &self,
        req: &ScoreRequest<'_>,
        acc: &mut Accumulator,
        outcomes: &mut CheckOutcomes,
        ctx: &LogContext,
    ) {
        let p = &self.policy;
        let rep = self.reputation.lookup_ip(req.voter_ip, req.now, ctx);

        if rep.blacklisted {
            outcomes.ip_reputation = false;
            acc.add(p.blacklisted_ip_delta, Some(FraudFlag::bare(FlagKind::BlacklistedIp)));
        }
        if rep.abuse_score > p.high_abuse_threshold {
            outcomes.ip_reputation = false;
            acc.add(
                p.high_abuse_delta,
                Some(FraudFlag::score(FlagKind::HighAbuseIp, rep.abuse_score)),
            );
        }
    }

    fn check_email_reputation(
        &self,
        req: &ScoreRequest<'_>,
        acc: &mut Accumulator,
        outcomes: &mut CheckOutcomes,
        ctx: &LogContext,
    ) {
        let Some(email) = req.voter_email else {
            return;
        };
        let p = &self.policy;
        let rep = self.reputation.lookup_email(email, req.now, ctx);

        if rep.disposable {
            outcomes.email_reputation = false;
            acc.add(p.disposable_email_delta, Some(FraudFlag::bare(FlagKind::DisposableEmail)));
        }
        if rep.free_provider {
            acc.add(p.free_email_delta, None);
        }
    }

    fn check_concentration(&self, req: &ScoreRequest<'_>, acc: &mut Accumulator, ctx: &LogContext) -> Result<()> {
        let prior = self
            .history
            .contestant_units(req.voter_identity, req.event_id, req.contestant_id)?;
        let total = prior + u64::from(req.units);

        if total > self.policy.concentrated_units_threshold {
            log::info!("{} CONCENTRATED_VOTING units={}", ctx, total);
            acc.add(
                self.policy.concentrated_delta,
                Some(FraudFlag::count(FlagKind::ConcentratedVoting, total)),
            );
        }
        Ok(())
    }

    fn check_headers(&self, req: &ScoreRequest<'_>, acc: &mut Accumulator, ctx: &LogContext) {
        let p = &self.policy;
        let findings = inspect_headers(req.headers, ctx);

        if findings.missing_user_agent {
            acc.add(p.missing_user_agent_delta, Some(FraudFlag::bare(FlagKind::MissingUserAgent)));
        }
        if findings.bot_user_agent {
            acc.add(p.bot_user_agent_delta, Some(FraudFlag::bare(FlagKind::BotUserAgent)));
        }
        if findings.missing_referer {
            acc.add(p.missing_referer_delta, None);
        }
        if findings.missing_required {
            acc.add(p.invalid_headers_delta, Some(FraudFlag::bare(FlagKind::InvalidRequestHeaders)));
        }
    }
}
