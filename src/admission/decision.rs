//! Admission decision logic.
//!
//! Determines whether a scored vote is trusted immediately or held for
//! review. Every vote is written to the ledger either way.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FraudPolicy;
use crate::logging::structured::LogContext;
use crate::security::scorer::RiskAssessment;

/// Why a vote was held for review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum QuarantineReason {
    RiskThreshold { raw_score: u32, threshold: u32 },
    SystemError,
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineReason::RiskThreshold { raw_score, threshold } => {
                write!(f, "risk score {} at or above threshold {}", raw_score, threshold)
            }
            QuarantineReason::SystemError => write!(f, "security evaluation failed"),
        }
    }
}

/// Admission decision for a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionDecision {
    Admit,
    Quarantine(QuarantineReason),
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &str {
        match self {
            AdmissionDecision::Admit => "admit",
            AdmissionDecision::Quarantine(_) => "quarantine",
        }
    }

    pub fn is_quarantined(&self) -> bool {
        matches!(self, AdmissionDecision::Quarantine(_))
    }
}

/// Decide admission for a scored request.
///
/// # Decision Tree
/// 1. Scorer failed -> Quarantine(SystemError)
/// 2. raw score >= quarantine threshold -> Quarantine(RiskThreshold)
/// 3. Otherwise -> Admit
///
/// The unclamped score is compared, so accumulation past 100 never changes
/// the outcome.
pub fn decide_admission(
    assessment: &RiskAssessment,
    policy: &FraudPolicy,
    ctx: &LogContext,
) -> AdmissionDecision {
    if assessment.system_error {
        log::warn!("{} ADMISSION_DECISION decision=quarantine reason=system_error", ctx);
        return AdmissionDecision::Quarantine(QuarantineReason::SystemError);
    }

    if assessment.raw_score >= policy.quarantine_threshold {
        log::info!(
            "{} ADMISSION_DECISION decision=quarantine raw_score={} threshold={}",
            ctx,
            assessment.raw_score,
            policy.quarantine_threshold
        );
        return AdmissionDecision::Quarantine(QuarantineReason::RiskThreshold {
            raw_score: assessment.raw_score,
            threshold: policy.quarantine_threshold,
        });
    }

    log::debug!("{} ADMISSION_DECISION decision=admit raw_score={}", ctx, assessment.raw_score);
    AdmissionDecision::Admit
}

/// Any positive risk or flag marks a vote suspicious, even when admitted.
pub fn is_suspicious(assessment: &RiskAssessment) -> bool {
    assessment.raw_score > 0 || !assessment.flags.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::flags::{FlagKind, FraudFlag};
    use crate::storage::models::CheckOutcomes;

    fn assessment(raw_score: u32) -> RiskAssessment {
        RiskAssessment {
            raw_score,
            flags: Vec::new(),
            device_fingerprint: "fp".to_string(),
            checks: CheckOutcomes::default(),
            system_error: false,
        }
    }

    #[test]
    fn test_clean_vote_admitted() {
        let ctx = LogContext::new("test");
        let decision = decide_admission(&assessment(0), &FraudPolicy::default(), &ctx);
        assert_eq!(decision, AdmissionDecision::Admit);
        assert_eq!(decision.as_str(), "admit");
        assert!(!is_suspicious(&assessment(0)));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let ctx = LogContext::new("test");
        let policy = FraudPolicy::default();
        assert!(!decide_admission(&assessment(4), &policy, &ctx).is_quarantined());
        assert_eq!(
            decide_admission(&assessment(5), &policy, &ctx),
            AdmissionDecision::Quarantine(QuarantineReason::RiskThreshold {
                raw_score: 5,
                threshold: 5
            })
        );
    }

    #[test]
    fn test_unclamped_score_still_quarantines() {
        let ctx = LogContext::new("test");
        let decision = decide_admission(&assessment(245), &FraudPolicy::default(), &ctx);
        assert!(decision.is_quarantined());
    }

    #[test]
    fn test_system_error_quarantines() {
        let ctx = LogContext::new("test");
        let failed = RiskAssessment::system_error("fp".to_string());
        let decision = decide_admission(&failed, &FraudPolicy::default(), &ctx);
        assert_eq!(decision, AdmissionDecision::Quarantine(QuarantineReason::SystemError));
        assert!(is_suspicious(&failed));
    }

    #[test]
    fn test_flag_without_score_is_suspicious() {
        let mut a = assessment(0);
        a.flags.push(FraudFlag::bare(FlagKind::BotUserAgent));
        assert!(is_suspicious(&a));
    }
}
