//! Fraud flag tokens.
//!
//! A flag is a machine-readable reason code plus an optional numeric
//! context. The canonical text form is `kind` or `kind:context`, e.g.
//! `rate_limit_ip_hour:42` or `rapid_sequential_voting:60s`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VoteError;

/// Reason codes emitted by the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    RateLimitIpHour,
    RateLimitIpDay,
    RateLimitEmailHour,
    RateLimitEmailDay,
    VelocityCheck,
    MultiEventVoting,
    AbnormalVotingVolume,
    RapidSequentialVoting,
    GeographicAnomaly,
    BlacklistedIp,
    HighAbuseIp,
    DisposableEmail,
    ConcentratedVoting,
    MissingUserAgent,
    BotUserAgent,
    InvalidRequestHeaders,
    SystemError,
}

const ALL_KINDS: &[FlagKind] = &[
    FlagKind::RateLimitIpHour,
    FlagKind::RateLimitIpDay,
    FlagKind::RateLimitEmailHour,
    FlagKind::RateLimitEmailDay,
    FlagKind::VelocityCheck,
    FlagKind::MultiEventVoting,
    FlagKind::AbnormalVotingVolume,
    FlagKind::RapidSequentialVoting,
    FlagKind::GeographicAnomaly,
    FlagKind::BlacklistedIp,
    FlagKind::HighAbuseIp,
    FlagKind::DisposableEmail,
    FlagKind::ConcentratedVoting,
    FlagKind::MissingUserAgent,
    FlagKind::BotUserAgent,
    FlagKind::InvalidRequestHeaders,
    FlagKind::SystemError,
];

impl FlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagKind::RateLimitIpHour => "rate_limit_ip_hour",
            FlagKind::RateLimitIpDay => "rate_limit_ip_day",
            FlagKind::RateLimitEmailHour => "rate_limit_email_hour",
            FlagKind::RateLimitEmailDay => "rate_limit_email_day",
            FlagKind::VelocityCheck => "velocity_check",
            FlagKind::MultiEventVoting => "multi_event_voting",
            FlagKind::AbnormalVotingVolume => "abnormal_voting_volume",
            FlagKind::RapidSequentialVoting => "rapid_sequential_voting",
            FlagKind::GeographicAnomaly => "geographic_anomaly",
            FlagKind::BlacklistedIp => "blacklisted_ip",
            FlagKind::HighAbuseIp => "high_abuse_ip",
            FlagKind::DisposableEmail => "disposable_email",
            FlagKind::ConcentratedVoting => "concentrated_voting",
            FlagKind::MissingUserAgent => "missing_user_agent",
            FlagKind::BotUserAgent => "bot_user_agent",
            FlagKind::InvalidRequestHeaders => "invalid_request_headers",
            FlagKind::SystemError => "system_error",
        }
    }
}

impl fmt::Display for FlagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric context carried by a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FlagContext {
    /// Observed unit count or number of events.
    Count(u64),
    /// Provider score, e.g. abuse confidence.
    Score(u32),
    /// Elapsed seconds.
    Seconds(i64),
}

impl fmt::Display for FlagContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagContext::Count(n) => write!(f, "{}", n),
            FlagContext::Score(n) => write!(f, "{}", n),
            FlagContext::Seconds(n) => write!(f, "{}s", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudFlag {
    pub kind: FlagKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<FlagContext>,
}

impl FraudFlag {
    pub fn bare(kind: FlagKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }

    pub fn count(kind: FlagKind, n: u64) -> Self {
        Self {
            kind,
            context: Some(FlagContext::Count(n)),
        }
    }

    pub fn score(kind: FlagKind, n: u32) -> Self {
        Self {
            kind,
            context: Some(FlagContext::Score(n)),
        }
    }

    pub fn seconds(kind: FlagKind, n: i64) -> Self {
        Self {
            kind,
            context: Some(FlagContext::Seconds(n)),
        }
    }

    /// Canonical text token.
    pub fn token(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FraudFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "{}:{}", self.kind, ctx),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl FromStr for FraudFlag {
    type Err = VoteError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let (kind_str, ctx_str) = match token.split_once(':') {
            Some((k, c)) => (k, Some(c)),
            None => (token, None),
        };

        let kind = ALL_KINDS
            .iter()
            .copied()
            .find(|k| k.as_str() == kind_str)
            .ok_or_else(|| VoteError::validation(format!("unknown flag kind: {}", kind_str)))?;

        let bad = |c: &str| VoteError::validation(format!("bad flag context {:?} in {}", c, token));

        let context = match ctx_str {
            None => None,
            Some(c) => Some(match kind {
                FlagKind::RapidSequentialVoting => {
                    let secs = c.strip_suffix('s').unwrap_or(c);
                    FlagContext::Seconds(secs.parse().map_err(|_| bad(c))?)
                }
                FlagKind::HighAbuseIp => FlagContext::Score(c.parse().map_err(|_| bad(c))?),
                _ => FlagContext::Count(c.parse().map_err(|_| bad(c))?),
            }),
        };

        Ok(Self { kind, context })
    }
}
