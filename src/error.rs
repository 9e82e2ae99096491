//! Error taxonomy for the vote engine.
//!
//! Validation and not-found errors are returned to the caller synchronously.
//! Security evaluation failures never reach the caller: they are absorbed
//! into a quarantined ledger record. Integrity violations are tamper evidence
//! and are always surfaced.

use thiserror::Error;

/// Errors produced by the vote engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoteError {
    /// Bad input shape or range. User-correctable.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced entity is absent or not in an accepting state.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Payment state machine violation.
    #[error("invalid payment transition for vote {vote_id}: {from} -> {to}")]
    InvalidTransition {
        vote_id: String,
        from: String,
        to: String,
    },

    /// The fraud scorer itself failed.
    #[error("security evaluation failed: {0}")]
    SecurityEvaluation(String),

    /// Stored hash or signature does not match the record.
    #[error("integrity violation on vote {vote_id}: {reason}")]
    IntegrityViolation { vote_id: String, reason: String },
}

impl VoteError {
    pub fn validation(msg: impl Into<String>) -> Self {
        VoteError::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        VoteError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Short machine-readable tag, used in logs and audit metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            VoteError::Validation(_) => "validation",
            VoteError::NotFound { .. } => "not_found",
            VoteError::InvalidTransition { .. } => "invalid_transition",
            VoteError::SecurityEvaluation(_) => "security_evaluation",
            VoteError::IntegrityViolation { .. } => "integrity_violation",
        }
    }
}

pub type Result<T> = std::result::Result<T, VoteError>;
