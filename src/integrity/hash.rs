//! Content integrity hashes.
//!
//! The hash covers the immutable fields of a vote, serialized as canonical
//! JSON (object keys sorted at every depth, no insignificant whitespace).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Result, VoteError};
use crate::storage::models::{ContestantId, EventId, Vote, VoteId};

/// Immutable vote fields covered by the content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteContent {
    pub vote_id: VoteId,
    pub contestant_id: ContestantId,
    pub event_id: EventId,
    pub units: u32,
    pub voter_email: Option<String>,
}

impl From<&Vote> for VoteContent {
    fn from(vote: &Vote) -> Self {
        Self {
            vote_id: vote.id,
            contestant_id: vote.contestant_id,
            event_id: vote.event_id,
            units: vote.units,
            voter_email: vote.voter_email.clone(),
        }
    }
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_keys(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Canonical JSON text for any serializable value.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| VoteError::validation(format!("unserializable content: {}", e)))?;
    serde_json::to_string(&sort_keys(value))
        .map_err(|e| VoteError::validation(format!("unserializable content: {}", e)))
}

/// SHA-256 hex over the canonical JSON of `value`.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub fn compute_hash(content: &VoteContent) -> Result<String> {
    hash_canonical(content)
}

/// Constant-time comparison against a stored hash.
pub fn verify_hash(content: &VoteContent, expected: &str) -> bool {
    match compute_hash(content) {
        Ok(actual) => actual.as_bytes().ct_eq(expected.as_bytes()).into(),
        Err(_) => false,
    }
}
