//! Structured logging utilities.
//!
//! Provides context-aware logging with request_id, event_id and vote_id
//! included in every log message.

use std::fmt;

/// Logging context for a single vote request.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub request_id: String,
    pub event_id: Option<String>,
    pub vote_id: Option<String>,
}

impl LogContext {
    pub fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            event_id: None,
            vote_id: None,
        }
    }

    pub fn with_event(&self, event_id: &str) -> Self {
        Self {
            event_id: Some(event_id.to_string()),
            ..self.clone()
        }
    }

    pub fn with_vote(&self, vote_id: &str) -> Self {
        Self {
            vote_id: Some(vote_id.to_string()),
            ..self.clone()
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[req={}]", self.request_id)?;
        if let Some(eid) = &self.event_id {
            write!(f, " [event={}]", eid)?;
        }
        if let Some(vid) = &self.vote_id {
            write!(f, " [vote={}]", vid)?;
        }
        Ok(())
    }
}
