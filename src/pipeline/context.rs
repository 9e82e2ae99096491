//! Pipeline context management.
//!
//! Per-request identity and timing for logging and audit.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::logging::structured::LogContext;
use crate::security::headers::{resolve_client_ip, RequestHeaders};

/// Context for a single cast or payment update.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub received_at: DateTime<Utc>,
    /// Resolved client address (forwarded-for first hop, else socket).
    pub client_ip: Option<String>,
}

impl RequestContext {
    /// Uses the caller's request id when given, else generates one.
    pub fn new(request_id: Option<&str>, received_at: DateTime<Utc>) -> Self {
        let request_id = request_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("req-{}", &Uuid::new_v4().simple().to_string()[..8]));

        Self {
            request_id,
            received_at,
            client_ip: None,
        }
    }

    pub fn with_client(mut self, headers: &RequestHeaders, remote_addr: &str) -> Self {
        let ip = resolve_client_ip(headers, remote_addr);
        self.client_ip = Some(ip).filter(|ip| !ip.is_empty());
        self
    }

    pub fn log_context(&self) -> LogContext {
        LogContext::new(&self.request_id)
    }
}
