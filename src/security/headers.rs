//! Request header heuristics.
//!
//! Detects automation markers in the submitting request:
//! - Missing or bot-like User-Agent
//! - Missing Referer
//! - Missing required headers (Accept, User-Agent)
//!
//! Also classifies the submitting device for analytics.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::logging::structured::LogContext;
use crate::storage::models::DeviceClass;

/// Substrings that mark automated clients.
pub const BOT_INDICATORS: &[&str] = &["bot", "crawler", "spider", "scraper", "curl", "wget"];

/// Headers every browser submission carries.
pub const REQUIRED_HEADERS: &[&str] = &["accept", "user-agent"];

lazy_static! {
    static ref BOT_PATTERN: Regex = Regex::new(&format!(
        "(?i)(?:{})",
        BOT_INDICATORS.join("|")
    ))
    .unwrap();

    static ref TABLET_PATTERN: Regex = Regex::new(r"(?i)ipad|tablet|kindle|silk|playbook").unwrap();

    static ref MOBILE_PATTERN: Regex = Regex::new(
        r"(?i)mobile|iphone|ipod|android|blackberry|opera mini|iemobile"
    ).unwrap();

    static ref ANDROID_PATTERN: Regex = Regex::new(r"(?i)android").unwrap();
}

/// Case-insensitive header map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeaders(HashMap<String, String>);

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Header value, treating blank values as absent.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.get("user-agent")
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for RequestHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = RequestHeaders::new();
        for (k, v) in iter {
            headers.insert(k.as_ref(), v);
        }
        headers
    }
}

/// Client IP: first hop of X-Forwarded-For, else the socket address.
pub fn resolve_client_ip(headers: &RequestHeaders, remote_addr: &str) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| remote_addr.trim().to_string())
}

/// Check if a User-Agent contains a bot indicator (case-insensitive).
///
/// # Examples
/// ```
/// use pageantry_core::security::headers::is_bot_user_agent;
/// assert!(is_bot_user_agent("curl/7.68.0"));
/// assert!(is_bot_user_agent("Googlebot/2.1"));
/// assert!(!is_bot_user_agent("Mozilla/5.0 (X11; Linux x86_64)"));
/// ```
pub fn is_bot_user_agent(user_agent: &str) -> bool {
    BOT_PATTERN.is_match(user_agent)
}

/// Device class from a User-Agent. Android without a "Mobile" token is a
/// tablet. Missing agents are `Unknown`.
pub fn classify_device(user_agent: Option<&str>) -> DeviceClass {
    let Some(ua) = user_agent else {
        return DeviceClass::Unknown;
    };
    let android_tablet = ANDROID_PATTERN.is_match(ua) && !ua.to_ascii_lowercase().contains("mobile");
    if TABLET_PATTERN.is_match(ua) || android_tablet {
        DeviceClass::Tablet
    } else if MOBILE_PATTERN.is_match(ua) {
        DeviceClass::Mobile
    } else {
        DeviceClass::Desktop
    }
}

/// Header heuristic result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFindings {
    pub missing_user_agent: bool,
    pub bot_user_agent: bool,
    pub missing_referer: bool,
    pub missing_required: bool,
}

impl HeaderFindings {
    pub fn has_findings(&self) -> bool {
        self.missing_user_agent || self.bot_user_agent || self.missing_referer || self.missing_required
    }
}

pub fn inspect_headers(headers: &RequestHeaders, ctx: &LogContext) -> HeaderFindings {
    let user_agent = headers.user_agent();
    let findings = HeaderFindings {
        missing_user_agent: user_agent.is_none(),
        bot_user_agent: user_agent.map(is_bot_user_agent).unwrap_or(false),
        missing_referer: headers.get("referer").is_none(),
        missing_required: REQUIRED_HEADERS.iter().any(|h| headers.get(h).is_none()),
    };

    if findings.has_findings() {
        log::debug!(
            "{} HEADER_FINDINGS missing_ua={} bot_ua={} missing_referer={} missing_required={}",
            ctx,
            findings.missing_user_agent,
            findings.bot_user_agent,
            findings.missing_referer,
            findings.missing_required
        );
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_device() {
        let iphone = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Mobile/15E148 Safari/604.1";
        let ipad = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X) Safari/604.1";
        let android_phone = "Mozilla/5.0 (Linux; Android 14; Pixel 8) Chrome/126.0 Mobile Safari/537.36";
        let android_tab = "Mozilla/5.0 (Linux; Android 13; SM-X700) Chrome/126.0 Safari/537.36";
        let desktop = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/126.0";

        assert_eq!(classify_device(Some(iphone)), DeviceClass::Mobile);
        assert_eq!(classify_device(Some(android_phone)), DeviceClass::Mobile);
        assert_eq!(classify_device(Some(ipad)), DeviceClass::Tablet);
        assert_eq!(classify_device(Some(android_tab)), DeviceClass::Tablet);
        assert_eq!(classify_device(Some(desktop)), DeviceClass::Desktop);
        assert_eq!(classify_device(None), DeviceClass::Unknown);
    }

    fn browser() -> RequestHeaders {
        RequestHeaders::new()
            .with("User-Agent", "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)")
            .with("Accept", "application/json")
            .with("Referer", "https://vote.example.org/events/1")
    }

    #[test]
    fn test_is_bot_user_agent() {
        assert!(is_bot_user_agent("curl/7.68.0"));
        assert!(is_bot_user_agent("Wget/1.21"));
        assert!(is_bot_user_agent("Mozilla/5.0 (compatible; bingbot/2.0)"));
        assert!(is_bot_user_agent("my-Scraper"));
        assert!(!is_bot_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)"));
    }

    #[test]
    fn test_clean_browser_headers() {
        let ctx = LogContext::new("test");
        let findings = inspect_headers(&browser(), &ctx);
        assert!(!findings.has_findings());
    }

    #[test]
    fn test_missing_headers() {
        let ctx = LogContext::new("test");
        let findings = inspect_headers(&RequestHeaders::new(), &ctx);
        assert!(findings.missing_user_agent);
        assert!(!findings.bot_user_agent);
        assert!(findings.missing_referer);
        assert!(findings.missing_required);

        let headers = browser().with("Accept", "  ");
        let findings = inspect_headers(&headers, &ctx);
        assert!(findings.missing_required);
        assert!(!findings.missing_user_agent);
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let headers: RequestHeaders = vec![("USER-AGENT", "x")].into_iter().collect();
        assert_eq!(headers.get("user-agent"), Some("x"));
        assert_eq!(headers.user_agent(), Some("x"));
    }

    #[test]
    fn test_resolve_client_ip() {
        let headers = RequestHeaders::new().with("X-Forwarded-For", " 203.0.113.7 , 10.0.0.1");
        assert_eq!(resolve_client_ip(&headers, "10.0.0.1"), "203.0.113.7");
        assert_eq!(resolve_client_ip(&RequestHeaders::new(), "198.51.100.2"), "198.51.100.2");
    }
}
