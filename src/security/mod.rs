pub mod audit;
pub mod gate;
pub mod rate_limit;
pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use audit::{AuditFilter, EventLog, RiskLevel, SecurityMetrics};
pub use gate::{SecurityGate, SecurityReport};
pub use rate_limit::RateLimiter;
pub use validation::{
    check_policy, find_suspicious_pattern, sanitize_for_display, validate_connection_string,
    validate_query, validate_table_name, ValidationError,
};

/// Longest query text stored on an event
pub const MAX_EVENT_QUERY_CHARS: usize = 200;

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Kinds of security-relevant events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    ConnectionAttempt,
    ConnectionSuccess,
    ConnectionFailed,
    ConnectionClosed,
    HealthCheckFailed,
    QueryExecuted,
    QueryFailed,
    QueryBlocked,
    SuspiciousActivity,
    OversizedQuery,
    MultiStatement,
    RateLimitExceeded,
    PolicyViolation,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::ConnectionAttempt => "connection_attempt",
            SecurityEventKind::ConnectionSuccess => "connection_success",
            SecurityEventKind::ConnectionFailed => "connection_failed",
            SecurityEventKind::ConnectionClosed => "connection_closed",
            SecurityEventKind::HealthCheckFailed => "health_check_failed",
            SecurityEventKind::QueryExecuted => "query_executed",
            SecurityEventKind::QueryFailed => "query_failed",
            SecurityEventKind::QueryBlocked => "query_blocked",
            SecurityEventKind::SuspiciousActivity => "suspicious_activity",
            SecurityEventKind::OversizedQuery => "oversized_query",
            SecurityEventKind::MultiStatement => "multi_statement",
            SecurityEventKind::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventKind::PolicyViolation => "policy_violation",
        }
    }
}

impl std::fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of one security-relevant action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub backend_id: Option<String>,
    /// Statement text, truncated
    pub query: Option<String>,
    pub actor: Option<String>,
    pub details: Option<serde_json::Value>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, severity: Severity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            severity,
            backend_id: None,
            query: None,
            actor: None,
            details: None,
        }
    }

    pub fn backend(mut self, backend_id: impl Into<String>) -> Self {
        self.backend_id = Some(backend_id.into());
        self
    }

    /// Attach the statement, truncated, plus a fingerprint of the full text.
    pub fn query(mut self, statement: &str) -> Self {
        self.query = Some(truncate_chars(
            &sanitize_for_display(statement),
            MAX_EVENT_QUERY_CHARS,
        ));
        self.details(serde_json::json!({ "fingerprint": fingerprint(statement) }))
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Merge structured detail; object keys are combined, anything else replaces.
    pub fn details(mut self, details: serde_json::Value) -> Self {
        match (&mut self.details, details) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(extra)) => {
                existing.extend(extra);
            }
            (slot, details) => *slot = Some(details),
        }
        self
    }
}

/// First 16 hex characters of the SHA-256 of a statement.
pub fn fingerprint(statement: &str) -> String {
    let digest = Sha256::digest(statement.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

/// Truncate on a character boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_query_truncated_with_fingerprint() {
        let long = format!("SELECT '{}'", "é".repeat(400));
        let event = SecurityEvent::new(SecurityEventKind::QueryExecuted, Severity::Info)
            .backend("main")
            .query(&long);
        assert_eq!(event.query.as_ref().unwrap().chars().count(), MAX_EVENT_QUERY_CHARS);
        let fp = event.details.as_ref().unwrap()["fingerprint"].as_str().unwrap();
        assert_eq!(fp.len(), 16);
        assert_eq!(fp, fingerprint(&long));
        assert_eq!(event.backend_id.as_deref(), Some("main"));
    }

    #[test]
    fn test_details_merge() {
        let event = SecurityEvent::new(SecurityEventKind::SuspiciousActivity, Severity::Warning)
            .query("SELECT 1")
            .details(serde_json::json!({ "pattern": "union_select" }));
        let details = event.details.unwrap();
        assert!(details.get("fingerprint").is_some());
        assert_eq!(details["pattern"], "union_select");
    }

    #[test]
    fn test_unique_ids() {
        let a = SecurityEvent::new(SecurityEventKind::QueryExecuted, Severity::Info);
        let b = SecurityEvent::new(SecurityEventKind::QueryExecuted, Severity::Info);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_severity_order_and_names() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "\"warning\"");
        assert_eq!(
            serde_json::to_string(&SecurityEventKind::QueryBlocked).unwrap(),
            "\"query_blocked\""
        );
        assert_eq!(SecurityEventKind::RateLimitExceeded.to_string(), "rate_limit_exceeded");
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(fingerprint("SELECT 1"), fingerprint("SELECT 1"));
        assert_ne!(fingerprint("SELECT 1"), fingerprint("SELECT 2"));
    }
}
