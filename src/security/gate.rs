use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SecurityPolicy;
use crate::error::{DbError, Result};
use crate::security::audit::{AuditFilter, EventLog, RiskLevel, SecurityMetrics};
use crate::security::rate_limit::RateLimiter;
use crate::security::validation::{self, QueryInspection, ValidationError};
use crate::security::{SecurityEvent, SecurityEventKind, Severity};

/// Events included in a report when the caller does not say
pub const DEFAULT_REPORT_EVENTS: usize = 10;

/// Aggregated view of the gate's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityReport {
    pub generated_at: DateTime<Utc>,
    pub total_events: usize,
    pub risk_level: RiskLevel,
    pub global_metrics: SecurityMetrics,
    pub backend_metrics: BTreeMap<String, SecurityMetrics>,
    pub recent_events: Vec<SecurityEvent>,
}

/// Screens statements and records security events.
///
/// Every statement passes `validate_query` then the rate limiter before it
/// reaches an adapter. The event log and the rate-limit windows are shared
/// with the health-check task, so both sit behind mutexes that are never held
/// across an await.
#[derive(Debug)]
pub struct SecurityGate {
    policy: SecurityPolicy,
    log: Mutex<EventLog>,
    limiter: Mutex<RateLimiter>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SecurityGate {
    pub fn new(policy: SecurityPolicy) -> Self {
        let limiter = RateLimiter::new(policy.rate_limit_max, policy.rate_limit_window());
        Self {
            policy,
            log: Mutex::new(EventLog::default()),
            limiter: Mutex::new(limiter),
        }
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    /// Length ceiling, pattern scan, multi-statement note and write policy.
    pub fn validate_query(&self, statement: &str, backend_id: Option<&str>) -> Result<QueryInspection> {
        let event = |kind, severity| {
            let event = SecurityEvent::new(kind, severity).query(statement);
            match backend_id {
                Some(id) => event.backend(id),
                None => event,
            }
        };

        let inspection = match validation::validate_query(statement, self.policy.max_query_length) {
            Ok(inspection) => inspection,
            Err(ValidationError::TooLong { max, actual }) => {
                self.log_event(
                    event(SecurityEventKind::OversizedQuery, Severity::Warning)
                        .details(serde_json::json!({ "length": actual, "max": max })),
                );
                return Err(DbError::blocked(format!(
                    "query exceeds maximum length of {} characters",
                    max
                )));
            }
            Err(ValidationError::NullBytes) => {
                self.log_event(
                    event(SecurityEventKind::SuspiciousActivity, Severity::Warning)
                        .details(serde_json::json!({ "pattern": "null_byte" })),
                );
                return Err(DbError::blocked("suspicious pattern detected (null_byte)"));
            }
            Err(err @ ValidationError::SqlInjection(pattern)) => {
                self.log_event(
                    event(SecurityEventKind::SuspiciousActivity, Severity::Warning)
                        .details(serde_json::json!({ "pattern": pattern })),
                );
                return Err(DbError::blocked(err.to_string()));
            }
            Err(other) => return Err(DbError::blocked(other.to_string())),
        };

        if inspection.statement_count > 1 {
            self.log_event(
                event(SecurityEventKind::MultiStatement, Severity::Info)
                    .details(serde_json::json!({ "statements": inspection.statement_count })),
            );
        }

        if let Err(violation) = validation::check_policy(statement, &self.policy) {
            let reason = violation.to_string();
            self.log_event(
                event(SecurityEventKind::PolicyViolation, Severity::Warning)
                    .details(serde_json::json!({ "reason": reason })),
            );
            return Err(DbError::blocked(reason));
        }

        Ok(inspection)
    }

    /// Count a request for `identifier` against the configured limit.
    pub fn check_rate_limit(&self, identifier: &str) -> Result<()> {
        self.check_rate_limit_with(
            identifier,
            self.policy.rate_limit_max,
            self.policy.rate_limit_window(),
        )
    }

    pub fn check_rate_limit_with(
        &self,
        identifier: &str,
        max_requests: u32,
        window: Duration,
    ) -> Result<()> {
        let outcome = lock(&self.limiter).check_with(identifier, max_requests, window);
        match outcome {
            Ok(_) => Ok(()),
            Err(exceeded) => {
                let window_ms = u64::try_from(exceeded.window.as_millis()).unwrap_or(u64::MAX);
                self.log_event(
                    SecurityEvent::new(SecurityEventKind::RateLimitExceeded, Severity::Warning)
                        .backend(identifier)
                        .details(serde_json::json!({
                            "limit": exceeded.limit,
                            "windowMs": window_ms,
                            "count": exceeded.count,
                        })),
                );
                Err(DbError::RateLimited {
                    identifier: identifier.to_string(),
                    limit: exceeded.limit,
                    window_ms,
                })
            }
        }
    }

    /// Validate then rate-limit, keyed by backend id.
    pub fn screen_query(&self, statement: &str, backend_id: &str) -> Result<QueryInspection> {
        let inspection = self.validate_query(statement, Some(backend_id))?;
        self.check_rate_limit(backend_id)?;
        Ok(inspection)
    }

    pub fn log_event(&self, event: SecurityEvent) {
        match event.severity {
            Severity::Info => log::debug!(
                "security event {} backend={:?}",
                event.kind,
                event.backend_id
            ),
            Severity::Warning => log::warn!(
                "security event {} backend={:?} details={:?}",
                event.kind,
                event.backend_id,
                event.details
            ),
            Severity::Error | Severity::Critical => log::error!(
                "security event {} ({:?}) backend={:?} details={:?}",
                event.kind,
                event.severity,
                event.backend_id,
                event.details
            ),
        }
        lock(&self.log).append(event);
    }

    /// Most recent events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        lock(&self.log).recent(limit)
    }

    pub fn filter_events(&self, filter: &AuditFilter) -> Vec<SecurityEvent> {
        lock(&self.log).filter(filter)
    }

    pub fn event_count(&self) -> usize {
        lock(&self.log).len()
    }

    /// Global metrics, or one backend's (zeroed if it has no events yet).
    pub fn metrics(&self, backend_id: Option<&str>) -> SecurityMetrics {
        let log = lock(&self.log);
        match backend_id {
            Some(id) => log.backend_metrics(id).cloned().unwrap_or_default(),
            None => log.global_metrics().clone(),
        }
    }

    pub fn risk_level(&self) -> RiskLevel {
        lock(&self.log).risk_level()
    }

    pub fn report(&self, recent: usize) -> SecurityReport {
        let log = lock(&self.log);
        SecurityReport {
            generated_at: Utc::now(),
            total_events: log.len(),
            risk_level: log.risk_level(),
            global_metrics: log.global_metrics().clone(),
            backend_metrics: log
                .all_backend_metrics()
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect(),
            recent_events: log.recent(recent),
        }
    }

    /// Drop events older than `max_age` (the policy retention if `None`) and
    /// expired rate-limit windows. Returns the number of events dropped.
    pub fn purge_events_older_than(&self, max_age: Option<chrono::Duration>) -> usize {
        let max_age = max_age.unwrap_or_else(|| self.policy.event_retention());
        let purged = lock(&self.log).purge_older_than(max_age);
        let swept = lock(&self.limiter).sweep_expired();
        log::info!(
            "Purged {} security event(s) and {} rate-limit window(s)",
            purged,
            swept
        );
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SecurityGate {
        SecurityGate::new(SecurityPolicy::default())
    }

    #[test]
    fn test_plain_query_passes() {
        let gate = gate();
        assert!(gate
            .validate_query("SELECT * FROM users WHERE id = ?", Some("main"))
            .is_ok());
        assert_eq!(gate.event_count(), 0);
    }

    #[test]
    fn test_suspicious_query_blocked_and_logged() {
        let gate = gate();
        let err = gate
            .validate_query("SELECT * FROM users UNION SELECT password FROM admins", Some("main"))
            .unwrap_err();
        match err {
            DbError::QueryBlocked { reason } => {
                assert!(reason.starts_with("suspicious pattern detected"));
                assert!(reason.contains("union_select"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let events = gate.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SecurityEventKind::SuspiciousActivity);
        assert_eq!(events[0].severity, Severity::Warning);
        assert_eq!(events[0].details.as_ref().unwrap()["pattern"], "union_select");
        assert_eq!(gate.metrics(Some("main")).suspicious_activity, 1);

        assert!(gate.validate_query("x; DROP TABLE users", None).is_err());
    }

    #[test]
    fn test_oversized_query() {
        let gate = gate();
        let statement = format!("SELECT '{}'", "a".repeat(10_000));
        let err = gate.validate_query(&statement, Some("main")).unwrap_err();
        assert_eq!(err.code(), "query_blocked");
        let events = gate.recent_events(1);
        assert_eq!(events[0].kind, SecurityEventKind::OversizedQuery);
        assert_eq!(events[0].query.as_ref().unwrap().chars().count(), 200);
    }

    #[test]
    fn test_multi_statement_is_informational() {
        let gate = gate();
        assert!(gate.validate_query("SELECT 1; SELECT 2", Some("main")).is_ok());
        let events = gate.recent_events(10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, SecurityEventKind::MultiStatement);
        assert_eq!(events[0].severity, Severity::Info);
    }

    #[test]
    fn test_policy_violation() {
        let gate = SecurityGate::new(SecurityPolicy {
            read_only: true,
            ..Default::default()
        });
        let err = gate
            .validate_query("DELETE FROM users WHERE id = ?", Some("main"))
            .unwrap_err();
        assert!(matches!(err, DbError::QueryBlocked { .. }));
        assert_eq!(
            gate.recent_events(1)[0].kind,
            SecurityEventKind::PolicyViolation
        );
    }

    #[test]
    fn test_document_commands_screened_by_default_policy() {
        let gate = gate();
        for command in [r#"{"drop":"users"}"#, r#"{"dropDatabase":1}"#] {
            let err = gate.validate_query(command, Some("docs")).unwrap_err();
            assert!(matches!(err, DbError::QueryBlocked { .. }), "{command}");
        }
        assert!(gate
            .validate_query(r#"{"find":"users","filter":{}}"#, Some("docs"))
            .is_ok());

        let events = gate.recent_events(10);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.kind == SecurityEventKind::PolicyViolation));

        let strict = SecurityGate::new(SecurityPolicy {
            allow_data_modification: false,
            ..Default::default()
        });
        let err = strict
            .validate_query(
                r#"{"delete":"users","deletes":[{"q":{},"limit":0}]}"#,
                Some("docs"),
            )
            .unwrap_err();
        assert_eq!(err.code(), "query_blocked");
        assert_eq!(
            strict.recent_events(1)[0].kind,
            SecurityEventKind::PolicyViolation
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_logs_warning_and_resets() {
        let gate = gate();
        let window = Duration::from_millis(1000);
        for _ in 0..3 {
            gate.check_rate_limit_with("main", 3, window).unwrap();
        }
        let err = gate.check_rate_limit_with("main", 3, window).unwrap_err();
        assert_eq!(
            err,
            DbError::RateLimited {
                identifier: "main".to_string(),
                limit: 3,
                window_ms: 1000
            }
        );
        let events = gate.recent_events(1);
        assert_eq!(events[0].kind, SecurityEventKind::RateLimitExceeded);
        assert_eq!(events[0].severity, Severity::Warning);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(gate.check_rate_limit_with("main", 3, window).is_ok());
    }

    #[test]
    fn test_report() {
        let gate = gate();
        gate.log_event(
            SecurityEvent::new(SecurityEventKind::ConnectionSuccess, Severity::Info).backend("a"),
        );
        gate.log_event(
            SecurityEvent::new(SecurityEventKind::QueryExecuted, Severity::Info).backend("b"),
        );
        gate.log_event(SecurityEvent::new(SecurityEventKind::QueryFailed, Severity::Critical));

        let report = gate.report(DEFAULT_REPORT_EVENTS);
        assert_eq!(report.total_events, 3);
        assert_eq!(report.risk_level, RiskLevel::Critical);
        assert_eq!(report.global_metrics.queries_executed, 1);
        assert_eq!(
            report.backend_metrics.keys().cloned().collect::<Vec<_>>(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(report.recent_events.len(), 3);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["riskLevel"], "critical");
    }

    #[test]
    fn test_purge_default_retention() {
        let gate = gate();
        gate.log_event(SecurityEvent::new(SecurityEventKind::QueryExecuted, Severity::Info));
        assert_eq!(gate.purge_events_older_than(None), 0);
        assert_eq!(gate.purge_events_older_than(Some(chrono::Duration::seconds(-1))), 1);
        assert_eq!(gate.event_count(), 0);
        assert_eq!(gate.metrics(None).queries_executed, 1);
    }
}
