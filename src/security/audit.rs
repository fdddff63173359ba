use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::security::{SecurityEvent, SecurityEventKind, Severity};

/// Events retained before the oldest is evicted
pub const EVENT_LOG_CAPACITY: usize = 1000;

/// Window of most recent events used for the risk level
const RISK_WINDOW: usize = 20;

/// Filter criteria for querying the event log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub kind: Option<SecurityEventKind>,
    pub backend_id: Option<String>,
    pub min_severity: Option<Severity>,
}

impl AuditFilter {
    fn matches(&self, event: &SecurityEvent) -> bool {
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }

        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }

        if let Some(ref backend_id) = self.backend_id {
            if event.backend_id.as_ref() != Some(backend_id) {
                return false;
            }
        }

        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }

        true
    }
}

/// Monotonic counters derived from logged events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMetrics {
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub queries_executed: u64,
    pub queries_blocked: u64,
    pub suspicious_activity: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl SecurityMetrics {
    fn record(&mut self, event: &SecurityEvent) {
        match event.kind {
            SecurityEventKind::ConnectionAttempt => self.connection_attempts += 1,
            SecurityEventKind::ConnectionFailed => self.connection_failures += 1,
            SecurityEventKind::QueryExecuted => self.queries_executed += 1,
            SecurityEventKind::QueryBlocked => self.queries_blocked += 1,
            SecurityEventKind::SuspiciousActivity => self.suspicious_activity += 1,
            _ => {}
        }
        self.last_activity = Some(event.timestamp);
    }
}

/// Coarse summary of recent security events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Bounded in-memory event log with per-backend and global metrics.
#[derive(Debug)]
pub struct EventLog {
    events: VecDeque<SecurityEvent>,
    capacity: usize,
    global: SecurityMetrics,
    per_backend: HashMap<String, SecurityMetrics>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(EVENT_LOG_CAPACITY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            global: SecurityMetrics::default(),
            per_backend: HashMap::new(),
        }
    }

    /// Append an event, evicting the oldest past capacity, and update metrics.
    pub fn append(&mut self, event: SecurityEvent) {
        self.global.record(&event);
        if let Some(ref backend_id) = event.backend_id {
            self.per_backend
                .entry(backend_id.clone())
                .or_default()
                .record(&event);
        }

        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The `limit` most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn filter(&self, filter: &AuditFilter) -> Vec<SecurityEvent> {
        self.events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Remove events older than `max_age`. Returns the number of events purged.
    pub fn purge_older_than(&mut self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.events.len();
        self.events.retain(|e| e.timestamp >= cutoff);
        before - self.events.len()
    }

    pub fn global_metrics(&self) -> &SecurityMetrics {
        &self.global
    }

    pub fn backend_metrics(&self, backend_id: &str) -> Option<&SecurityMetrics> {
        self.per_backend.get(backend_id)
    }

    pub fn all_backend_metrics(&self) -> &HashMap<String, SecurityMetrics> {
        &self.per_backend
    }

    pub fn risk_level(&self) -> RiskLevel {
        let mut errors = 0;
        let mut warnings = 0;
        for event in self.events.iter().rev().take(RISK_WINDOW) {
            match event.severity {
                Severity::Critical => return RiskLevel::Critical,
                Severity::Error => errors += 1,
                Severity::Warning => warnings += 1,
                Severity::Info => {}
            }
        }

        if errors > 2 {
            RiskLevel::High
        } else if warnings > 5 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}
