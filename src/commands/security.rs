use serde::{Deserialize, Serialize};

use crate::db::manager::ConnectionManager;
use crate::security::gate::DEFAULT_REPORT_EVENTS;
use crate::security::{SecurityEvent, SecurityMetrics, SecurityReport};

const DEFAULT_RECENT_EVENTS: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportArgs {
    pub recent_events: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsArgs {
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEventsArgs {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeArgs {
    /// Falls back to the configured retention
    pub max_age_hours: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResult {
    pub purged: usize,
    pub remaining: usize,
}

pub fn get_security_report(manager: &ConnectionManager, args: ReportArgs) -> SecurityReport {
    manager
        .gate()
        .report(args.recent_events.unwrap_or(DEFAULT_REPORT_EVENTS))
}

pub fn get_security_metrics(manager: &ConnectionManager, args: MetricsArgs) -> SecurityMetrics {
    manager.gate().metrics(args.connection_id.as_deref())
}

/// Most recent events, newest last.
pub fn get_recent_events(manager: &ConnectionManager, args: RecentEventsArgs) -> Vec<SecurityEvent> {
    manager
        .gate()
        .recent_events(args.limit.unwrap_or(DEFAULT_RECENT_EVENTS))
}

pub fn purge_events(manager: &ConnectionManager, args: PurgeArgs) -> PurgeResult {
    let max_age = args
        .max_age_hours
        .map(|hours| chrono::Duration::hours(i64::from(hours)));
    let purged = manager.gate().purge_events_older_than(max_age);
    PurgeResult {
        purged,
        remaining: manager.gate().event_count(),
    }
}
