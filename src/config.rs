use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::config::BackendConfig;
use crate::error::{DbError, Result};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub connections: Vec<ConnectionEntry>,
    pub manager: ManagerPolicy,
    pub security: SecurityPolicy,
}

/// A connection id paired with its backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionEntry {
    pub id: String,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

/// Connection lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerPolicy {
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// 0 disables the health-check loop
    pub health_check_interval_ms: u64,
    pub max_query_results: usize,
}

impl Default for ManagerPolicy {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            health_check_interval_ms: 300_000,
            max_query_results: 1000,
        }
    }
}

impl ManagerPolicy {
    /// Delay before retry `attempt` (1-based). Linear, no jitter.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        match self.health_check_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Query screening policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityPolicy {
    pub read_only: bool,
    pub allow_data_modification: bool,
    pub allow_drop: bool,
    pub allow_truncate: bool,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub max_query_length: usize,
    pub event_retention_hours: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_data_modification: true,
            allow_drop: false,
            allow_truncate: false,
            rate_limit_max: 100,
            rate_limit_window_ms: 60_000,
            max_query_length: 10_000,
            event_retention_hours: 24,
        }
    }
}

impl SecurityPolicy {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn event_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.event_retention_hours))
    }
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DbError::configuration("config", e.to_string()))
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration("config", format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&text)?;
        log::info!(
            "Loaded {} connection(s) from {}",
            config.connections.len(),
            path.display()
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connectors::BackendKind;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::from_json_str("{}").unwrap();
        assert!(cfg.connections.is_empty());
        assert_eq!(cfg.manager.retry_attempts, 3);
        assert_eq!(cfg.manager.max_query_results, 1000);
        assert_eq!(cfg.security.rate_limit_max, 100);
        assert_eq!(cfg.security.max_query_length, 10_000);
        assert!(cfg.security.allow_data_modification);
        assert!(!cfg.security.allow_drop);
    }

    #[test]
    fn test_connections_parse_with_flattened_backend() {
        let cfg = AppConfig::from_json_str(
            r#"{
                "connections": [
                    {"id": "main", "type": "postgres", "host": "db", "user": "u", "database": "d"},
                    {"id": "local", "type": "sqlite", "path": "/tmp/app.db", "read_only": true},
                    {"id": "api", "type": "supabase", "url": "https://x.supabase.co", "api_key": "k"}
                ],
                "manager": {"retry_attempts": 5, "health_check_interval_ms": 0},
                "security": {"read_only": true}
            }"#,
        )
        .unwrap();
        let kinds: Vec<_> = cfg.connections.iter().map(|c| c.backend.kind()).collect();
        assert_eq!(
            kinds,
            vec![BackendKind::Postgres, BackendKind::Sqlite, BackendKind::Rest]
        );
        assert_eq!(cfg.connections[0].id, "main");
        assert_eq!(cfg.manager.retry_attempts, 5);
        assert_eq!(cfg.manager.retry_base_delay_ms, 1000);
        assert!(cfg.manager.health_check_interval().is_none());
        assert!(cfg.security.read_only);
    }

    #[test]
    fn test_retry_delay_is_linear() {
        let policy = ManagerPolicy {
            retry_base_delay_ms: 250,
            ..Default::default()
        };
        assert_eq!(policy.retry_delay(1), Duration::from_millis(250));
        assert_eq!(policy.retry_delay(3), Duration::from_millis(750));
    }

    #[test]
    fn test_invalid_json_is_configuration_error() {
        let err = AppConfig::from_json_str("{not json").unwrap_err();
        assert_eq!(err.code(), "configuration_error");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AppConfig::load(&dir.path().join("absent.json")).is_err());
    }
}
