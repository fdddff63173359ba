use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::config::BackendConfig;
use super::connectors::{BackendKind, DatabaseConnector};
use crate::error::{DbError, Result};

/// Reads (`query`, catalog calls) share the adapter and lean on the
/// driver's own pool. Lifecycle calls take it exclusively.
pub type SharedConnector = Arc<RwLock<Box<dyn DatabaseConnector>>>;

/// Lifecycle state of a registered connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Point-in-time view of one connection, as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub id: String,
    pub kind: BackendKind,
    #[serde(flatten)]
    pub state: ConnectionState,
    pub is_current: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

/// A registered adapter plus the bookkeeping the manager keeps about it.
pub struct ManagedConnection {
    pub id: String,
    pub config: BackendConfig,
    pub connector: SharedConnector,
    pub state: ConnectionState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ManagedConnection {
    pub fn new(id: String, config: BackendConfig, connector: Box<dyn DatabaseConnector>) -> Self {
        Self {
            id,
            config,
            connector: Arc::new(RwLock::new(connector)),
            state: ConnectionState::Uninitialized,
            last_success: None,
            last_error: None,
            last_checked: None,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.config.kind()
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.last_success = Some(Utc::now());
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.last_error = Some(error.clone());
        self.state = ConnectionState::Failed(error);
    }

    fn status(&self, is_current: bool) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id.clone(),
            kind: self.kind(),
            state: self.state.clone(),
            is_current,
            last_success: self.last_success,
            last_error: self.last_error.clone(),
            last_checked: self.last_checked,
        }
    }
}

/// Holds connections keyed by id, in registration order.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<String, ManagedConnection>,
    order: Vec<String>,
    current: Option<String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Ids are unique.
    pub fn insert(&mut self, connection: ManagedConnection) -> Result<()> {
        if self.connections.contains_key(&connection.id) {
            return Err(DbError::configuration(
                "id",
                format!("duplicate connection id '{}'", connection.id),
            ));
        }
        self.order.push(connection.id.clone());
        self.connections.insert(connection.id.clone(), connection);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ManagedConnection> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ManagedConnection> {
        self.connections.get_mut(id)
    }

    /// Look up a connection or fail with `NotFound`.
    pub fn require(&self, id: &str) -> Result<&ManagedConnection> {
        self.get(id).ok_or_else(|| DbError::NotFound(id.to_string()))
    }

    /// Get a shared reference to a connector.
    pub fn connector(&self, id: &str) -> Result<SharedConnector> {
        self.require(id).map(|c| c.connector.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn set_current(&mut self, id: Option<String>) {
        self.current = id;
    }

    /// First connection, in registration order, that is connected.
    pub fn first_connected(&self) -> Option<String> {
        self.order
            .iter()
            .find(|id| {
                self.connections
                    .get(id.as_str())
                    .map(|c| c.state.is_connected())
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub fn status(&self, id: &str) -> Result<ConnectionStatus> {
        let is_current = self.current.as_deref() == Some(id);
        self.require(id).map(|c| c.status(is_current))
    }

    pub fn all_status(&self) -> Vec<ConnectionStatus> {
        self.order
            .iter()
            .filter_map(|id| self.status(id).ok())
            .collect()
    }

    /// Remove every connection, handing back the connectors for teardown.
    pub fn drain(&mut self) -> Vec<(String, SharedConnector)> {
        self.current = None;
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| {
                self.connections
                    .remove(&id)
                    .map(|c| (id, c.connector))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::FileConfig;
    use crate::db::connectors::sqlite::SqliteConnector;

    fn managed(id: &str) -> ManagedConnection {
        let config = FileConfig {
            path: Some(":memory:".to_string()),
            ..Default::default()
        };
        ManagedConnection::new(
            id.to_string(),
            BackendConfig::Sqlite(config.clone()),
            Box::new(SqliteConnector::new(config)),
        )
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(managed("a")).unwrap();
        assert!(matches!(
            registry.insert(managed("a")),
            Err(DbError::Configuration { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_first_connected_follows_registration_order() {
        let mut registry = ConnectionRegistry::new();
        for id in ["c", "a", "b"] {
            registry.insert(managed(id)).unwrap();
        }
        assert_eq!(registry.first_connected(), None);

        registry.get_mut("b").unwrap().mark_connected();
        registry.get_mut("a").unwrap().mark_connected();
        assert_eq!(registry.first_connected().as_deref(), Some("a"));
        assert_eq!(registry.ids(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_status_reports_failure() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(managed("a")).unwrap();
        registry.get_mut("a").unwrap().mark_failed("refused");
        registry.set_current(Some("a".to_string()));

        let status = registry.status("a").unwrap();
        assert_eq!(status.state, ConnectionState::Failed("refused".to_string()));
        assert_eq!(status.last_error.as_deref(), Some("refused"));
        assert!(status.is_current);
        assert_eq!(status.kind, BackendKind::Sqlite);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"], "refused");

        assert!(matches!(registry.status("zz"), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_drain_clears_everything() {
        let mut registry = ConnectionRegistry::new();
        registry.insert(managed("a")).unwrap();
        registry.insert(managed("b")).unwrap();
        registry.set_current(Some("a".to_string()));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.current().is_none());
    }
}
