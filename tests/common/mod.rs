#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dbbridge_lib::config::{ConnectionEntry, ManagerPolicy, SecurityPolicy};
use dbbridge_lib::db::config::{BackendConfig, FileConfig};
use dbbridge_lib::db::connectors::{BackendKind, DatabaseConnector};
use dbbridge_lib::db::factory::AdapterFactory;
use dbbridge_lib::db::schema::{QueryResult, Row, TableSchema};
use dbbridge_lib::security::SecurityGate;
use dbbridge_lib::{ConnectionManager, DbError, Result};

/// Behaviour shared between a test and the mock adapter it configures.
#[derive(Debug)]
pub struct MockState {
    /// Connect calls that fail before one succeeds
    pub failing_connects: AtomicU32,
    pub connect_calls: AtomicU32,
    pub healthy: AtomicBool,
    pub rows: AtomicUsize,
    pub queries: AtomicU32,
    /// How long each query takes
    pub query_delay_ms: AtomicU64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            failing_connects: AtomicU32::new(0),
            connect_calls: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            rows: AtomicUsize::new(3),
            queries: AtomicU32::new(0),
            query_delay_ms: AtomicU64::new(0),
        }
    }
}

impl MockState {
    pub fn connect_calls(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

pub struct MockConnector {
    state: Arc<MockState>,
    connected: bool,
    last_error: Option<String>,
}

#[async_trait]
impl DatabaseConnector for MockConnector {
    async fn connect(&mut self) -> Result<()> {
        self.connected = false;
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.state.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .failing_connects
                .store(remaining - 1, Ordering::SeqCst);
            self.last_error = Some("connection refused".to_string());
            return Err(DbError::Connection("connection refused".to_string()));
        }
        self.connected = true;
        self.last_error = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn test_connection(&mut self) -> bool {
        if self.connected && self.state.healthy.load(Ordering::SeqCst) {
            true
        } else {
            self.last_error = Some("probe failed".to_string());
            false
        }
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    async fn query(&self, _statement: &str, _params: &[serde_json::Value]) -> Result<QueryResult> {
        if !self.connected {
            return Err(DbError::Connection("not connected".to_string()));
        }
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let rows: Vec<Row> = (0..self.state.rows.load(Ordering::SeqCst))
            .map(|i| Row::from([("n".to_string(), serde_json::json!(i))]))
            .collect();
        Ok(QueryResult::from_rows(rows, None))
    }

    async fn list_tables(&self, _database: Option<&str>) -> Result<Vec<String>> {
        Ok(vec!["users".to_string()])
    }

    async fn get_table_schema(&self, table: &str, _database: Option<&str>) -> Result<TableSchema> {
        Ok(TableSchema {
            schema_name: None,
            table_name: table.to_string(),
            columns: Vec::new(),
            inferred: false,
        })
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }
}

/// Hands out mock adapters whose behaviour tests control by id.
#[derive(Default)]
pub struct MockFactory {
    states: Mutex<HashMap<String, Arc<MockState>>>,
}

impl MockFactory {
    pub fn state(&self, id: &str) -> Arc<MockState> {
        self.states
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .clone()
    }
}

impl AdapterFactory for MockFactory {
    fn create(&self, id: &str, config: &BackendConfig) -> Result<Box<dyn DatabaseConnector>> {
        config.validate()?;
        Ok(Box::new(MockConnector {
            state: self.state(id),
            connected: false,
            last_error: None,
        }))
    }
}

pub fn entry(id: &str) -> ConnectionEntry {
    ConnectionEntry {
        id: id.to_string(),
        backend: BackendConfig::Sqlite(FileConfig {
            path: Some(format!("{}.db", id)),
            ..Default::default()
        }),
    }
}

/// An entry missing its required path.
pub fn invalid_entry(id: &str) -> ConnectionEntry {
    ConnectionEntry {
        id: id.to_string(),
        backend: BackendConfig::Sqlite(FileConfig::default()),
    }
}

pub fn fast_policy() -> ManagerPolicy {
    ManagerPolicy {
        retry_attempts: 3,
        retry_base_delay_ms: 1000,
        health_check_interval_ms: 0,
        max_query_results: 1000,
    }
}

pub fn manager_with(
    factory: Arc<MockFactory>,
    policy: ManagerPolicy,
    security: SecurityPolicy,
) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::with_factory(
        factory,
        policy,
        Arc::new(SecurityGate::new(security)),
    ))
}
