use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::connectors::BackendKind;
use super::factory::{AdapterFactory, ConnectionFactory};
use super::registry::{
    ConnectionRegistry, ConnectionState, ConnectionStatus, ManagedConnection, SharedConnector,
};
use super::schema::{QueryResult, ServerInfo, TableSchema};
use crate::config::{AppConfig, ConnectionEntry, ManagerPolicy};
use crate::error::{DbError, Result};
use crate::security::{
    truncate_chars, validate_table_name, SecurityEvent, SecurityEventKind, SecurityGate, Severity,
};

/// Longest statement excerpt written to log lines
const LOG_STATEMENT_CHARS: usize = 120;

/// Outcome of a liveness probe against one connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    pub id: String,
    pub healthy: bool,
    pub error: Option<String>,
}

/// An active connection resolved for one operation.
struct Target {
    kind: BackendKind,
    connector: SharedConnector,
    query_timeout_ms: Option<u64>,
}

/// Owns every registered connection and routes operations to them.
///
/// Registry bookkeeping happens under a short write lock; adapter calls
/// happen after the lock is released, on the adapter's own mutex.
pub struct ConnectionManager {
    factory: Arc<dyn AdapterFactory>,
    policy: ManagerPolicy,
    gate: Arc<SecurityGate>,
    registry: RwLock<ConnectionRegistry>,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_factory(
            Arc::new(ConnectionFactory),
            config.manager.clone(),
            Arc::new(SecurityGate::new(config.security.clone())),
        )
    }

    pub fn with_factory(
        factory: Arc<dyn AdapterFactory>,
        policy: ManagerPolicy,
        gate: Arc<SecurityGate>,
    ) -> Self {
        Self {
            factory,
            policy,
            gate,
            registry: RwLock::new(ConnectionRegistry::new()),
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
        }
    }

    pub fn gate(&self) -> &Arc<SecurityGate> {
        &self.gate
    }

    pub fn policy(&self) -> &ManagerPolicy {
        &self.policy
    }

    /// Build, register and connect every entry.
    ///
    /// Invalid configurations are skipped. Connection attempts run
    /// concurrently; one failing never affects another. Afterwards the first
    /// connected id, in configuration order, becomes current.
    pub async fn initialize(&self, entries: &[ConnectionEntry]) -> Vec<(String, Result<()>)> {
        let mut outcomes = Vec::new();
        let mut registered = Vec::new();

        {
            let mut registry = self.registry.write().await;
            for entry in entries {
                let created = self
                    .factory
                    .create(&entry.id, &entry.backend)
                    .and_then(|connector| {
                        registry.insert(ManagedConnection::new(
                            entry.id.clone(),
                            entry.backend.clone(),
                            connector,
                        ))
                    });
                match created {
                    Ok(()) => registered.push(entry.id.clone()),
                    Err(e) => {
                        log::error!("Skipping connection '{}': {}", entry.id, e);
                        outcomes.push((entry.id.clone(), Err(e)));
                    }
                }
            }
        }

        let results = join_all(
            registered
                .iter()
                .map(|id| self.connect_with_retry(id, ConnectionState::Connecting)),
        )
        .await;
        outcomes.extend(registered.into_iter().zip(results));

        let mut registry = self.registry.write().await;
        if registry.current().is_none() {
            let first = registry.first_connected();
            match &first {
                Some(id) => log::info!("Current connection is '{}'", id),
                None => log::warn!("No connection could be established"),
            }
            registry.set_current(first);
        }

        outcomes
    }

    /// Connect with bounded retries. Attempt `n` that fails waits
    /// `retry_base_delay * n` before the next one.
    async fn connect_with_retry(&self, id: &str, state: ConnectionState) -> Result<()> {
        let connector = {
            let mut registry = self.registry.write().await;
            let connection = registry
                .get_mut(id)
                .ok_or_else(|| DbError::NotFound(id.to_string()))?;
            connection.state = state;
            connection.connector.clone()
        };

        let attempts = self.policy.retry_attempts.max(1);
        let mut last_error = DbError::Internal("no connection attempt made".to_string());

        for attempt in 1..=attempts {
            self.gate.log_event(
                SecurityEvent::new(SecurityEventKind::ConnectionAttempt, Severity::Info)
                    .backend(id)
                    .details(serde_json::json!({ "attempt": attempt, "maxAttempts": attempts })),
            );

            let result = connector.write().await.connect().await;
            match result {
                Ok(()) => {
                    if let Some(connection) = self.registry.write().await.get_mut(id) {
                        connection.mark_connected();
                    }
                    self.gate.log_event(
                        SecurityEvent::new(SecurityEventKind::ConnectionSuccess, Severity::Info)
                            .backend(id)
                            .details(serde_json::json!({ "attempt": attempt })),
                    );
                    log::info!("Connected '{}' on attempt {}/{}", id, attempt, attempts);
                    return Ok(());
                }
                Err(e) => {
                    let retrying = e.is_retryable() && attempt < attempts;
                    let severity = if retrying {
                        Severity::Warning
                    } else {
                        Severity::Error
                    };
                    self.gate.log_event(
                        SecurityEvent::new(SecurityEventKind::ConnectionFailed, severity)
                            .backend(id)
                            .details(serde_json::json!({
                                "attempt": attempt,
                                "error": e.to_string(),
                            })),
                    );
                    if let Some(connection) = self.registry.write().await.get_mut(id) {
                        connection.last_error = Some(e.to_string());
                    }
                    last_error = e;

                    if !retrying {
                        break;
                    }
                    let delay = self.policy.retry_delay(attempt);
                    log::warn!(
                        "Connection '{}' attempt {}/{} failed: {}; retrying in {:?}",
                        id,
                        attempt,
                        attempts,
                        last_error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        log::error!("Connection '{}' failed: {}", id, last_error);
        if let Some(connection) = self.registry.write().await.get_mut(id) {
            connection.mark_failed(last_error.to_string());
        }
        Err(last_error)
    }

    /// Explicit id if given, else the current connection.
    async fn resolve(&self, id: Option<&str>) -> Result<String> {
        let registry = self.registry.read().await;
        match id {
            Some(id) => registry.require(id).map(|c| c.id.clone()),
            None => registry
                .current()
                .map(str::to_string)
                .ok_or(DbError::NoCurrentConnection),
        }
    }

    async fn target(&self, id: Option<&str>) -> Result<Target> {
        let id = self.resolve(id).await?;
        let registry = self.registry.read().await;
        let connection = registry.require(&id)?;
        if !connection.state.is_connected() {
            return Err(DbError::InactiveConnection(id));
        }
        Ok(Target {
            kind: connection.kind(),
            connector: connection.connector.clone(),
            query_timeout_ms: connection.config.options().query_timeout_ms,
        })
    }

    /// Make `id` the current connection. It must be registered and connected.
    pub async fn switch(&self, id: &str) -> Result<ConnectionStatus> {
        let mut registry = self.registry.write().await;
        let connection = registry.require(id)?;
        if !connection.state.is_connected() {
            return Err(DbError::InactiveConnection(id.to_string()));
        }
        registry.set_current(Some(id.to_string()));
        log::info!("Switched current connection to '{}'", id);
        registry.status(id)
    }

    /// Screen, dispatch and truncate a statement. Every outcome is logged.
    pub async fn query(
        &self,
        statement: &str,
        params: &[serde_json::Value],
        id: Option<&str>,
    ) -> Result<QueryResult> {
        let id = match self.resolve(id).await {
            Ok(id) => id,
            Err(e) => {
                let mut event =
                    SecurityEvent::new(SecurityEventKind::QueryFailed, Severity::Warning)
                        .query(statement)
                        .details(serde_json::json!({ "error": e.to_string() }));
                if let Some(requested) = id {
                    event = event.backend(requested);
                }
                self.gate.log_event(event);
                return Err(e);
            }
        };

        if let Err(e) = self.gate.screen_query(statement, &id) {
            self.gate.log_event(
                SecurityEvent::new(SecurityEventKind::QueryBlocked, Severity::Warning)
                    .backend(id.as_str())
                    .query(statement)
                    .details(serde_json::json!({ "reason": e.to_string() })),
            );
            return Err(e);
        }

        let outcome = match self.target(Some(&id)).await {
            Ok(target) => self.dispatch(&target, statement, params).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(mut result) => {
                let truncated = result.truncate_to(self.policy.max_query_results);
                self.gate.log_event(
                    SecurityEvent::new(SecurityEventKind::QueryExecuted, Severity::Info)
                        .backend(id.as_str())
                        .query(statement)
                        .details(serde_json::json!({
                            "rows": result.row_count(),
                            "totalRows": result.total_rows,
                            "truncated": truncated,
                        })),
                );
                log::debug!(
                    "Query on '{}' returned {} row(s){}",
                    id,
                    result.total_rows,
                    if truncated { " (truncated)" } else { "" }
                );
                Ok(result)
            }
            Err(e) => {
                self.gate.log_event(
                    SecurityEvent::new(SecurityEventKind::QueryFailed, Severity::Warning)
                        .backend(id.as_str())
                        .query(statement)
                        .details(serde_json::json!({ "error": e.to_string() })),
                );
                log::debug!(
                    "Query on '{}' failed: {} [{}]",
                    id,
                    e,
                    truncate_chars(statement, LOG_STATEMENT_CHARS)
                );
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        target: &Target,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<QueryResult> {
        let connector = target.connector.read().await;
        match target.query_timeout_ms {
            Some(ms) if ms > 0 => {
                match tokio::time::timeout(
                    Duration::from_millis(ms),
                    connector.query(statement, params),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DbError::Query(format!(
                        "{} query timed out after {} ms",
                        target.kind, ms
                    ))),
                }
            }
            _ => connector.query(statement, params).await,
        }
    }

    pub async fn list_tables(&self, database: Option<&str>, id: Option<&str>) -> Result<Vec<String>> {
        let target = self.target(id).await?;
        let connector = target.connector.read().await;
        connector.list_tables(database).await
    }

    pub async fn get_schema(
        &self,
        table: &str,
        database: Option<&str>,
        id: Option<&str>,
    ) -> Result<TableSchema> {
        validate_table_name(table).map_err(|e| DbError::InvalidArguments(e.to_string()))?;
        let target = self.target(id).await?;
        let connector = target.connector.read().await;
        connector.get_table_schema(table, database).await
    }

    pub async fn list_databases(&self, id: Option<&str>) -> Result<Vec<String>> {
        let target = self.target(id).await?;
        let connector = target.connector.read().await;
        match connector.introspection() {
            Some(server) => server.list_databases().await,
            None => Err(DbError::unsupported(target.kind, "list_databases")),
        }
    }

    pub async fn server_info(&self, id: Option<&str>) -> Result<ServerInfo> {
        let target = self.target(id).await?;
        let connector = target.connector.read().await;
        match connector.introspection() {
            Some(server) => server.server_info().await,
            None => Err(DbError::unsupported(target.kind, "server_info")),
        }
    }

    /// Probe one connection. Never fails for a registered id.
    pub async fn test_connection(&self, id: &str) -> Result<ConnectionTest> {
        let connector = self.registry.read().await.connector(id)?;
        let (healthy, error) = {
            let mut connector = connector.write().await;
            let healthy = connector.test_connection().await;
            (healthy, connector.last_error().map(str::to_string))
        };

        if let Some(connection) = self.registry.write().await.get_mut(id) {
            connection.last_checked = Some(Utc::now());
            if healthy {
                connection.last_success = connection.last_checked;
            } else {
                connection.last_error = error.clone();
            }
        }

        Ok(ConnectionTest {
            id: id.to_string(),
            healthy,
            error: if healthy { None } else { error },
        })
    }

    /// Probe every connection concurrently.
    pub async fn test_all(&self) -> Vec<ConnectionTest> {
        let ids = self.registry.read().await.ids();
        join_all(ids.iter().map(|id| async move {
            match self.test_connection(id).await {
                Ok(test) => test,
                Err(e) => ConnectionTest {
                    id: id.clone(),
                    healthy: false,
                    error: Some(e.to_string()),
                },
            }
        }))
        .await
    }

    /// Status of one connection, or of all of them in registration order.
    pub async fn get_status(&self, id: Option<&str>) -> Result<Vec<ConnectionStatus>> {
        let registry = self.registry.read().await;
        match id {
            Some(id) => registry.status(id).map(|s| vec![s]),
            None => Ok(registry.all_status()),
        }
    }

    pub async fn current_id(&self) -> Option<String> {
        self.registry.read().await.current().map(str::to_string)
    }

    /// Disconnect one connection, keeping it registered.
    pub async fn disconnect(&self, id: &str) -> Result<()> {
        let connector = self.registry.read().await.connector(id)?;
        let result = connector.write().await.disconnect().await;

        let mut registry = self.registry.write().await;
        if let Some(connection) = registry.get_mut(id) {
            connection.state = ConnectionState::Disconnected;
        }
        if registry.current() == Some(id) {
            let next = registry.first_connected();
            registry.set_current(next);
        }
        drop(registry);

        self.gate.log_event(
            SecurityEvent::new(SecurityEventKind::ConnectionClosed, Severity::Info).backend(id),
        );
        log::info!("Disconnected '{}'", id);
        result
    }

    /// Tear down and re-establish a connection using the retry policy.
    pub async fn reconnect(&self, id: &str) -> Result<()> {
        let connector = self.registry.read().await.connector(id)?;
        if let Err(e) = connector.write().await.disconnect().await {
            log::warn!("Ignoring disconnect error on '{}' before reconnect: {}", id, e);
        }

        let result = self
            .connect_with_retry(id, ConnectionState::Reconnecting)
            .await;

        if result.is_ok() {
            let mut registry = self.registry.write().await;
            if registry.current().is_none() {
                registry.set_current(Some(id.to_string()));
            }
        }
        result
    }

    /// One health-check pass: probe each established connection and
    /// reconnect the ones that fail.
    pub async fn run_health_checks(&self) {
        let ids: Vec<String> = {
            let registry = self.registry.read().await;
            registry
                .ids()
                .into_iter()
                .filter(|id| {
                    registry.get(id).is_some_and(|c| {
                        matches!(
                            c.state,
                            ConnectionState::Connected | ConnectionState::Failed(_)
                        )
                    })
                })
                .collect()
        };

        join_all(ids.iter().map(|id| async move {
            let test = match self.test_connection(id).await {
                Ok(test) => test,
                Err(_) => return,
            };
            if test.healthy {
                return;
            }

            self.gate.log_event(
                SecurityEvent::new(SecurityEventKind::HealthCheckFailed, Severity::Warning)
                    .backend(id.as_str())
                    .details(serde_json::json!({ "error": test.error })),
            );
            log::warn!("Health check failed for '{}', reconnecting", id);
            if let Err(e) = self.reconnect(id).await {
                log::error!("Reconnect of '{}' failed: {}", id, e);
            }
        }))
        .await;
    }

    /// Spawn the periodic health-check loop. Returns false when it is
    /// disabled by policy or already running.
    pub fn start_health_checks(self: &Arc<Self>) -> bool {
        let Some(period) = self.policy.health_check_interval() else {
            log::info!("Health checks disabled");
            return false;
        };

        let mut slot = self
            .health_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return false;
        }

        let manager = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.run_health_checks().await;
                    }
                }
            }
            log::debug!("Health-check loop stopped");
        }));
        log::info!("Health checks every {:?}", period);
        true
    }

    /// Stop the health loop, disconnect everything concurrently and clear
    /// the registry.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Health-check task ended abnormally: {}", e);
            }
        }

        let connections = self.registry.write().await.drain();
        let results = join_all(connections.iter().map(|(id, connector)| async move {
            let result = connector.write().await.disconnect().await;
            (id, result)
        }))
        .await;

        for (id, result) in results {
            match result {
                Ok(()) => log::info!("Closed '{}'", id),
                Err(e) => log::warn!("Error closing '{}': {}", id, e),
            }
            self.gate.log_event(
                SecurityEvent::new(SecurityEventKind::ConnectionClosed, Severity::Info)
                    .backend(id.as_str()),
            );
        }
    }
}
