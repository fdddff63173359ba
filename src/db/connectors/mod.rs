pub mod mongodb_connector;
pub mod mysql;
pub mod postgres;
pub mod rest;
pub mod sqlite;
pub mod sqlserver;

use std::future::Future;
use std::time::Duration;

use crate::db::schema::{QueryResult, ServerInfo, TableSchema};
use crate::error::{DbError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Supported backend kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BackendKind {
    #[serde(rename = "postgres")]
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    #[serde(rename = "sqlserver")]
    SqlServer,
    #[serde(rename = "sqlite")]
    Sqlite,
    #[serde(rename = "rest")]
    Rest,
    #[serde(rename = "document")]
    Document,
}

/// Coarse grouping of backend kinds by how they are reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendFamily {
    SqlServer,
    EmbeddedFile,
    RestResource,
    DocumentStore,
}

impl BackendKind {
    pub fn family(&self) -> BackendFamily {
        match self {
            BackendKind::Postgres | BackendKind::MySql | BackendKind::SqlServer => {
                BackendFamily::SqlServer
            }
            BackendKind::Sqlite => BackendFamily::EmbeddedFile,
            BackendKind::Rest => BackendFamily::RestResource,
            BackendKind::Document => BackendFamily::DocumentStore,
        }
    }

    /// Standard port for network backends.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            BackendKind::Postgres => Some(5432),
            BackendKind::MySql => Some(3306),
            BackendKind::SqlServer => Some(1433),
            BackendKind::Document => Some(27017),
            BackendKind::Sqlite | BackendKind::Rest => None,
        }
    }

    /// Whether the backend executes arbitrary SQL text.
    pub fn supports_raw_sql(&self) -> bool {
        matches!(self.family(), BackendFamily::SqlServer | BackendFamily::EmbeddedFile)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Postgres => write!(f, "PostgreSQL"),
            BackendKind::MySql => write!(f, "MySQL"),
            BackendKind::SqlServer => write!(f, "SQL Server"),
            BackendKind::Sqlite => write!(f, "SQLite"),
            BackendKind::Rest => write!(f, "REST resource"),
            BackendKind::Document => write!(f, "Document store"),
        }
    }
}

/// The contract every backend adapter implements.
///
/// Statements always use positional `?` placeholders; adapters whose driver
/// expects another syntax translate before execution. Adapters hold no
/// identity: the connection id lives in the manager's registry.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Establish the session or pool. Tears down an existing session first.
    async fn connect(&mut self) -> Result<()>;

    /// Release all resources. A no-op when already disconnected.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether a session is currently established.
    fn is_connected(&self) -> bool;

    /// Cheap liveness probe. Never fails; errors are kept in `last_error`.
    async fn test_connection(&mut self) -> bool;

    /// Most recent connect or probe failure.
    fn last_error(&self) -> Option<&str>;

    /// Execute a statement with positional parameters.
    async fn query(&self, statement: &str, params: &[serde_json::Value]) -> Result<QueryResult>;

    /// List tables (or collections/resources) in the given namespace.
    async fn list_tables(&self, database: Option<&str>) -> Result<Vec<String>>;

    /// Describe a single table's columns.
    async fn get_table_schema(&self, table: &str, database: Option<&str>) -> Result<TableSchema>;

    fn kind(&self) -> BackendKind;

    /// Server-level operations, when the backend has a notion of a server.
    fn introspection(&self) -> Option<&dyn ServerIntrospection> {
        None
    }
}

/// Optional server-level capabilities.
#[async_trait]
pub trait ServerIntrospection: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;

    async fn server_info(&self) -> Result<ServerInfo>;
}

/// Run a connect future under the configured timeout.
pub(crate) async fn with_connect_timeout<T, F>(timeout_ms: u64, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout_ms == 0 {
        return fut.await;
    }
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Connection(format!(
            "connection attempt timed out after {} ms",
            timeout_ms
        ))),
    }
}

/// Fail fast when a statement's placeholders and parameters disagree.
pub(crate) fn ensure_param_count(expected: usize, supplied: usize) -> Result<()> {
    if expected != supplied {
        return Err(DbError::Query(format!(
            "statement has {} placeholder(s) but {} parameter(s) were supplied",
            expected, supplied
        )));
    }
    Ok(())
}
