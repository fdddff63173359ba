use serde::{Deserialize, Serialize};

use crate::db::connectors::BackendKind;
use crate::error::{DbError, Result};
use crate::security::validation::validate_connection_string;

/// Options shared by every backend kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionOptions {
    pub ssl: bool,
    pub pool_size: usize,
    pub connect_timeout_ms: u64,
    /// Upper bound for a single statement; unset means no limit
    pub query_timeout_ms: Option<u64>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            ssl: false,
            pool_size: 10,
            connect_timeout_ms: 30_000,
            query_timeout_ms: None,
        }
    }
}

/// Relational server reached over the network (PostgreSQL, MySQL, SQL Server).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    #[serde(flatten)]
    pub options: ConnectionOptions,
}

/// Embedded database stored in a single file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    pub path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(flatten)]
    pub options: ConnectionOptions,
}

/// PostgREST-style resource API (e.g. a Supabase project).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RestConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Exposed schema sent as the Accept-Profile header
    pub schema: Option<String>,
    /// RPC function that executes raw SQL, used for statements that cannot be
    /// expressed as a single-table read
    pub sql_function: Option<String>,
    #[serde(flatten)]
    pub options: ConnectionOptions,
}

/// Document store credential bundle (MongoDB).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentConfig {
    pub uri: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub auth_source: Option<String>,
    #[serde(flatten)]
    pub options: ConnectionOptions,
}

/// Backend configuration keyed by backend kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum BackendConfig {
    #[serde(rename = "postgres", alias = "postgresql")]
    Postgres(ServerConfig),
    #[serde(rename = "mysql", alias = "mariadb")]
    MySql(ServerConfig),
    #[serde(rename = "sqlserver", alias = "mssql")]
    SqlServer(ServerConfig),
    #[serde(rename = "sqlite")]
    Sqlite(FileConfig),
    #[serde(rename = "rest", alias = "supabase")]
    Rest(RestConfig),
    #[serde(rename = "document", alias = "mongodb")]
    Document(DocumentConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Postgres(_) => BackendKind::Postgres,
            BackendConfig::MySql(_) => BackendKind::MySql,
            BackendConfig::SqlServer(_) => BackendKind::SqlServer,
            BackendConfig::Sqlite(_) => BackendKind::Sqlite,
            BackendConfig::Rest(_) => BackendKind::Rest,
            BackendConfig::Document(_) => BackendKind::Document,
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        match self {
            BackendConfig::Postgres(c) | BackendConfig::MySql(c) | BackendConfig::SqlServer(c) => {
                &c.options
            }
            BackendConfig::Sqlite(c) => &c.options,
            BackendConfig::Rest(c) => &c.options,
            BackendConfig::Document(c) => &c.options,
        }
    }

    /// Check that every field the declared kind requires is present.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind();
        match self {
            BackendConfig::Postgres(c) | BackendConfig::MySql(c) | BackendConfig::SqlServer(c) => {
                require(kind, "host", &c.host)?;
                require(kind, "user", &c.user)?;
                require(kind, "database", &c.database)?;
                if c.port == Some(0) {
                    return Err(DbError::configuration("port", "must be between 1 and 65535"));
                }
            }
            BackendConfig::Sqlite(c) => {
                require(kind, "path", &c.path)?;
            }
            BackendConfig::Rest(c) => {
                let url = require(kind, "url", &c.url)?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(DbError::configuration(
                        "url",
                        "must start with http:// or https://",
                    ));
                }
                validate_connection_string(url)
                    .map_err(|e| DbError::configuration("url", e.to_string()))?;
                require(kind, "api_key", &c.api_key)?;
            }
            BackendConfig::Document(c) => {
                require(kind, "database", &c.database)?;
                match (&c.uri, &c.host) {
                    (Some(uri), _) if !uri.trim().is_empty() => {
                        if !(uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")) {
                            return Err(DbError::configuration(
                                "uri",
                                "must use the mongodb:// or mongodb+srv:// scheme",
                            ));
                        }
                        validate_connection_string(uri)
                            .map_err(|e| DbError::configuration("uri", e.to_string()))?;
                    }
                    (_, Some(host)) if !host.trim().is_empty() => {}
                    _ => return Err(DbError::missing_field(kind, "uri")),
                }
            }
        }

        if self.options().pool_size == 0 {
            return Err(DbError::configuration("pool_size", "must be at least 1"));
        }
        Ok(())
    }

    /// Fill in the standard port for kinds that have one.
    pub fn apply_defaults(&mut self) {
        let default_port = self.kind().default_port();
        match self {
            BackendConfig::Postgres(c) | BackendConfig::MySql(c) | BackendConfig::SqlServer(c) => {
                if c.port.is_none() {
                    c.port = default_port;
                }
            }
            BackendConfig::Document(c) => {
                if c.uri.is_none() && c.port.is_none() {
                    c.port = default_port;
                }
            }
            BackendConfig::Rest(c) => {
                if c.schema.is_none() {
                    c.schema = Some("public".to_string());
                }
            }
            BackendConfig::Sqlite(_) => {}
        }
    }
}

fn require<'a>(kind: BackendKind, field: &str, value: &'a Option<String>) -> Result<&'a str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(DbError::missing_field(kind, field)),
    }
}
