use thiserror::Error;

use crate::db::connectors::BackendKind;

/// Errors surfaced by connectors, the connection manager and the security gate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DbError {
    /// A backend configuration is missing a required field or carries an invalid value.
    #[error("Configuration error in '{field}': {message}")]
    Configuration { field: String, message: String },

    /// Network, authentication or driver failure while establishing a session.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed to execute a statement.
    #[error("Query error: {0}")]
    Query(String),

    /// The security gate refused the statement.
    #[error("Query blocked: {reason}")]
    QueryBlocked { reason: String },

    #[error("Rate limit exceeded for '{identifier}': {limit} requests per {window_ms} ms")]
    RateLimited {
        identifier: String,
        limit: u32,
        window_ms: u64,
    },

    #[error("Connection '{0}' not found")]
    NotFound(String),

    #[error("Connection '{0}' is not active")]
    InactiveConnection(String),

    #[error("No current connection is available")]
    NoCurrentConnection,

    /// The backend kind does not offer the requested capability.
    #[error("Operation '{operation}' is not supported by {kind} backends")]
    UnsupportedOperation {
        kind: BackendKind,
        operation: String,
    },

    /// A tool call carried arguments that do not match its schema.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn configuration(field: impl Into<String>, message: impl Into<String>) -> Self {
        DbError::Configuration {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Missing required field for the given backend kind.
    pub fn missing_field(kind: BackendKind, field: &str) -> Self {
        DbError::Configuration {
            field: field.to_string(),
            message: format!("required for {} backends", kind),
        }
    }

    /// Wrap a driver error raised while connecting.
    pub fn connection(context: &str, err: impl std::fmt::Display) -> Self {
        DbError::Connection(format!("{}: {}", context, err))
    }

    /// Wrap a driver error raised while executing a statement.
    pub fn query(context: &str, err: impl std::fmt::Display) -> Self {
        DbError::Query(format!("{}: {}", context, err))
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        DbError::QueryBlocked {
            reason: reason.into(),
        }
    }

    pub fn unsupported(kind: BackendKind, operation: impl Into<String>) -> Self {
        DbError::UnsupportedOperation {
            kind,
            operation: operation.into(),
        }
    }

    /// Only transient connection failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbError::Connection(_))
    }

    /// Stable snake_case code used by the tool boundary.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::Configuration { .. } => "configuration_error",
            DbError::Connection(_) => "connection_error",
            DbError::Query(_) => "query_error",
            DbError::QueryBlocked { .. } => "query_blocked",
            DbError::RateLimited { .. } => "rate_limited",
            DbError::NotFound(_) => "not_found",
            DbError::InactiveConnection(_) => "inactive_connection",
            DbError::NoCurrentConnection => "no_current_connection",
            DbError::UnsupportedOperation { .. } => "unsupported_operation",
            DbError::InvalidArguments(_) => "invalid_arguments",
            DbError::Internal(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
