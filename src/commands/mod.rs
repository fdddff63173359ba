pub mod connection;
pub mod query;
pub mod schema;
pub mod security;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::manager::ConnectionManager;
use crate::error::{DbError, Result};

/// Tool names accepted by [`ToolRouter::call`]
pub const TOOLS: &[&str] = &[
    "query",
    "list_tables",
    "get_schema",
    "switch_connection",
    "test_connection",
    "test_all",
    "get_status",
    "get_security_report",
    "get_security_metrics",
    "get_recent_events",
    "list_databases",
    "server_info",
    "purge_events",
];

/// One request line: `{"tool": "...", "args": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// One response line.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolResponse {
    Ok { ok: bool, result: Value },
    Err { ok: bool, error: ErrorBody },
}

impl ToolResponse {
    fn from_result(result: Result<Value>) -> Self {
        match result {
            Ok(result) => ToolResponse::Ok { ok: true, result },
            Err(e) => ToolResponse::Err {
                ok: false,
                error: ErrorBody {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
            },
        }
    }
}

/// Dispatches named tool calls with JSON arguments to the manager.
#[derive(Clone)]
pub struct ToolRouter {
    manager: Arc<ConnectionManager>,
}

fn args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    let args = match args {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(args).map_err(|e| DbError::InvalidArguments(format!("{}: {}", tool, e)))
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| DbError::Internal(e.to_string()))
}

impl ToolRouter {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Run one tool call and return its JSON result.
    pub async fn call(&self, name: &str, raw: Value) -> Result<Value> {
        let manager = self.manager.as_ref();
        log::debug!("Tool call '{}'", name);
        match name {
            "query" => to_json(query::query(manager, args(name, raw)?).await?),
            "list_tables" => to_json(schema::list_tables(manager, args(name, raw)?).await?),
            "get_schema" => to_json(schema::get_schema(manager, args(name, raw)?).await?),
            "list_databases" => to_json(schema::list_databases(manager, args(name, raw)?).await?),
            "server_info" => to_json(schema::server_info(manager, args(name, raw)?).await?),
            "switch_connection" => {
                to_json(connection::switch_connection(manager, args(name, raw)?).await?)
            }
            "test_connection" => {
                to_json(connection::test_connection(manager, args(name, raw)?).await?)
            }
            "test_all" => to_json(connection::test_all(manager).await),
            "get_status" => to_json(connection::get_status(manager, args(name, raw)?).await?),
            "get_security_report" => {
                to_json(security::get_security_report(manager, args(name, raw)?))
            }
            "get_security_metrics" => {
                to_json(security::get_security_metrics(manager, args(name, raw)?))
            }
            "get_recent_events" => to_json(security::get_recent_events(manager, args(name, raw)?)),
            "purge_events" => to_json(security::purge_events(manager, args(name, raw)?)),
            other => Err(DbError::NotFound(format!("tool '{}'", other))),
        }
    }

    /// Handle one newline-delimited JSON request and render the response line.
    pub async fn handle_line(&self, line: &str) -> String {
        let result = match serde_json::from_str::<ToolRequest>(line) {
            Ok(request) => self.call(&request.tool, request.args).await,
            Err(e) => Err(DbError::InvalidArguments(format!("malformed request: {}", e))),
        };
        if let Err(ref e) = result {
            log::debug!("Tool call failed: {}", e);
        }

        let response = ToolResponse::from_result(result);
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(
                r#"{{"ok":false,"error":{{"code":"internal_error","message":"{}"}}}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }
}
