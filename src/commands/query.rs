use serde::Deserialize;

use crate::db::manager::ConnectionManager;
use crate::db::schema::QueryResult;
use crate::error::Result;

/// Arguments of the `query` tool (camelCase fields).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryArgs {
    #[serde(alias = "sql")]
    pub statement: String,
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
    pub connection_id: Option<String>,
}

/// Execute a statement on the given or current connection.
pub async fn query(manager: &ConnectionManager, args: QueryArgs) -> Result<QueryResult> {
    manager
        .query(&args.statement, &args.params, args.connection_id.as_deref())
        .await
}
