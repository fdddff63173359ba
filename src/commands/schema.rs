use serde::Deserialize;

use crate::db::manager::ConnectionManager;
use crate::db::schema::{ServerInfo, TableSchema};
use crate::error::Result;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTablesArgs {
    pub database: Option<String>,
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSchemaArgs {
    #[serde(alias = "tableName")]
    pub table: String,
    pub database: Option<String>,
    pub connection_id: Option<String>,
}

/// Arguments shared by tools that only target a connection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetArgs {
    pub connection_id: Option<String>,
}

/// Return the list of table names for a connection.
pub async fn list_tables(manager: &ConnectionManager, args: ListTablesArgs) -> Result<Vec<String>> {
    manager
        .list_tables(args.database.as_deref(), args.connection_id.as_deref())
        .await
}

/// Return column details for one table.
pub async fn get_schema(manager: &ConnectionManager, args: GetSchemaArgs) -> Result<TableSchema> {
    manager
        .get_schema(
            &args.table,
            args.database.as_deref(),
            args.connection_id.as_deref(),
        )
        .await
}

pub async fn list_databases(manager: &ConnectionManager, args: TargetArgs) -> Result<Vec<String>> {
    manager.list_databases(args.connection_id.as_deref()).await
}

pub async fn server_info(manager: &ConnectionManager, args: TargetArgs) -> Result<ServerInfo> {
    manager.server_info(args.connection_id.as_deref()).await
}
