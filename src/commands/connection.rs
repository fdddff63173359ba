use serde::Deserialize;

use crate::db::manager::{ConnectionManager, ConnectionTest};
use crate::db::registry::ConnectionStatus;
use crate::error::Result;

/// Arguments naming exactly one connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionIdArgs {
    #[serde(alias = "id")]
    pub connection_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusArgs {
    pub connection_id: Option<String>,
}

/// Make a registered, connected id the current connection.
pub async fn switch_connection(
    manager: &ConnectionManager,
    args: ConnectionIdArgs,
) -> Result<ConnectionStatus> {
    manager.switch(&args.connection_id).await
}

/// Probe a registered connection without changing its state.
pub async fn test_connection(
    manager: &ConnectionManager,
    args: ConnectionIdArgs,
) -> Result<ConnectionTest> {
    manager.test_connection(&args.connection_id).await
}

pub async fn test_all(manager: &ConnectionManager) -> Vec<ConnectionTest> {
    manager.test_all().await
}

pub async fn get_status(
    manager: &ConnectionManager,
    args: StatusArgs,
) -> Result<Vec<ConnectionStatus>> {
    manager.get_status(args.connection_id.as_deref()).await
}
