use crate::db::config::BackendConfig;
use crate::db::connectors::{
    mongodb_connector::MongoDbConnector, mysql::MySqlConnector, postgres::PostgresConnector,
    rest::RestConnector, sqlite::SqliteConnector, sqlserver::SqlServerConnector,
    DatabaseConnector,
};
use crate::error::Result;

/// Builds adapters from backend configurations.
pub trait AdapterFactory: Send + Sync {
    /// Validate `config` and construct an unconnected adapter for it.
    fn create(&self, id: &str, config: &BackendConfig) -> Result<Box<dyn DatabaseConnector>>;
}

/// The production factory: one adapter per backend kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionFactory;

impl AdapterFactory for ConnectionFactory {
    fn create(&self, id: &str, config: &BackendConfig) -> Result<Box<dyn DatabaseConnector>> {
        config.validate()?;
        let mut config = config.clone();
        config.apply_defaults();

        log::debug!("Creating {} adapter for '{}'", config.kind(), id);
        let connector: Box<dyn DatabaseConnector> = match config {
            BackendConfig::Postgres(c) => Box::new(PostgresConnector::new(c)),
            BackendConfig::MySql(c) => Box::new(MySqlConnector::new(c)),
            BackendConfig::SqlServer(c) => Box::new(SqlServerConnector::new(c)),
            BackendConfig::Sqlite(c) => Box::new(SqliteConnector::new(c)),
            BackendConfig::Rest(c) => Box::new(RestConnector::new(c)),
            BackendConfig::Document(c) => Box::new(MongoDbConnector::new(c)),
        };
        Ok(connector)
    }
}
