pub mod config;
pub mod connectors;
pub mod factory;
pub mod manager;
pub mod registry;
pub mod schema;
pub mod sql_text;
pub mod translate;
