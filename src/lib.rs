pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod security;

pub use commands::ToolRouter;
pub use config::AppConfig;
pub use db::manager::ConnectionManager;
pub use error::{DbError, Result};
