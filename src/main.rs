use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use dbbridge_lib::{AppConfig, ConnectionManager, ToolRouter};

const CONFIG_ENV: &str = "DBBRIDGE_CONFIG";

fn config_path() -> Result<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .with_context(|| format!("usage: dbbridge <config.json> (or set {})", CONFIG_ENV))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = config_path()?;
    let config = AppConfig::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    let manager = Arc::new(ConnectionManager::new(&config));
    let outcomes = manager.initialize(&config.connections).await;
    let connected = outcomes.iter().filter(|(_, r)| r.is_ok()).count();
    log::info!("{}/{} connection(s) established", connected, outcomes.len());
    manager.start_health_checks();

    let router = ToolRouter::new(manager.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received shutdown signal (Ctrl+C)");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read request")? else {
                    log::info!("Input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = router.handle_line(&line).await;
                stdout.write_all(response.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
    }

    log::info!("Closing connections...");
    manager.close().await;
    Ok(())
}
