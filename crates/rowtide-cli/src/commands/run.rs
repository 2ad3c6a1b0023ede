use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use rowtide_config::{CanalConfig, DumpConfig};
use rowtide_core::Position;
use rowtide_mysql::MySqlCanal;
use tracing::{info, warn};

use crate::printer::JsonLinesHandler;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub async fn cmd_run(mut config: CanalConfig, from: Option<Position>, no_snapshot: bool) -> Result<()> {
    if no_snapshot {
        config.dump = DumpConfig::disabled();
    }

    let handler = JsonLinesHandler::new(std::io::stdout());
    let canal = Arc::new(MySqlCanal::connect(config, handler).context("Failed to create canal")?);

    let closer = canal.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, closing...".yellow());
            closer.close();
        }
    });

    info!("Starting rowtide");
    let mut result = match from {
        Some(position) => canal.run_from(position).await,
        None => canal.run().await,
    };

    // An idle stream is reopened from the last synced position.
    while let Err(e) = &result {
        if !e.is_stream_timeout() || canal.is_closed() {
            break;
        }
        warn!(position = %canal.synced_position(), "reconnecting after stream timeout");
        tokio::time::sleep(RECONNECT_DELAY).await;
        result = canal.run().await;
    }

    result.context("Replication stopped")?;
    eprintln!(
        "{}",
        format!("Stopped at {}", canal.synced_position()).green()
    );
    Ok(())
}
