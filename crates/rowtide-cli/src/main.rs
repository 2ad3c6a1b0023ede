use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use rowtide_config::CanalConfig;

mod cli;
mod commands;
mod env;
mod printer;

use cli::{Cli, Commands};
use commands::{cmd_check, cmd_position, cmd_run, cmd_table};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env::load_env(cli.env.as_deref())?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rowtide=info".parse()?),
        )
        .init();

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { from, no_snapshot } => cmd_run(config, from, no_snapshot).await,
        Commands::Check => cmd_check(&config),
        Commands::Position => cmd_position(config).await,
        Commands::Table { schema, table } => cmd_table(config, &schema, &table).await,
    }
}

fn load_config(path: &Path) -> Result<CanalConfig> {
    CanalConfig::load(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rowtide.toml");
        fs::write(&path, "addr = \"db:3306\"\nserver_id = 7\n\n[dump]\nexecution_path = \"\"\n")
            .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.addr, "db:3306");
        assert_eq!(config.server_id, 7);
        assert!(!config.dump.is_enabled());

        let err = load_config(&temp_dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
