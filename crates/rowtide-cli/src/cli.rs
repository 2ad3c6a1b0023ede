use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rowtide_core::Position;

#[derive(Parser)]
#[command(name = "rowtide")]
#[command(about = "Stream MySQL row changes from the binlog")]
#[command(version)]
pub struct Cli {
    /// Path to rowtide.toml config file
    #[arg(short, long, global = true, default_value = "rowtide.toml")]
    pub config: PathBuf,

    /// Environment to load (loads .env.{ENV} instead of .env)
    #[arg(short, long, global = true)]
    pub env: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Snapshot, then stream row events to stdout as JSON lines
    Run {
        /// Skip the snapshot and stream from this binlog position (file:pos)
        #[arg(long)]
        from: Option<Position>,

        /// Skip the snapshot and stream from the current master position
        #[arg(long, conflicts_with = "from")]
        no_snapshot: bool,
    },

    /// Validate the config file
    Check,

    /// Print the source's current binlog position
    Position,

    /// Show the metadata the engine would use for a table
    Table {
        /// Database name
        schema: String,

        /// Table name
        table: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_from() {
        let cli = Cli::parse_from(["rowtide", "run", "--from", "mysql-bin.000003:1542"]);
        match cli.command {
            Commands::Run { from, no_snapshot } => {
                assert_eq!(from, Some(Position::new("mysql-bin.000003", 1542)));
                assert!(!no_snapshot);
            }
            _ => panic!("expected run"),
        }
        assert_eq!(cli.config, PathBuf::from("rowtide.toml"));
    }

    #[test]
    fn test_rejects_bad_position() {
        assert!(Cli::try_parse_from(["rowtide", "run", "--from", "nocolon"]).is_err());
        assert!(
            Cli::try_parse_from(["rowtide", "run", "--from", "f:1", "--no-snapshot"]).is_err()
        );
    }
}
