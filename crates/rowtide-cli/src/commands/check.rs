use anyhow::{Context, Result};
use colored::Colorize;
use rowtide_config::{validate_config, CanalConfig};

pub fn cmd_check(config: &CanalConfig) -> Result<()> {
    validate_config(config).context("Invalid config")?;

    println!("{}", "Config OK".green());
    println!("  source:    {} (server id {})", config.addr, config.server_id);
    println!(
        "  include:   {}",
        describe_patterns(&config.include_table_regex, "all tables")
    );
    println!(
        "  exclude:   {}",
        describe_patterns(&config.exclude_table_regex, "none")
    );
    println!("  snapshot:  {}", describe_dump(config));
    Ok(())
}

fn describe_patterns(patterns: &[String], empty: &str) -> String {
    if patterns.is_empty() {
        empty.to_string()
    } else {
        patterns.join(", ")
    }
}

fn describe_dump(config: &CanalConfig) -> String {
    let dump = &config.dump;
    if !dump.is_enabled() {
        return "disabled".to_string();
    }
    if !dump.tables.is_empty() {
        format!("{}: {}", dump.table_db, dump.tables.join(", "))
    } else if !dump.databases.is_empty() {
        format!("databases {}", dump.databases.join(", "))
    } else if !dump.table_db.is_empty() {
        format!("database {}", dump.table_db)
    } else {
        "all databases".to_string()
    }
}
