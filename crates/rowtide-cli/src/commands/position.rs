use anyhow::{Context, Result};
use rowtide_config::CanalConfig;
use rowtide_mysql::{MetadataSource, MySqlUpstream};

pub async fn cmd_position(config: CanalConfig) -> Result<()> {
    let upstream = MySqlUpstream::new(config).context("Invalid source address")?;
    let position = upstream
        .master_position()
        .await
        .context("Failed to read master position")?;
    println!("{position}");
    upstream.disconnect().await?;
    Ok(())
}
