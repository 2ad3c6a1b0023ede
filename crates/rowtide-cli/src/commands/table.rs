use anyhow::{Context, Result};
use colored::Colorize;
use rowtide_config::CanalConfig;
use rowtide_core::{NoopHandler, TableMeta};
use rowtide_mysql::{CanalError, MySqlCanal};

pub async fn cmd_table(config: CanalConfig, schema: &str, table: &str) -> Result<()> {
    let canal = MySqlCanal::connect(config, NoopHandler).context("Failed to create canal")?;

    let meta = match canal
        .get_table(schema, table)
        .await
        .with_context(|| format!("Failed to load {schema}.{table}"))
    {
        Ok(meta) => meta,
        Err(e) => match e.downcast_ref::<CanalError>() {
            Some(err) if err.is_excluded_table() => {
                println!(
                    "{}",
                    format!("{schema}.{table} is excluded by the table filter").yellow()
                );
                return Ok(());
            }
            Some(err) if err.is_table_not_found() => {
                println!("{}", format!("{schema}.{table} does not exist").red());
                return Ok(());
            }
            _ => return Err(e),
        },
    };

    print!("{}", render(&meta));
    Ok(())
}

fn render(meta: &TableMeta) -> String {
    let mut out = format!("\n{}.{}\n", meta.schema, meta.name);
    out.push_str(&format!("{:<24} {:<24} {:>8} {:>4}\n", "Column", "Type", "Nullable", "Key"));
    out.push_str(&format!("{:-<63}\n", ""));
    for (i, column) in meta.columns.iter().enumerate() {
        let key = if meta.pk_columns.contains(&i) { "PRI" } else { "" };
        let nullable = if column.nullable { "yes" } else { "no" };
        out.push_str(&format!(
            "{:<24} {:<24} {:>8} {:>4}\n",
            column.name, column.raw_type, nullable, key
        ));
    }
    out
}
