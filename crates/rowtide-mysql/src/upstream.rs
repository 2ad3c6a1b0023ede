//! The MySQL server the engine replicates from.
//!
//! Metadata and ad-hoc statements go through a `mysql_async` pool; the
//! binlog stream uses its own [`ReplicationConnection`].

use mysql_async::prelude::Queryable;
use mysql_async::{OptsBuilder, Pool, Row};
use rowtide_config::CanalConfig;
use rowtide_core::{Column, Position, TableMeta};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{CanalError, CanalResult};
use crate::liveness::LivenessConfig;
use crate::replication::ReplicationConnection;
use crate::snapshot::MysqlDump;
use crate::source::{MetadataSource, Upstream};

/// `ER_NO_SUCH_TABLE`
const ER_NO_SUCH_TABLE: u16 = 1146;
/// `ER_BAD_DB_ERROR`
const ER_BAD_DB_ERROR: u16 = 1049;

#[derive(Debug)]
pub struct MySqlUpstream {
    config: CanalConfig,
    host: String,
    port: u16,
    pool: Pool,
}

impl MySqlUpstream {
    pub fn new(config: CanalConfig) -> CanalResult<Self> {
        let (host, port) = config.host_port()?;
        let opts = OptsBuilder::default()
            .ip_or_hostname(host.clone())
            .tcp_port(port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()));

        Ok(Self {
            pool: Pool::new(opts),
            config,
            host,
            port,
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run a statement on a pooled connection and collect its rows.
    pub async fn execute(&self, sql: &str) -> CanalResult<Vec<Row>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn.query(sql).await?;
        Ok(rows)
    }

    /// Close the pool's connections.
    pub async fn disconnect(self) -> CanalResult<()> {
        self.pool.disconnect().await?;
        Ok(())
    }

    async fn columns(&self, schema: &str, table: &str) -> CanalResult<Option<Vec<Column>>> {
        let sql = format!(
            "SHOW FULL COLUMNS FROM {}.{}",
            quote_ident(schema),
            quote_ident(table)
        );
        let rows = match self.execute(&sql).await {
            Ok(rows) => rows,
            Err(CanalError::Server { code, .. })
                if code == ER_NO_SUCH_TABLE || code == ER_BAD_DB_ERROR =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get("Field").unwrap_or_default();
                let raw_type: String = row.get("Type").unwrap_or_default();
                let nullable: String = row.get("Null").unwrap_or_default();
                let column = Column::new(name, raw_type);
                if nullable.eq_ignore_ascii_case("NO") {
                    column.not_null()
                } else {
                    column
                }
            })
            .collect();
        Ok(Some(columns))
    }

    async fn primary_key(&self, schema: &str, table: &str) -> CanalResult<Vec<String>> {
        let sql = format!(
            "SHOW INDEX FROM {}.{}",
            quote_ident(schema),
            quote_ident(table)
        );
        let mut key: Vec<(u32, String)> = self
            .execute(&sql)
            .await?
            .iter()
            .filter(|row| row.get::<String, _>("Key_name").as_deref() == Some("PRIMARY"))
            .map(|row| {
                (
                    row.get("Seq_in_index").unwrap_or_default(),
                    row.get("Column_name").unwrap_or_default(),
                )
            })
            .collect();
        key.sort_by_key(|(seq, _)| *seq);
        Ok(key.into_iter().map(|(_, name)| name).collect())
    }
}

impl MetadataSource for MySqlUpstream {
    async fn load_table(&self, schema: &str, table: &str) -> CanalResult<Option<TableMeta>> {
        let Some(columns) = self.columns(schema, table).await? else {
            return Ok(None);
        };
        let pk = self.primary_key(schema, table).await?;
        let pk: Vec<&str> = pk.iter().map(String::as_str).collect();

        let meta = columns
            .into_iter()
            .fold(TableMeta::new(schema, table), TableMeta::with_column)
            .with_primary_key(&pk);
        debug!(schema, table, columns = meta.columns.len(), "loaded table from server");
        Ok(Some(meta))
    }

    async fn master_position(&self) -> CanalResult<Position> {
        let rows = match self.execute("SHOW MASTER STATUS").await {
            Ok(rows) => rows,
            // 8.4 removed SHOW MASTER STATUS
            Err(CanalError::Server { .. }) => self.execute("SHOW BINARY LOG STATUS").await?,
            Err(e) => return Err(e),
        };

        let row = rows.into_iter().next().ok_or_else(|| {
            CanalError::MySql("binary logging is not enabled on the server".into())
        })?;
        let file: String = row
            .get("File")
            .ok_or_else(|| CanalError::MySql("master status without File".into()))?;
        let pos: u64 = row
            .get("Position")
            .ok_or_else(|| CanalError::MySql("master status without Position".into()))?;

        Ok(Position::new(file, u32::try_from(pos).unwrap_or(u32::MAX)))
    }
}

impl Upstream for MySqlUpstream {
    type Binlog = BufReader<TcpStream>;
    type Dump = MysqlDump;

    async fn open_binlog(&self, from: &Position) -> CanalResult<Self::Binlog> {
        let mut conn =
            ReplicationConnection::connect(&self.config.addr, &self.config.user, &self.config.password)
                .await?;
        info!(
            server_version = conn.server_version(),
            connection_id = conn.connection_id(),
            "replication connection established"
        );

        let liveness = LivenessConfig::from_config(&self.config);
        if liveness.heartbeat_nanos() > 0 {
            conn.query(&format!(
                "SET @master_heartbeat_period = {}",
                liveness.heartbeat_nanos()
            ))
            .await?;
        }
        // events arrive without a trailing CRC32
        conn.query("SET @master_binlog_checksum = 'NONE'").await?;

        conn.register_replica(self.config.server_id, 0).await?;
        conn.start_binlog_dump(from, self.config.server_id).await
    }

    async fn start_dump(&self) -> CanalResult<Option<Self::Dump>> {
        if !self.config.dump.is_enabled() {
            return Ok(None);
        }
        MysqlDump::spawn(
            &self.config.dump,
            &self.host,
            self.port,
            &self.config.user,
            &self.config.password,
        )
        .map(Some)
    }
}

/// Backquote an identifier for interpolation into a statement.
fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "`users`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_new_rejects_bad_address() {
        let config = CanalConfig {
            addr: "no-port".to_string(),
            ..CanalConfig::default()
        };
        assert!(matches!(
            MySqlUpstream::new(config),
            Err(CanalError::Config(_))
        ));
    }
}
