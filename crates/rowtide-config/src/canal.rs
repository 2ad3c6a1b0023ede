use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use rowtide_core::TableFilter;

use crate::env::resolve_env;
use crate::error::{ConfigError, ConfigResult};

/// Engine configuration, usually loaded from `rowtide.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CanalConfig {
    /// MySQL address as `host:port`.
    pub addr: String,
    pub user: String,
    /// May reference environment variables as `${VAR}`.
    pub password: String,
    /// Server id announced when registering as a replica. Must be unique
    /// among the source's replicas.
    pub server_id: u32,
    /// How often the source sends heartbeats on an idle stream. Zero
    /// disables server heartbeats.
    pub heartbeat_period_ms: u64,
    /// Fail the stream when no data arrives for this long. Zero disables the
    /// timeout.
    pub read_timeout_ms: u64,
    /// Regexes matched against `schema.table`; empty means every table.
    pub include_table_regex: Vec<String>,
    /// Regexes matched against `schema.table`; exclusion wins.
    pub exclude_table_regex: Vec<String>,
    /// Drop row events whose table no longer exists instead of failing.
    pub discard_no_meta_row_events: bool,
    pub dump: DumpConfig,
}

impl Default for CanalConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3306".to_string(),
            user: "root".to_string(),
            password: String::new(),
            server_id: 1001,
            heartbeat_period_ms: 30_000,
            read_timeout_ms: 90_000,
            include_table_regex: Vec::new(),
            exclude_table_regex: Vec::new(),
            discard_no_meta_row_events: false,
            dump: DumpConfig::default(),
        }
    }
}

/// Initial snapshot settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// Path to `mysqldump`. Empty disables the snapshot phase.
    pub execution_path: String,
    /// Database holding `tables`.
    pub table_db: String,
    pub tables: Vec<String>,
    /// Whole databases to dump; exclusive with `tables`.
    pub databases: Vec<String>,
    /// Tables to skip, as `db.table`.
    pub ignore_tables: Vec<String>,
    /// Row predicate passed to `--where`.
    #[serde(rename = "where")]
    pub where_clause: String,
    /// Do not ask the dump for its binlog coordinates; the master head is
    /// queried before the dump starts instead.
    pub skip_master_data: bool,
    /// Extra arguments appended to the dump command line.
    pub extra_options: Vec<String>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            execution_path: "mysqldump".to_string(),
            table_db: String::new(),
            tables: Vec::new(),
            databases: Vec::new(),
            ignore_tables: Vec::new(),
            where_clause: String::new(),
            skip_master_data: false,
            extra_options: Vec::new(),
        }
    }
}

impl DumpConfig {
    pub fn is_enabled(&self) -> bool {
        !self.execution_path.is_empty()
    }

    /// A dump config with the snapshot phase turned off.
    pub fn disabled() -> Self {
        Self {
            execution_path: String::new(),
            ..Self::default()
        }
    }
}

impl CanalConfig {
    /// Parse a config from a TOML string and resolve `${VAR}` references.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let mut config: CanalConfig = toml::from_str(toml_str)?;
        config.resolve();
        Ok(config)
    }

    /// Read and parse a config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    fn resolve(&mut self) {
        self.addr = resolve_env(&self.addr);
        self.user = resolve_env(&self.user);
        self.password = resolve_env(&self.password);
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    /// `None` when the read timeout is disabled.
    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }

    /// Host and port of `addr`.
    pub fn host_port(&self) -> ConfigResult<(String, u16)> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(self.addr.clone()))?;
        if host.is_empty() {
            return Err(ConfigError::InvalidAddress(self.addr.clone()));
        }
        let port = port
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.addr.clone()))?;
        Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
    }

    /// Compile the include/exclude patterns.
    pub fn table_filter(&self) -> ConfigResult<TableFilter> {
        Ok(TableFilter::new(
            &self.include_table_regex,
            &self.exclude_table_regex,
        )?)
    }
}
