//! The `mysqldump` child process.

use std::process::Stdio;

use rowtide_config::DumpConfig;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CanalError, CanalResult};
use crate::source::DumpHandle;

/// Command line for a dump of `config` from `host:port`.
///
/// The password is not part of the list; it is handed to the child through
/// `MYSQL_PWD` so it never shows up in the process table.
pub fn dump_args(config: &DumpConfig, host: &str, port: u16, user: &str) -> Vec<String> {
    let mut args = vec![
        format!("--host={host}"),
        format!("--port={port}"),
        format!("--user={user}"),
    ];

    if !config.skip_master_data {
        args.push("--master-data".to_string());
    }

    for flag in [
        "--single-transaction",
        "--skip-lock-tables",
        "--compact",
        "--skip-opt",
        "--quick",
        "--no-create-info",
        "--skip-extended-insert",
        "--hex-blob",
        "--default-character-set=utf8mb4",
    ] {
        args.push(flag.to_string());
    }

    if !config.where_clause.is_empty() {
        args.push(format!("--where={}", config.where_clause));
    }
    for table in &config.ignore_tables {
        args.push(format!("--ignore-table={table}"));
    }
    args.extend(config.extra_options.iter().cloned());

    if !config.tables.is_empty() {
        args.push(config.table_db.clone());
        args.extend(config.tables.iter().cloned());
    } else if !config.databases.is_empty() {
        args.push("--databases".to_string());
        args.extend(config.databases.iter().cloned());
    } else if !config.table_db.is_empty() {
        args.push(config.table_db.clone());
    } else {
        args.push("--all-databases".to_string());
    }

    args
}

/// A running `mysqldump`.
#[derive(Debug)]
pub struct MysqlDump {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
}

impl MysqlDump {
    pub fn spawn(
        config: &DumpConfig,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
    ) -> CanalResult<Self> {
        let args = dump_args(config, host, port, user);
        info!(path = %config.execution_path, ?args, "starting mysqldump");

        let mut child = Command::new(&config.execution_path)
            .args(&args)
            .env("MYSQL_PWD", password)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CanalError::Snapshot(format!(
                    "failed to spawn {}: {}",
                    config.execution_path, e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CanalError::Snapshot("mysqldump stdout not captured".into()))?;

        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut text = String::new();
                if let Err(e) = pipe.read_to_string(&mut text).await {
                    debug!(error = %e, "failed to read mysqldump stderr");
                }
                text
            })
        });

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            stderr,
        })
    }

    async fn take_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}

impl DumpHandle for MysqlDump {
    type Output = BufReader<ChildStdout>;

    fn output(&mut self) -> &mut Self::Output {
        &mut self.stdout
    }

    async fn wait(&mut self) -> CanalResult<()> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| CanalError::Snapshot(format!("failed to wait for mysqldump: {e}")))?;
        let stderr = self.take_stderr().await;

        if status.success() {
            if !stderr.trim().is_empty() {
                debug!(stderr = %stderr.trim(), "mysqldump finished with warnings");
            }
            return Ok(());
        }

        Err(CanalError::Snapshot(format!(
            "mysqldump exited with {}: {}",
            status,
            stderr.trim()
        )))
    }

    async fn abort(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill mysqldump");
        }
    }
}
