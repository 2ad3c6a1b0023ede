//! Seams between the engine and the database it replicates from.
//!
//! [`crate::upstream::MySqlUpstream`] talks to a real server;
//! [`crate::mock::MockUpstream`] scripts everything in memory for tests.

use std::future::Future;

use rowtide_core::{Position, TableMeta};
use tokio::io::{AsyncBufRead, AsyncRead};

use crate::error::CanalResult;

/// Where table metadata and the source's head position come from.
pub trait MetadataSource: Send + Sync + 'static {
    /// Column layout and primary key of `schema.table`, `None` if the
    /// table does not exist.
    fn load_table(
        &self,
        schema: &str,
        table: &str,
    ) -> impl Future<Output = CanalResult<Option<TableMeta>>> + Send;

    /// Current end of the binlog on the source.
    fn master_position(&self) -> impl Future<Output = CanalResult<Position>> + Send;
}

/// A running snapshot dump.
pub trait DumpHandle: Send {
    type Output: AsyncBufRead + Unpin + Send;

    /// The dump's SQL output.
    fn output(&mut self) -> &mut Self::Output;

    /// Wait for the dump to exit. Fails if it did not exit cleanly.
    fn wait(&mut self) -> impl Future<Output = CanalResult<()>> + Send;

    /// Stop the dump without waiting for it to finish.
    fn abort(&mut self) -> impl Future<Output = ()> + Send;
}

/// Everything the engine needs from the source database.
pub trait Upstream: MetadataSource {
    type Binlog: AsyncRead + Unpin + Send;
    type Dump: DumpHandle;

    /// Connect, register as a replica and request events from `from` on.
    fn open_binlog(
        &self,
        from: &Position,
    ) -> impl Future<Output = CanalResult<Self::Binlog>> + Send;

    /// Start the snapshot dump, or `None` when dumping is disabled.
    fn start_dump(&self) -> impl Future<Output = CanalResult<Option<Self::Dump>>> + Send;
}
