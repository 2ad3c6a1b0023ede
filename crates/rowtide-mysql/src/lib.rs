pub mod canal;
pub mod dispatch;
mod error;
pub mod liveness;
pub mod mock;
pub mod registry;
pub mod replication;
pub mod snapshot;
pub mod source;
pub mod stream;
pub mod sync;
pub mod upstream;

pub use canal::Canal;
pub use dispatch::Dispatcher;
pub use error::{CanalError, CanalResult, DecodeError, DecodeResult};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use mock::{BinlogFeed, BinlogWriter, MockUpstream};
pub use registry::SchemaRegistry;
pub use snapshot::{SnapshotCoordinator, SnapshotStats};
pub use source::{DumpHandle, MetadataSource, Upstream};
pub use sync::{EngineState, PositionTracker, SnapshotLatch, SnapshotStatus};
pub use upstream::MySqlUpstream;

/// Engine replicating from a live MySQL server.
pub type MySqlCanal<H> = Canal<MySqlUpstream, H>;
