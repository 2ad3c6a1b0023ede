//! Binlog replication: wire protocol, packet framing and event decoding.

pub mod decoder;
pub mod event;
pub mod framer;
pub mod json;
pub mod protocol;
pub mod value;

pub use decoder::BinlogDecoder;
pub use event::{BinlogEvent, EventHeader, LogEvent, RowsEvent, RowsKind, TableMapEvent};
pub use framer::{Frame, PacketFramer};
pub use protocol::ReplicationConnection;
