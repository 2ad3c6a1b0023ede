pub mod error;
pub mod filter;
pub mod handler;
pub mod position;
pub mod schema;
pub mod statement;
pub mod types;

pub use error::{Error, Result};
pub use filter::TableFilter;
pub use handler::{
    DdlEvent, EventHandler, HandlerError, HandlerResult, NoopHandler, RotateEvent,
    TransactionBoundary,
};
pub use position::Position;
pub use schema::{Column, ColumnKind, TableMeta, TableRef};
pub use statement::{parse_ddl, strip_statement, trim_statement, DdlKind, DdlStatement};
pub use types::{Action, RowEvent, RowImage, Value};
