use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::position::Position;
use crate::schema::TableMeta;

/// A column value decoded from a binlog row image or a dump literal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    /// DECIMAL columns keep their exact textual form.
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Decimal(d) => d.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Int(i) => serde_json::Value::Number(i.into()),
            Value::UInt(u) => serde_json::Value::Number(u.into()),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Decimal(s) | Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(b) => match String::from_utf8(b) {
                Ok(s) => serde_json::Value::String(s),
                Err(e) => serde_json::Value::Array(
                    e.into_bytes().into_iter().map(|b| b.into()).collect(),
                ),
            },
            Value::Json(j) => j,
        }
    }
}

/// The kind of change a row event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Insert => f.write_str("insert"),
            Action::Update => f.write_str("update"),
            Action::Delete => f.write_str("delete"),
        }
    }
}

/// One row image, ordered like the table's columns.
pub type RowImage = Vec<Value>;

/// A row change for one table.
///
/// A single binlog rows event (or a single dump INSERT statement) becomes one
/// `RowEvent`, so multi-row statements keep their grouping. For updates the
/// images alternate before/after: `[before0, after0, before1, after1, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub table: Arc<TableMeta>,
    pub action: Action,
    pub rows: Vec<RowImage>,
    /// Position after the event that carried these rows. Snapshot rows carry
    /// the position the stream resumes from.
    pub position: Position,
    /// Source timestamp in seconds; zero for snapshot rows.
    pub timestamp: u32,
}

impl RowEvent {
    pub fn schema(&self) -> &str {
        &self.table.schema
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    /// True when the rows came from the initial dump rather than the binlog.
    pub fn is_snapshot(&self) -> bool {
        self.timestamp == 0
    }

    /// Before/after pairs of an update event.
    pub fn updates(&self) -> impl Iterator<Item = (&RowImage, &RowImage)> {
        let pairs = if self.action == Action::Update {
            self.rows.len() / 2
        } else {
            0
        };
        (0..pairs).map(move |i| (&self.rows[2 * i], &self.rows[2 * i + 1]))
    }

    /// Look up a column value in the given row image by name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.table.find_column(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// JSON rendering keyed by column name.
    pub fn to_json(&self) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = self
            .rows
            .iter()
            .map(|row| {
                let obj = row
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        let name = self
                            .table
                            .columns
                            .get(i)
                            .map(|c| c.name.clone())
                            .unwrap_or_else(|| format!("col_{i}"));
                        (name, serde_json::Value::from(v.clone()))
                    })
                    .collect();
                serde_json::Value::Object(obj)
            })
            .collect();

        serde_json::json!({
            "action": self.action,
            "schema": self.table.schema,
            "table": self.table.name,
            "position": self.position,
            "timestamp": self.timestamp,
            "rows": rows,
        })
    }
}
