//! Table metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Broad column category, derived from the declared SQL type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Number,
    Float,
    Decimal,
    Enum,
    Set,
    String,
    Binary,
    DateTime,
    Timestamp,
    Date,
    Time,
    Year,
    Bit,
    Json,
    Geometry,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Declared type as reported by the server, e.g. `int(10) unsigned`.
    pub raw_type: String,
    pub kind: ColumnKind,
    pub unsigned: bool,
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub set_values: Vec<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, raw_type: impl Into<String>) -> Self {
        let raw_type = raw_type.into();
        let lower = raw_type.to_ascii_lowercase();
        let base = lower
            .split(|c: char| c == '(' || c == ' ')
            .next()
            .unwrap_or_default();

        let kind = match base {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" => {
                ColumnKind::Number
            }
            "float" | "double" | "real" => ColumnKind::Float,
            "decimal" | "numeric" => ColumnKind::Decimal,
            "enum" => ColumnKind::Enum,
            "set" => ColumnKind::Set,
            "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
                ColumnKind::Binary
            }
            "datetime" => ColumnKind::DateTime,
            "timestamp" => ColumnKind::Timestamp,
            "date" => ColumnKind::Date,
            "time" => ColumnKind::Time,
            "year" => ColumnKind::Year,
            "bit" => ColumnKind::Bit,
            "json" => ColumnKind::Json,
            "geometry" | "point" | "linestring" | "polygon" | "multipoint"
            | "multilinestring" | "multipolygon" | "geometrycollection" => ColumnKind::Geometry,
            _ => ColumnKind::String,
        };

        let (enum_values, set_values) = match kind {
            ColumnKind::Enum => (parse_labels(&raw_type), Vec::new()),
            ColumnKind::Set => (Vec::new(), parse_labels(&raw_type)),
            _ => (Vec::new(), Vec::new()),
        };

        Self {
            name: name.into(),
            unsigned: lower.contains("unsigned"),
            raw_type,
            kind,
            nullable: true,
            enum_values,
            set_values,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Storage width of an integer column in bits.
    pub fn int_bits(&self) -> Option<u32> {
        if self.kind != ColumnKind::Number {
            return None;
        }
        let lower = self.raw_type.to_ascii_lowercase();
        let bits = if lower.starts_with("tinyint") {
            8
        } else if lower.starts_with("smallint") {
            16
        } else if lower.starts_with("mediumint") {
            24
        } else if lower.starts_with("bigint") {
            64
        } else {
            32
        };
        Some(bits)
    }

    /// Apply column semantics to a value decoded from a binlog row image.
    ///
    /// Integers arrive signed and are reinterpreted for unsigned columns,
    /// enum and set ordinals resolve to their labels, and text stored as
    /// raw bytes becomes a string.
    pub fn coerce(&self, value: Value) -> Value {
        match (self.kind, value) {
            (_, Value::Null) => Value::Null,
            (ColumnKind::Number, Value::Int(v)) if self.unsigned && v < 0 => {
                let bits = self.int_bits().unwrap_or(64);
                let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
                Value::UInt((v as u64) & mask)
            }
            (ColumnKind::Number, Value::Int(v)) if self.unsigned => Value::UInt(v as u64),
            (ColumnKind::Enum, v @ (Value::Int(_) | Value::UInt(_))) => {
                let idx = v.as_u64().unwrap_or(0) as usize;
                match idx {
                    0 => Value::String(String::new()),
                    i => self
                        .enum_values
                        .get(i - 1)
                        .map(|s| Value::String(s.clone()))
                        .unwrap_or(v),
                }
            }
            (ColumnKind::Set, v @ (Value::Int(_) | Value::UInt(_))) => {
                let mask = v.as_u64().unwrap_or(0);
                let labels: Vec<&str> = self
                    .set_values
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i < 64 && mask & (1u64 << i) != 0)
                    .map(|(_, s)| s.as_str())
                    .collect();
                Value::String(labels.join(","))
            }
            (ColumnKind::String | ColumnKind::Enum | ColumnKind::Set, Value::Bytes(b)) => {
                Value::String(String::from_utf8_lossy(&b).into_owned())
            }
            (ColumnKind::Json, Value::Bytes(b)) => match serde_json::from_slice(&b) {
                Ok(json) => Value::Json(json),
                Err(_) => Value::String(String::from_utf8_lossy(&b).into_owned()),
            },
            (_, v) => v,
        }
    }

    /// Interpret an unquoted or quoted SQL literal as this column's value.
    pub fn parse_text(&self, text: &str) -> Value {
        match self.kind {
            ColumnKind::Number => {
                if self.unsigned {
                    text.parse().map(Value::UInt).unwrap_or_else(|_| string(text))
                } else {
                    text.parse().map(Value::Int).unwrap_or_else(|_| string(text))
                }
            }
            ColumnKind::Year => text.parse().map(Value::Int).unwrap_or_else(|_| string(text)),
            ColumnKind::Float => text.parse().map(Value::Float).unwrap_or_else(|_| string(text)),
            ColumnKind::Decimal => Value::Decimal(text.to_string()),
            ColumnKind::Bit => text.parse().map(Value::UInt).unwrap_or_else(|_| string(text)),
            ColumnKind::Json => serde_json::from_str(text)
                .map(Value::Json)
                .unwrap_or_else(|_| string(text)),
            ColumnKind::Binary => Value::Bytes(text.as_bytes().to_vec()),
            _ => string(text),
        }
    }

    /// Interpret raw bytes (a hex literal in a dump) as this column's value.
    pub fn parse_bytes(&self, bytes: Vec<u8>) -> Value {
        match self.kind {
            ColumnKind::Bit => {
                let start = bytes.len().saturating_sub(8);
                let v = bytes[start..]
                    .iter()
                    .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                Value::UInt(v)
            }
            ColumnKind::Binary | ColumnKind::Geometry => Value::Bytes(bytes),
            _ => self.coerce(Value::Bytes(bytes)),
        }
    }
}

fn string(text: &str) -> Value {
    Value::String(text.to_string())
}

/// Extract the quoted labels of an `enum('a','b')` or `set(...)` type.
fn parse_labels(raw_type: &str) -> Vec<String> {
    let Some(start) = raw_type.find('(') else {
        return Vec::new();
    };
    let Some(end) = raw_type.rfind(')') else {
        return Vec::new();
    };
    if end <= start {
        return Vec::new();
    }

    let body = &raw_type[start + 1..end];
    let mut labels = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if in_quote && chars.peek() == Some(&'\'') => {
                chars.next();
                current.push('\'');
            }
            '\'' if in_quote => {
                in_quote = false;
                labels.push(std::mem::take(&mut current));
            }
            '\'' => in_quote = true,
            '\\' if in_quote => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if in_quote => current.push(c),
            _ => {}
        }
    }

    labels
}

/// Metadata of one table as cached by the schema registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub schema: String,
    pub name: String,
    pub columns: Vec<Column>,
    /// Indices into `columns`, in key order.
    pub pk_columns: Vec<usize>,
}

impl TableMeta {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
            columns: Vec::new(),
            pk_columns: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Mark the named columns as the primary key, in the given order.
    /// Unknown names are ignored.
    pub fn with_primary_key(mut self, names: &[&str]) -> Self {
        self.pk_columns = names
            .iter()
            .filter_map(|n| self.find_column(n))
            .collect();
        self
    }

    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.schema, &self.name)
    }
}

/// A fully qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_kinds() {
        assert_eq!(Column::new("a", "int(10) unsigned").kind, ColumnKind::Number);
        assert!(Column::new("a", "int(10) unsigned").unsigned);
        assert_eq!(Column::new("a", "varchar(255)").kind, ColumnKind::String);
        assert_eq!(Column::new("a", "mediumtext").kind, ColumnKind::String);
        assert_eq!(Column::new("a", "varbinary(16)").kind, ColumnKind::Binary);
        assert_eq!(Column::new("a", "decimal(10,2)").kind, ColumnKind::Decimal);
        assert_eq!(Column::new("a", "datetime(6)").kind, ColumnKind::DateTime);
        assert_eq!(Column::new("a", "JSON").kind, ColumnKind::Json);
        assert_eq!(Column::new("a", "point").kind, ColumnKind::Geometry);
    }

    #[test]
    fn test_enum_and_set_labels() {
        let col = Column::new("e", "enum('a','b''c','d')");
        assert_eq!(col.enum_values, vec!["a", "b'c", "d"]);
        assert_eq!(col.coerce(Value::Int(2)), Value::String("b'c".into()));
        assert_eq!(col.coerce(Value::Int(0)), Value::String(String::new()));

        let col = Column::new("s", "set('x','y','z')");
        assert_eq!(col.coerce(Value::Int(0b101)), Value::String("x,z".into()));
    }

    #[test]
    fn test_unsigned_reinterpretation() {
        assert_eq!(
            Column::new("a", "tinyint(3) unsigned").coerce(Value::Int(-1)),
            Value::UInt(255)
        );
        assert_eq!(
            Column::new("a", "mediumint unsigned").coerce(Value::Int(-1)),
            Value::UInt(0xFF_FFFF)
        );
        assert_eq!(
            Column::new("a", "bigint(20) unsigned").coerce(Value::Int(-1)),
            Value::UInt(u64::MAX)
        );
        assert_eq!(
            Column::new("a", "int(11) unsigned").coerce(Value::Int(5)),
            Value::UInt(5)
        );
        assert_eq!(Column::new("a", "int(11)").coerce(Value::Int(-5)), Value::Int(-5));
    }

    #[test]
    fn test_text_bytes_become_strings() {
        let col = Column::new("t", "text");
        assert_eq!(
            col.coerce(Value::Bytes(b"hello".to_vec())),
            Value::String("hello".into())
        );
        let col = Column::new("b", "blob");
        assert_eq!(
            col.coerce(Value::Bytes(vec![0, 1])),
            Value::Bytes(vec![0, 1])
        );
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(Column::new("a", "int").parse_text("-12"), Value::Int(-12));
        assert_eq!(
            Column::new("a", "bigint unsigned").parse_text("18446744073709551615"),
            Value::UInt(u64::MAX)
        );
        assert_eq!(Column::new("a", "double").parse_text("1.5"), Value::Float(1.5));
        assert_eq!(
            Column::new("a", "decimal(5,2)").parse_text("10.50"),
            Value::Decimal("10.50".into())
        );
        assert_eq!(
            Column::new("a", "json").parse_text(r#"{"k":1}"#),
            Value::Json(serde_json::json!({"k": 1}))
        );
    }

    #[test]
    fn test_parse_bytes_bit() {
        let col = Column::new("flags", "bit(10)");
        assert_eq!(col.parse_bytes(vec![0x02, 0x01]), Value::UInt(0x0201));
    }

    #[test]
    fn test_table_meta_lookup() {
        let meta = TableMeta::new("test", "t")
            .with_column(Column::new("id", "int").not_null())
            .with_column(Column::new("Name", "varchar(10)"))
            .with_primary_key(&["id"]);
        assert_eq!(meta.find_column("name"), Some(1));
        assert_eq!(meta.pk_columns, vec![0]);
        assert!(!meta.columns[0].nullable);
        assert_eq!(meta.table_ref().to_string(), "test.t");
    }
}
