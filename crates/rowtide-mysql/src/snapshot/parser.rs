//! Line parser for `mysqldump` output.
//!
//! With `--skip-extended-insert --compact` every statement sits on its own
//! line, so the parser works a line at a time and only needs to understand
//! the master-data marker, `USE` and `INSERT ... VALUES`.

use regex::Regex;
use rowtide_core::{Column, Position, Value};

use crate::error::{CanalError, CanalResult};

/// One literal from a `VALUES` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpValue {
    Null,
    /// Unquoted literal, normally a number.
    Literal(String),
    /// Quoted string with escapes resolved.
    Quoted(String),
    /// `0x...` literal, as written by `--hex-blob`.
    Hex(Vec<u8>),
}

impl DumpValue {
    /// Convert to the value the column would have in a binlog row image.
    pub fn into_value(self, column: &Column) -> Value {
        match self {
            DumpValue::Null => Value::Null,
            DumpValue::Literal(text) | DumpValue::Quoted(text) => column.parse_text(&text),
            DumpValue::Hex(bytes) => column.parse_bytes(bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpStatement {
    /// Binlog coordinates the dump is consistent with.
    Marker(Position),
    Use(String),
    Insert {
        table: String,
        rows: Vec<Vec<DumpValue>>,
    },
}

#[derive(Debug)]
pub struct DumpParser {
    marker: Regex,
    use_db: Regex,
    insert: Regex,
}

impl DumpParser {
    pub fn new() -> CanalResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| CanalError::Snapshot(format!("bad pattern: {e}")))
        };

        Ok(Self {
            marker: compile(
                r"^(?:-- )?CHANGE (?:MASTER|REPLICATION SOURCE) TO (?:MASTER|SOURCE)_LOG_FILE='([^']+)',\s*(?:MASTER|SOURCE)_LOG_POS=(\d+);",
            )?,
            use_db: compile(r"^USE `((?:[^`]|``)+)`;")?,
            insert: compile(r"^INSERT INTO `((?:[^`]|``)+)` VALUES ")?,
        })
    }

    /// Parse one line; `None` for anything the snapshot does not act on.
    pub fn parse_line(&self, line: &str) -> CanalResult<Option<DumpStatement>> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(caps) = self.insert.captures(line) {
            let table = caps[1].replace("``", "`");
            let rest = &line[caps[0].len()..];
            let rows = parse_tuples(rest)
                .map_err(|e| CanalError::Snapshot(format!("INSERT INTO `{table}`: {e}")))?;
            return Ok(Some(DumpStatement::Insert { table, rows }));
        }

        if let Some(caps) = self.marker.captures(line) {
            let pos = caps[2]
                .parse::<u32>()
                .map_err(|e| CanalError::Snapshot(format!("bad marker position: {e}")))?;
            return Ok(Some(DumpStatement::Marker(Position::new(&caps[1], pos))));
        }

        if let Some(caps) = self.use_db.captures(line) {
            return Ok(Some(DumpStatement::Use(caps[1].replace("``", "`"))));
        }

        Ok(None)
    }
}

/// Parse `(a,b),(c,d);` into rows of literals.
pub fn parse_tuples(input: &str) -> Result<Vec<Vec<DumpValue>>, String> {
    let bytes = input.as_bytes();
    let mut i = 0;
    let mut rows = Vec::new();

    loop {
        if bytes.get(i) != Some(&b'(') {
            return Err(format!("expected '(' at offset {i}"));
        }
        i += 1;

        let mut row = Vec::new();
        loop {
            let (value, next) = parse_value(input, i)?;
            row.push(value);
            i = next;
            match bytes.get(i) {
                Some(b',') => i += 1,
                Some(b')') => {
                    i += 1;
                    break;
                }
                _ => return Err(format!("expected ',' or ')' at offset {i}")),
            }
        }
        rows.push(row);

        match bytes.get(i) {
            Some(b',') => i += 1,
            Some(b';') | None => return Ok(rows),
            _ => return Err(format!("unexpected input at offset {i}")),
        }
    }
}

fn parse_value(input: &str, start: usize) -> Result<(DumpValue, usize), String> {
    let bytes = input.as_bytes();
    match bytes.get(start) {
        Some(b'\'') => parse_quoted(input, start + 1),
        Some(_) => {
            let end = bytes[start..]
                .iter()
                .position(|&b| b == b',' || b == b')')
                .map(|n| start + n)
                .ok_or_else(|| format!("unterminated literal at offset {start}"))?;
            let text = &input[start..end];

            let value = if text == "NULL" {
                DumpValue::Null
            } else if let Some(hex_digits) = text.strip_prefix("0x") {
                DumpValue::Hex(
                    hex::decode(hex_digits).map_err(|e| format!("bad hex literal: {e}"))?,
                )
            } else {
                DumpValue::Literal(text.to_string())
            };
            Ok((value, end))
        }
        None => Err("unexpected end of input".to_string()),
    }
}

fn parse_quoted(input: &str, start: usize) -> Result<(DumpValue, usize), String> {
    let mut out = String::new();
    let mut chars = input[start..].char_indices();

    while let Some((offset, c)) = chars.next() {
        match c {
            '\\' => {
                let (_, escaped) = chars
                    .next()
                    .ok_or_else(|| "dangling escape".to_string())?;
                out.push(match escaped {
                    '0' => '\0',
                    'b' => '\u{8}',
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    'Z' => '\u{1A}',
                    other => other,
                });
            }
            '\'' => {
                let after = start + offset + 1;
                // '' inside a string is a literal quote
                if input.as_bytes().get(after) == Some(&b'\'') {
                    chars.next();
                    out.push('\'');
                } else {
                    return Ok((DumpValue::Quoted(out), after));
                }
            }
            c => out.push(c),
        }
    }

    Err(format!("unterminated string at offset {start}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> DumpParser {
        DumpParser::new().unwrap()
    }

    #[test]
    fn test_marker_forms() {
        let p = parser();
        let expected = Some(DumpStatement::Marker(Position::new("mysql-bin.000003", 1542)));

        assert_eq!(
            p.parse_line("CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000003', MASTER_LOG_POS=1542;")
                .unwrap(),
            expected
        );
        assert_eq!(
            p.parse_line("-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000003', MASTER_LOG_POS=1542;")
                .unwrap(),
            expected
        );
        assert_eq!(
            p.parse_line(
                "CHANGE REPLICATION SOURCE TO SOURCE_LOG_FILE='mysql-bin.000003', SOURCE_LOG_POS=1542;\n"
            )
            .unwrap(),
            expected
        );
    }

    #[test]
    fn test_use_and_other_lines() {
        let p = parser();
        assert_eq!(
            p.parse_line("USE `shop`;").unwrap(),
            Some(DumpStatement::Use("shop".to_string()))
        );
        assert_eq!(p.parse_line("/*!40101 SET NAMES utf8mb4 */;").unwrap(), None);
        assert_eq!(p.parse_line("").unwrap(), None);
    }

    #[test]
    fn test_insert_values() {
        let p = parser();
        let line = r"INSERT INTO `users` VALUES (1,'O\'Brien',NULL,0x00FF,-2.5),(2,'a,b)c','it''s',0x,3);";
        match p.parse_line(line).unwrap() {
            Some(DumpStatement::Insert { table, rows }) => {
                assert_eq!(table, "users");
                assert_eq!(rows.len(), 2);
                assert_eq!(
                    rows[0],
                    vec![
                        DumpValue::Literal("1".into()),
                        DumpValue::Quoted("O'Brien".into()),
                        DumpValue::Null,
                        DumpValue::Hex(vec![0x00, 0xFF]),
                        DumpValue::Literal("-2.5".into()),
                    ]
                );
                assert_eq!(rows[1][1], DumpValue::Quoted("a,b)c".into()));
                assert_eq!(rows[1][2], DumpValue::Quoted("it's".into()));
                assert_eq!(rows[1][3], DumpValue::Hex(Vec::new()));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_escapes_and_unicode() {
        let (value, end) = parse_quoted(r"café\n\\ é'", 0).unwrap();
        assert_eq!(value, DumpValue::Quoted("café\n\\ é".into()));
        assert_eq!(end, r"café\n\\ é'".len());
    }

    #[test]
    fn test_malformed_insert() {
        let p = parser();
        assert!(matches!(
            p.parse_line("INSERT INTO `t` VALUES (1,'open);"),
            Err(CanalError::Snapshot(_))
        ));
        assert!(matches!(
            p.parse_line("INSERT INTO `t` VALUES 1,2;"),
            Err(CanalError::Snapshot(_))
        ));
    }

    #[test]
    fn test_values_follow_column_kind() {
        let id = Column::new("id", "int(10) unsigned");
        let data = Column::new("data", "blob");
        let flags = Column::new("flags", "bit(8)");
        assert_eq!(DumpValue::Literal("7".into()).into_value(&id), Value::UInt(7));
        assert_eq!(
            DumpValue::Hex(vec![1, 2]).into_value(&data),
            Value::Bytes(vec![1, 2])
        );
        assert_eq!(DumpValue::Hex(vec![0x05]).into_value(&flags), Value::UInt(5));
        assert_eq!(DumpValue::Null.into_value(&id), Value::Null);
    }

    #[test]
    fn test_dump_text_matches_binlog_values() {
        use crate::replication::event::column_type as ct;
        use crate::replication::value::read_value;
        use std::io::Cursor;

        let stream = |col_type: u8, meta: u16, bytes: &[u8]| {
            read_value(&mut Cursor::new(bytes), col_type, meta).unwrap()
        };

        // the dump runs with a UTC session, so this is the same instant
        let ts = Column::new("created_at", "timestamp");
        assert_eq!(
            DumpValue::Quoted("2023-11-14 22:13:20".into()).into_value(&ts),
            stream(ct::TIMESTAMP2, 0, &1_700_000_000u32.to_be_bytes())
        );

        let ratio = Column::new("ratio", "float");
        assert_eq!(
            DumpValue::Literal("0.1".into()).into_value(&ratio),
            stream(ct::FLOAT, 4, &0.1f32.to_le_bytes())
        );
    }
}
