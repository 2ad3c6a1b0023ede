//! Binlog coordinates.
//!
//! A position names a binlog file and a byte offset inside it. Files are
//! ordered by their numeric suffix (`mysql-bin.000010` follows
//! `mysql-bin.000009`), offsets within a file numerically.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A replication checkpoint: binlog file name plus offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub name: String,
    pub pos: u32,
}

impl Position {
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// True for the zero position a fresh engine starts from.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.pos == 0
    }

    /// A new position `delta` bytes further into the same file.
    pub fn advance(&self, delta: u32) -> Position {
        Position {
            name: self.name.clone(),
            pos: self.pos.saturating_add(delta),
        }
    }

    /// The same file at a different offset.
    pub fn with_offset(&self, pos: u32) -> Position {
        Position {
            name: self.name.clone(),
            pos,
        }
    }

    fn file_index(&self) -> Option<u64> {
        let (_, suffix) = self.name.rsplit_once('.')?;
        suffix.parse().ok()
    }

    fn compare_files(&self, other: &Position) -> Ordering {
        match (self.file_index(), other.file_index()) {
            (Some(a), Some(b)) if a != b => a.cmp(&b),
            _ => self.name.cmp(&other.name),
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare_files(other).then(self.pos.cmp(&other.pos))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, pos) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidPosition(s.to_string()))?;
        if name.is_empty() {
            return Err(Error::InvalidPosition(s.to_string()));
        }
        let pos = pos
            .parse()
            .map_err(|_| Error::InvalidPosition(s.to_string()))?;
        Ok(Position::new(name, pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_within_file() {
        let a = Position::new("mysql-bin.000003", 120);
        let b = Position::new("mysql-bin.000003", 4000);
        assert!(a < b);
        assert_eq!(a.cmp(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_ordering_across_files_uses_numeric_suffix() {
        let older = Position::new("mysql-bin.999999", 90_000);
        let newer = Position::new("mysql-bin.1000000", 4);
        assert!(older < newer);

        let a = Position::new("mysql-bin.000009", 500);
        let b = Position::new("mysql-bin.000010", 4);
        assert!(a < b);
    }

    #[test]
    fn test_empty_position_sorts_first() {
        let empty = Position::default();
        assert!(empty.is_empty());
        assert!(empty < Position::new("mysql-bin.000001", 4));
    }

    #[test]
    fn test_advance() {
        let p = Position::new("mysql-bin.000001", 4);
        let q = p.advance(150);
        assert_eq!(q, Position::new("mysql-bin.000001", 154));
        assert_eq!(p.pos, 4);
        assert!(q > p);
    }

    #[test]
    fn test_parse_and_display() {
        let p: Position = "mysql-bin.000042:1337".parse().unwrap();
        assert_eq!(p, Position::new("mysql-bin.000042", 1337));
        assert_eq!(p.to_string(), "mysql-bin.000042:1337");

        assert!("mysql-bin.000042".parse::<Position>().is_err());
        assert!(":15".parse::<Position>().is_err());
        assert!("mysql-bin.000001:abc".parse::<Position>().is_err());
    }
}
