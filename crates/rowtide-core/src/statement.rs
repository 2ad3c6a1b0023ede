//! SQL statement normalization and DDL detection for query events.

use serde::{Deserialize, Serialize};

use crate::schema::TableRef;

/// Remove comments and collapse whitespace, keeping the original case.
///
/// Block comments (`/* */`), line comments (`--`, `#`) and any run of
/// spaces, tabs, carriage returns or newlines become a single space. Quoted
/// strings and identifiers are copied verbatim.
pub fn strip_statement(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                pending_space = true;
            }
            '-' if chars.peek() == Some(&'-') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            c if c.is_whitespace() => pending_space = true,
            '\'' | '"' | '`' => {
                push_pending(&mut out, &mut pending_space);
                out.push(c);
                let quote = c;
                while let Some(q) = chars.next() {
                    out.push(q);
                    if q == '\\' && quote != '`' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if q == quote {
                        break;
                    }
                }
            }
            c => {
                push_pending(&mut out, &mut pending_space);
                out.push(c);
            }
        }
    }

    out
}

fn push_pending(out: &mut String, pending_space: &mut bool) {
    if *pending_space && !out.is_empty() {
        out.push(' ');
    }
    *pending_space = false;
}

/// Canonical upper-cased form of a statement used for keyword matching.
///
/// `"/*hint*/ drop   table \ntest1"` becomes `"DROP TABLE TEST1"`.
pub fn trim_statement(query: &str) -> String {
    strip_statement(query).to_uppercase()
}

/// The schema-altering statements that invalidate cached table metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DdlKind {
    CreateTable,
    AlterTable,
    DropTable,
    RenameTable,
    TruncateTable,
    CreateIndex,
    DropIndex,
}

/// A recognized DDL statement and the tables it touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdlStatement {
    pub kind: DdlKind,
    pub tables: Vec<TableRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Ident(String),
    Dot,
    Comma,
    Other,
}

fn tokenize(statement: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = statement.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '`' => {
                chars.next();
                let mut ident = String::new();
                while let Some(c) = chars.next() {
                    if c == '`' {
                        if chars.peek() == Some(&'`') {
                            chars.next();
                            ident.push('`');
                        } else {
                            break;
                        }
                    } else {
                        ident.push(c);
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            '\'' | '"' => {
                chars.next();
                while let Some(q) = chars.next() {
                    if q == '\\' {
                        chars.next();
                    } else if q == c {
                        break;
                    }
                }
                tokens.push(Token::Other);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_word_char(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
            _ => {
                chars.next();
                tokens.push(Token::Other);
            }
        }
    }

    tokens
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct Parser<'a> {
    tokens: Vec<Token>,
    idx: usize,
    default_schema: &'a str,
}

impl<'a> Parser<'a> {
    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.idx), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn keywords(&mut self, keywords: &[&str]) -> bool {
        let start = self.idx;
        for kw in keywords {
            if !self.keyword(kw) {
                self.idx = start;
                return false;
            }
        }
        true
    }

    fn punct(&mut self, token: Token) -> bool {
        if self.tokens.get(self.idx) == Some(&token) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Option<String> {
        match self.tokens.get(self.idx)? {
            Token::Word(w) | Token::Ident(w) => {
                let w = w.clone();
                self.idx += 1;
                Some(w)
            }
            _ => None,
        }
    }

    fn table(&mut self) -> Option<TableRef> {
        let first = self.ident()?;
        if self.punct(Token::Dot) {
            let second = self.ident()?;
            Some(TableRef::new(first, second))
        } else {
            Some(TableRef::new(self.default_schema, first))
        }
    }

    fn table_list(&mut self) -> Vec<TableRef> {
        let mut tables = Vec::new();
        while let Some(t) = self.table() {
            tables.push(t);
            if !self.punct(Token::Comma) {
                break;
            }
        }
        tables
    }

    /// `... ON <table>`, skipping the index name.
    fn index_target(&mut self) -> Option<TableRef> {
        self.ident()?;
        if !self.keyword("ON") {
            return None;
        }
        self.table()
    }

    fn parse(&mut self) -> Option<DdlStatement> {
        if self.keyword("CREATE") {
            self.keyword("TEMPORARY");
            if self.keyword("TABLE") {
                self.keywords(&["IF", "NOT", "EXISTS"]);
                return self.single(DdlKind::CreateTable);
            }
            let _ = self.keyword("UNIQUE") || self.keyword("FULLTEXT") || self.keyword("SPATIAL");
            if self.keyword("INDEX") {
                let table = self.index_target()?;
                return Some(DdlStatement {
                    kind: DdlKind::CreateIndex,
                    tables: vec![table],
                });
            }
            return None;
        }

        if self.keyword("ALTER") {
            let _ = self.keyword("ONLINE") || self.keyword("OFFLINE");
            self.keyword("IGNORE");
            if self.keyword("TABLE") {
                return self.single(DdlKind::AlterTable);
            }
            return None;
        }

        if self.keyword("DROP") {
            self.keyword("TEMPORARY");
            if self.keyword("TABLE") {
                self.keywords(&["IF", "EXISTS"]);
                let tables = self.table_list();
                return (!tables.is_empty()).then_some(DdlStatement {
                    kind: DdlKind::DropTable,
                    tables,
                });
            }
            if self.keyword("INDEX") {
                let table = self.index_target()?;
                return Some(DdlStatement {
                    kind: DdlKind::DropIndex,
                    tables: vec![table],
                });
            }
            return None;
        }

        if self.keywords(&["RENAME", "TABLE"]) {
            let mut tables = Vec::new();
            loop {
                let from = self.table()?;
                if !self.keyword("TO") {
                    return None;
                }
                let to = self.table()?;
                tables.push(from);
                tables.push(to);
                if !self.punct(Token::Comma) {
                    break;
                }
            }
            return Some(DdlStatement {
                kind: DdlKind::RenameTable,
                tables,
            });
        }

        if self.keyword("TRUNCATE") {
            self.keyword("TABLE");
            return self.single(DdlKind::TruncateTable);
        }

        None
    }

    fn single(&mut self, kind: DdlKind) -> Option<DdlStatement> {
        let table = self.table()?;
        Some(DdlStatement {
            kind,
            tables: vec![table],
        })
    }
}

/// Recognize a table DDL statement and extract the tables it names.
///
/// Unqualified names resolve against `default_schema`, the database the
/// statement was executed in. Identifier case is preserved.
pub fn parse_ddl(query: &str, default_schema: &str) -> Option<DdlStatement> {
    let stripped = strip_statement(query);
    let mut parser = Parser {
        tokens: tokenize(&stripped),
        idx: 0,
        default_schema,
    };
    parser.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_statement() {
        let cases = [
            "   drop    table test1",
            "DROP\r\nTABLE test1",
            "--comment \nDROP TABLE test1",
            "#comment \nDROP TABLE test1",
            "/*hint*/ DROP   /*com\nment*/   TABLE \ntest1",
        ];

        for case in cases {
            assert_eq!(trim_statement(case), "DROP TABLE TEST1", "case {case:?}");
        }
    }

    #[test]
    fn test_trim_statement_idempotent() {
        let once = trim_statement("/* x */ alter  table `t`\n add column c int -- tail");
        assert_eq!(once, "ALTER TABLE `T` ADD COLUMN C INT");
        assert_eq!(trim_statement(&once), once);
    }

    #[test]
    fn test_strip_keeps_quoted_text() {
        assert_eq!(
            strip_statement("INSERT INTO t VALUES ('a  -- b', \"# c\")"),
            "INSERT INTO t VALUES ('a  -- b', \"# c\")"
        );
        assert_eq!(strip_statement("select 'it\\'s'  /* c */ "), "select 'it\\'s'");
    }

    #[test]
    fn test_parse_alter_table() {
        let ddl = parse_ddl("ALTER TABLE test.canal_test ADD `age` INT", "other").unwrap();
        assert_eq!(ddl.kind, DdlKind::AlterTable);
        assert_eq!(ddl.tables, vec![TableRef::new("test", "canal_test")]);

        let ddl = parse_ddl("/* gh-ost */ alter table `My_Table` add index (a)", "app").unwrap();
        assert_eq!(ddl.tables, vec![TableRef::new("app", "My_Table")]);
    }

    #[test]
    fn test_parse_create_and_drop() {
        let ddl = parse_ddl(
            "CREATE TABLE IF NOT EXISTS `test`.`canal_test` (id int)",
            "",
        )
        .unwrap();
        assert_eq!(ddl.kind, DdlKind::CreateTable);
        assert_eq!(ddl.tables, vec![TableRef::new("test", "canal_test")]);

        let ddl = parse_ddl("DROP TABLE IF EXISTS a, `b`.c /* generated by server */", "db")
            .unwrap();
        assert_eq!(ddl.kind, DdlKind::DropTable);
        assert_eq!(
            ddl.tables,
            vec![TableRef::new("db", "a"), TableRef::new("b", "c")]
        );
    }

    #[test]
    fn test_parse_rename_table() {
        let ddl = parse_ddl("RENAME TABLE a TO a_old, db2.b TO db2.a", "db").unwrap();
        assert_eq!(ddl.kind, DdlKind::RenameTable);
        assert_eq!(
            ddl.tables,
            vec![
                TableRef::new("db", "a"),
                TableRef::new("db", "a_old"),
                TableRef::new("db2", "b"),
                TableRef::new("db2", "a"),
            ]
        );
    }

    #[test]
    fn test_parse_truncate_and_index() {
        let ddl = parse_ddl("truncate t1", "db").unwrap();
        assert_eq!(ddl.kind, DdlKind::TruncateTable);
        assert_eq!(ddl.tables, vec![TableRef::new("db", "t1")]);

        let ddl = parse_ddl("CREATE UNIQUE INDEX idx_a ON db.t (a)", "x").unwrap();
        assert_eq!(ddl.kind, DdlKind::CreateIndex);
        assert_eq!(ddl.tables, vec![TableRef::new("db", "t")]);

        let ddl = parse_ddl("DROP INDEX idx_a ON t", "db").unwrap();
        assert_eq!(ddl.kind, DdlKind::DropIndex);
    }

    #[test]
    fn test_non_ddl_statements() {
        assert!(parse_ddl("BEGIN", "db").is_none());
        assert!(parse_ddl("COMMIT", "db").is_none());
        assert!(parse_ddl("INSERT INTO t VALUES (1)", "db").is_none());
        assert!(parse_ddl("CREATE DATABASE foo", "db").is_none());
        assert!(parse_ddl("DROP VIEW v", "db").is_none());
    }
}
