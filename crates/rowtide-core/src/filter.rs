//! Include/exclude table patterns.
//!
//! Patterns are regular expressions matched against `schema.table`. A match
//! is a search, not a full match, so anchor a pattern with `^`/`$` when a
//! prefix or suffix must not match. Exclusion always wins over inclusion, and
//! when include patterns are configured a table matching none of them is
//! treated as excluded.

use regex::Regex;

use crate::error::{Error, Result};

/// Compiled include/exclude rules. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TableFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// A filter that allows every table.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// True when `schema.table` may be dispatched.
    pub fn is_allowed(&self, schema: &str, table: &str) -> bool {
        !self.is_excluded(schema, table)
    }

    /// True when `schema.table` matches an exclude pattern, or include
    /// patterns exist and none matches.
    pub fn is_excluded(&self, schema: &str, table: &str) -> bool {
        let key = format!("{schema}.{table}");

        if self.exclude.iter().any(|re| re.is_match(&key)) {
            return true;
        }

        !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(&key))
    }

    pub fn has_rules(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }
}

fn compile<I>(patterns: I) -> Result<Vec<Regex>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|p| {
            let p = p.as_ref();
            Regex::new(p).map_err(|e| Error::InvalidPattern {
                pattern: p.to_string(),
                message: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canal_filter() -> TableFilter {
        TableFilter::new([r".*\.canal_test"], [r"mysql\..*", r".*\..*_inner"]).unwrap()
    }

    #[test]
    fn test_allow_all() {
        let filter = TableFilter::allow_all();
        assert!(filter.is_allowed("any", "thing"));
        assert!(!filter.has_rules());
    }

    #[test]
    fn test_include_and_exclude() {
        let filter = canal_filter();
        assert!(filter.is_allowed("test", "canal_test"));
        assert!(filter.is_allowed("not_exist_db", "canal_test"));
        assert!(filter.is_excluded("test", "canal_test_inner"));
        assert!(filter.is_excluded("mysql", "canal_test"));
        assert!(filter.is_excluded("not_exist_db", "not_canal_test"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let filter = TableFilter::new([r"^app\..*"], [r"^app\.secrets$"]).unwrap();
        assert!(filter.is_allowed("app", "users"));
        assert!(filter.is_excluded("app", "secrets"));
    }

    #[test]
    fn test_exclude_only() {
        let filter = TableFilter::new(Vec::<String>::new(), [r"^tmp\."]).unwrap();
        assert!(filter.is_allowed("app", "users"));
        assert!(filter.is_excluded("tmp", "scratch"));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = TableFilter::new(["(unclosed"], Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { ref pattern, .. } if pattern == "(unclosed"));
    }
}
