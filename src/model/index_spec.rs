//! Index specifications for soups.
//!
//! An index spec declares that a JSON path inside every record of a soup is
//! projected into a physical column so it can be filtered and ordered on.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Declared type of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// Text column; non-string scalars are stored in their JSON text form.
    String,
    /// Integer column; booleans are stored as 0/1.
    Integer,
    /// Real column.
    Floating,
    /// No physical column: the path is read straight out of the body with
    /// `json_extract`.
    #[serde(rename = "json1")]
    JsonRaw,
}

impl IndexType {
    /// Get the string representation for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Floating => "floating",
            Self::JsonRaw => "json1",
        }
    }

    /// SQLite column affinity, or `None` for index types without a column.
    #[must_use]
    pub const fn column_type(&self) -> Option<&'static str> {
        match self {
            Self::String => Some("TEXT"),
            Self::Integer => Some("INTEGER"),
            Self::Floating => Some("REAL"),
            Self::JsonRaw => None,
        }
    }

    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "text" => Some(Self::String),
            "integer" | "int" => Some(Self::Integer),
            "floating" | "float" | "real" => Some(Self::Floating),
            "json1" | "json" | "json-raw" => Some(Self::JsonRaw),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A (path, type, column) triple for one soup index.
///
/// `column_name` is `None` on specs supplied by callers and filled in by the
/// store once the soup is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub path: String,
    #[serde(rename = "type")]
    pub index_type: IndexType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
}

impl IndexSpec {
    /// Create a spec that has not been assigned a column yet.
    pub fn new(path: impl Into<String>, index_type: IndexType) -> Self {
        Self {
            path: path.into(),
            index_type,
            column_name: None,
        }
    }

    /// Shorthand for a string index.
    pub fn string(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::String)
    }

    /// Shorthand for an integer index.
    pub fn integer(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Integer)
    }

    /// Shorthand for a floating index.
    pub fn floating(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::Floating)
    }

    /// Shorthand for a json1 index.
    pub fn json1(path: impl Into<String>) -> Self {
        Self::new(path, IndexType::JsonRaw)
    }

    /// Parse a `path:type` pair as accepted on the command line.
    ///
    /// A bare path defaults to a string index.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.rsplit_once(':') {
            Some((path, kind)) if !path.is_empty() => {
                IndexType::parse(kind).map(|t| Self::new(path, t))
            }
            Some(_) => None,
            None if !raw.is_empty() => Some(Self::string(raw)),
            None => None,
        }
    }

    /// Key identifying the declared index, ignoring the physical column.
    #[must_use]
    pub fn key(&self) -> (&str, IndexType) {
        (self.path.as_str(), self.index_type)
    }
}

/// Outcome of comparing an existing index set with a newly declared one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexSpecDiff {
    /// Declared now but not before: need a fresh column and a back-fill.
    pub added: Vec<IndexSpec>,
    /// Declared before but not now: dropped from the catalog.
    pub removed: Vec<IndexSpec>,
    /// Present in both: keep their existing columns.
    pub unchanged: Vec<IndexSpec>,
}

impl IndexSpecDiff {
    /// Compute the symmetric difference of `old` (as stored, with columns)
    /// against `new` (as declared) by path and type.
    #[must_use]
    pub fn compute(old: &[IndexSpec], new: &[IndexSpec]) -> Self {
        let new_keys: HashSet<_> = new.iter().map(IndexSpec::key).collect();
        let old_keys: HashSet<_> = old.iter().map(IndexSpec::key).collect();

        let mut diff = Self::default();
        for spec in old {
            if new_keys.contains(&spec.key()) {
                diff.unchanged.push(spec.clone());
            } else {
                diff.removed.push(spec.clone());
            }
        }
        for spec in new {
            if !old_keys.contains(&spec.key()) {
                diff.added.push(spec.clone());
            }
        }
        diff
    }

    /// Returns true if both sets declare the same indices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Returns true if any spec is a json1 index.
#[must_use]
pub fn has_json1(specs: &[IndexSpec]) -> bool {
    specs.iter().any(|s| s.index_type == IndexType::JsonRaw)
}

/// Find the spec declared for `path`, if any.
#[must_use]
pub fn spec_for_path<'a>(specs: &'a [IndexSpec], path: &str) -> Option<&'a IndexSpec> {
    specs.iter().find(|s| s.path == path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_form() {
        assert_eq!(IndexSpec::parse("Name"), Some(IndexSpec::string("Name")));
        assert_eq!(
            IndexSpec::parse("Amount:floating"),
            Some(IndexSpec::floating("Amount"))
        );
        assert_eq!(
            IndexSpec::parse("address.city:json1"),
            Some(IndexSpec::json1("address.city"))
        );
        assert_eq!(IndexSpec::parse("x:bogus"), None);
        assert_eq!(IndexSpec::parse(":string"), None);
    }

    #[test]
    fn test_diff_ignores_columns() {
        let mut stored = IndexSpec::string("Id");
        stored.column_name = Some("TABLE_1_0".into());
        let mut stored_name = IndexSpec::string("Name");
        stored_name.column_name = Some("TABLE_1_1".into());

        let declared = vec![IndexSpec::string("Id"), IndexSpec::integer("Name")];
        let diff = IndexSpecDiff::compute(&[stored.clone(), stored_name.clone()], &declared);

        assert_eq!(diff.unchanged, vec![stored]);
        assert_eq!(diff.removed, vec![stored_name]);
        assert_eq!(diff.added, vec![IndexSpec::integer("Name")]);
        assert!(!diff.is_empty());
    }

    #[test]
    fn test_diff_same_set_is_empty() {
        let specs = vec![IndexSpec::string("a"), IndexSpec::integer("b")];
        let reordered = vec![IndexSpec::integer("b"), IndexSpec::string("a")];
        assert!(IndexSpecDiff::compute(&specs, &reordered).is_empty());
    }

    #[test]
    fn test_serde_tags() {
        let json = serde_json::to_value(IndexSpec::json1("a.b")).unwrap();
        assert_eq!(json, serde_json::json!({"path": "a.b", "type": "json1"}));
    }
}
