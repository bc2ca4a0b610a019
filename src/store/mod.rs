//! Soup store: JSON documents in SQLite with declared indices.
//!
//! A soup is a named collection of JSON objects. Each soup is a table
//! `TABLE_<n>` holding the serialized body, the managed timestamps and one
//! column per declared index. The catalog tables map soup names and index
//! paths to those physical names.

pub mod catalog;
pub mod schema;
pub mod smart_sql;
pub mod smartstore;

pub use catalog::{IndexCatalog, SoupMapping};
pub use smartstore::SmartStore;

use serde_json::Value;

/// Managed field holding a record's local id.
pub const SOUP_ENTRY_ID: &str = "_soupEntryId";
/// Managed field holding the creation time (Unix ms).
pub const SOUP_CREATED_DATE: &str = "_soupCreatedDate";
/// Managed field holding the last write time (Unix ms).
pub const SOUP_LAST_MODIFIED_DATE: &str = "_soupLastModifiedDate";
/// Pseudo-path selecting the whole record body in logical queries.
pub const SOUP: &str = "_soup";

/// Extract the value at a dotted `path` from `doc`.
///
/// A null document yields null and an empty path yields the whole document.
/// Missing keys and scalars reached mid-path yield null. An array reached
/// mid-path maps the rest of the path over its elements.
#[must_use]
pub fn project(doc: &Value, path: &str) -> Value {
    if doc.is_null() {
        return Value::Null;
    }
    if path.is_empty() {
        return doc.clone();
    }
    let parts: Vec<&str> = path.split('.').collect();
    project_parts(doc, &parts)
}

fn project_parts(value: &Value, parts: &[&str]) -> Value {
    let Some((head, rest)) = parts.split_first() else {
        return value.clone();
    };
    match value {
        Value::Object(map) => map
            .get(*head)
            .map_or(Value::Null, |child| project_parts(child, rest)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| project_parts(item, parts))
                .collect(),
        ),
        _ => Value::Null,
    }
}

/// Current time in Unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_nested() {
        let doc = json!({"a": {"b": {"c": 3}}, "n": null});
        assert_eq!(project(&doc, "a.b.c"), json!(3));
        assert_eq!(project(&doc, "a.b"), json!({"c": 3}));
        assert_eq!(project(&doc, "a.x.c"), Value::Null);
        assert_eq!(project(&doc, "n.c"), Value::Null);
        assert_eq!(project(&doc, ""), doc);
        assert_eq!(project(&Value::Null, "a"), Value::Null);
    }

    #[test]
    fn test_project_through_array() {
        let doc = json!({"contacts": [{"name": "x"}, {"name": "y"}, {}]});
        assert_eq!(project(&doc, "contacts.name"), json!(["x", "y", null]));
    }
}
