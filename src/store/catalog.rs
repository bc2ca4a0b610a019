//! Index catalog: soup name to physical table and index columns.
//!
//! The catalog is persisted in `soup_names` / `soup_index_map` and cached in
//! memory. Every write path that changes a soup's shape must call
//! [`IndexCatalog::invalidate`] so the cache never serves a stale mapping.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::model::index_spec::spec_for_path;
use crate::model::{IndexSpec, IndexType};
use crate::store::schema::table_columns;
use crate::store::{SOUP, SOUP_CREATED_DATE, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE};

/// Resolved shape of one soup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoupMapping {
    pub soup_name: String,
    pub table_name: String,
    /// Declared indices with their assigned columns.
    pub specs: Vec<IndexSpec>,
}

impl SoupMapping {
    /// SQL expression for a path, qualified by the table name.
    ///
    /// Managed fields map to the fixed columns; `_soup` maps to the body.
    /// Returns `None` when the path is neither managed nor indexed.
    #[must_use]
    pub fn column_for_path(&self, path: &str) -> Option<String> {
        let table = &self.table_name;
        match path {
            SOUP => Some(format!("{table}.soup")),
            SOUP_ENTRY_ID => Some(format!("{table}.id")),
            SOUP_LAST_MODIFIED_DATE => Some(format!("{table}.last_modified")),
            SOUP_CREATED_DATE => Some(format!("{table}.created")),
            _ => {
                let spec = spec_for_path(&self.specs, path)?;
                let column = spec.column_name.as_deref()?;
                if spec.index_type == IndexType::JsonRaw {
                    Some(column.to_string())
                } else {
                    Some(format!("{table}.{column}"))
                }
            }
        }
    }

    /// The declared spec for `path`, or [`Error::PathNotIndexed`].
    pub fn require_spec(&self, path: &str) -> Result<&IndexSpec> {
        spec_for_path(&self.specs, path).ok_or_else(|| Error::PathNotIndexed {
            soup: self.soup_name.clone(),
            path: path.to_string(),
        })
    }

    /// Specs that own a physical column.
    pub fn column_specs(&self) -> impl Iterator<Item = &IndexSpec> {
        self.specs
            .iter()
            .filter(|s| s.index_type != IndexType::JsonRaw && s.column_name.is_some())
    }
}

/// json_extract expression for a json1 index on `table`.
#[must_use]
pub fn json_extract_expr(table: &str, path: &str) -> String {
    format!("json_extract({table}.soup, '$.{}')", path.replace('\'', "''"))
}

/// Cached view of the persisted catalog.
#[derive(Debug, Default)]
pub struct IndexCatalog {
    cache: RwLock<HashMap<String, Arc<SoupMapping>>>,
}

impl IndexCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a soup, consulting the cache first.
    pub fn lookup(&self, conn: &Connection, soup: &str) -> Result<Option<Arc<SoupMapping>>> {
        if let Ok(cache) = self.cache.read() {
            if let Some(mapping) = cache.get(soup) {
                return Ok(Some(Arc::clone(mapping)));
            }
        }

        let Some(mapping) = load_mapping(conn, soup)? else {
            return Ok(None);
        };
        let mapping = Arc::new(mapping);
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(soup.to_string(), Arc::clone(&mapping));
        }
        Ok(Some(mapping))
    }

    /// Like [`IndexCatalog::lookup`] but a missing soup is an error.
    pub fn require(&self, conn: &Connection, soup: &str) -> Result<Arc<SoupMapping>> {
        self.lookup(conn, soup)?.ok_or_else(|| Error::SoupNotFound {
            soup: soup.to_string(),
        })
    }

    /// Forget the cached mapping for one soup.
    pub fn invalidate(&self, soup: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(soup);
        }
    }

    /// Forget every cached mapping.
    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }
}

fn load_mapping(conn: &Connection, soup: &str) -> Result<Option<SoupMapping>> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM soup_names WHERE soup_name = ?1",
            [soup],
            |row| row.get(0),
        )
        .optional()?;
    let Some(id) = id else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT path, column_name, column_type FROM soup_index_map
         WHERE soup_name = ?1 ORDER BY rowid",
    )?;
    let specs = stmt
        .query_map([soup], |row| {
            let path: String = row.get(0)?;
            let column: String = row.get(1)?;
            let kind: String = row.get(2)?;
            Ok((path, column, kind))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(path, column, kind)| {
            let index_type = IndexType::parse(&kind)
                .ok_or_else(|| Error::Other(format!("corrupt index type '{kind}' on {soup}")))?;
            Ok(IndexSpec {
                path,
                index_type,
                column_name: Some(column),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(SoupMapping {
        soup_name: soup.to_string(),
        table_name: table_name(id),
        specs,
    }))
}

/// Physical table name for a soup id.
#[must_use]
pub fn table_name(id: i64) -> String {
    format!("TABLE_{id}")
}

/// Names of every registered soup, sorted.
pub fn soup_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT soup_name FROM soup_names ORDER BY soup_name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Insert a soup row and return its table name.
pub fn insert_soup(conn: &Connection, soup: &str) -> Result<String> {
    conn.execute("INSERT INTO soup_names (soup_name) VALUES (?1)", [soup])?;
    Ok(table_name(conn.last_insert_rowid()))
}

/// Persist one index of a soup. `spec.column_name` must already be set.
pub fn insert_index(conn: &Connection, soup: &str, spec: &IndexSpec) -> Result<()> {
    let column = spec
        .column_name
        .as_deref()
        .ok_or_else(|| Error::Other(format!("index {} has no column", spec.path)))?;
    conn.execute(
        "INSERT INTO soup_index_map (soup_name, path, column_name, column_type)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![soup, spec.path, column, spec.index_type.as_str()],
    )?;
    Ok(())
}

/// Remove one index of a soup from the catalog.
pub fn delete_index(conn: &Connection, soup: &str, path: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM soup_index_map WHERE soup_name = ?1 AND path = ?2",
        [soup, path],
    )?;
    Ok(())
}

/// Remove a soup and all its indices from the catalog.
pub fn delete_soup(conn: &Connection, soup: &str) -> Result<()> {
    conn.execute("DELETE FROM soup_index_map WHERE soup_name = ?1", [soup])?;
    conn.execute("DELETE FROM soup_names WHERE soup_name = ?1", [soup])?;
    Ok(())
}

/// Next free column suffix for `table`.
///
/// Suffixes are never reused, even after an index is dropped, so this reads
/// the physical columns rather than the catalog.
pub fn next_column_suffix(conn: &Connection, table: &str) -> Result<usize> {
    let prefix = format!("{table}_");
    let next = table_columns(conn, table)?
        .iter()
        .filter_map(|c| c.strip_prefix(&prefix)?.parse::<usize>().ok())
        .max()
        .map_or(0, |k| k + 1);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::apply_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_lookup_caches_until_invalidated() {
        let conn = setup();
        let catalog = IndexCatalog::new();
        assert!(catalog.lookup(&conn, "accounts").unwrap().is_none());

        let table = insert_soup(&conn, "accounts").unwrap();
        let mut spec = IndexSpec::string("Name");
        spec.column_name = Some(format!("{table}_0"));
        insert_index(&conn, "accounts", &spec).unwrap();

        let mapping = catalog.require(&conn, "accounts").unwrap();
        assert_eq!(mapping.table_name, "TABLE_1");
        assert_eq!(mapping.specs, vec![spec]);

        delete_index(&conn, "accounts", "Name").unwrap();
        // Still cached.
        assert_eq!(catalog.require(&conn, "accounts").unwrap().specs.len(), 1);
        catalog.invalidate("accounts");
        assert!(catalog.require(&conn, "accounts").unwrap().specs.is_empty());
    }

    #[test]
    fn test_require_missing_soup() {
        let conn = setup();
        let err = IndexCatalog::new().require(&conn, "nope").unwrap_err();
        assert!(matches!(err, Error::SoupNotFound { .. }));
    }

    #[test]
    fn test_column_for_path() {
        let mut name = IndexSpec::string("Name");
        name.column_name = Some("TABLE_3_0".into());
        let mut city = IndexSpec::json1("address.city");
        city.column_name = Some(json_extract_expr("TABLE_3", "address.city"));
        let mapping = SoupMapping {
            soup_name: "s".into(),
            table_name: "TABLE_3".into(),
            specs: vec![name, city],
        };

        assert_eq!(mapping.column_for_path("_soup").unwrap(), "TABLE_3.soup");
        assert_eq!(mapping.column_for_path("_soupEntryId").unwrap(), "TABLE_3.id");
        assert_eq!(
            mapping.column_for_path("_soupLastModifiedDate").unwrap(),
            "TABLE_3.last_modified"
        );
        assert_eq!(mapping.column_for_path("Name").unwrap(), "TABLE_3.TABLE_3_0");
        assert_eq!(
            mapping.column_for_path("address.city").unwrap(),
            "json_extract(TABLE_3.soup, '$.address.city')"
        );
        assert!(mapping.column_for_path("Other").is_none());
        assert_eq!(mapping.column_specs().count(), 1);
    }

    #[test]
    fn test_next_column_suffix_skips_dropped() {
        let conn = setup();
        conn.execute_batch(
            "CREATE TABLE TABLE_1 (id INTEGER PRIMARY KEY, soup TEXT, TABLE_1_0 TEXT, TABLE_1_4 TEXT)",
        )
        .unwrap();
        assert_eq!(next_column_suffix(&conn, "TABLE_1").unwrap(), 5);
    }
}
