//! Metadata schema for the soup store.
//!
//! Soup tables themselves are created on demand by `register_soup`; this
//! module owns the fixed tables that map soup names to those tables.

use rusqlite::{Connection, Result};

/// Current schema version for migration tracking.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// The fixed part of the store schema.
///
/// Timestamps are stored as INTEGER (Unix milliseconds).
pub const SCHEMA_SQL: &str = r"
-- ====================
-- Schema Version Tracking
-- ====================

CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at INTEGER NOT NULL
);

-- ====================
-- Index Catalog
-- ====================

-- One row per soup; the row id names the physical table (TABLE_<id>).
CREATE TABLE IF NOT EXISTS soup_names (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    soup_name TEXT NOT NULL UNIQUE
);

-- One row per declared index. column_name is either a physical column of
-- the soup table or, for json1 indices, a json_extract expression.
CREATE TABLE IF NOT EXISTS soup_index_map (
    soup_name TEXT NOT NULL,
    path TEXT NOT NULL,
    column_name TEXT NOT NULL,
    column_type TEXT NOT NULL,
    PRIMARY KEY (soup_name, path),
    FOREIGN KEY (soup_name) REFERENCES soup_names(soup_name) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_soup_index_map_soup ON soup_index_map(soup_name);
";

/// Apply the metadata schema to a database connection.
///
/// This is idempotent and safe to call on every open.
///
/// # Errors
///
/// Returns an error if the SQL execution fails or pragmas cannot be set.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![
            format!("v{CURRENT_SCHEMA_VERSION}"),
            chrono::Utc::now().timestamp_millis()
        ],
    )?;

    Ok(())
}

/// DDL for a soup table with the given index columns.
#[must_use]
pub fn soup_table_sql(table: &str, columns: &[(String, &str)]) -> String {
    let mut sql = format!(
        "CREATE TABLE {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    soup TEXT NOT NULL,
    created INTEGER NOT NULL,
    last_modified INTEGER NOT NULL"
    );
    for (name, kind) in columns {
        sql.push_str(&format!(",\n    {name} {kind}"));
    }
    sql.push_str("\n);\n");
    sql.push_str(&format!(
        "CREATE INDEX {table}_created_idx ON {table}(created);\n\
         CREATE INDEX {table}_last_modified_idx ON {table}(last_modified);\n"
    ));
    for (name, _) in columns {
        sql.push_str(&format!("CREATE INDEX {name}_idx ON {table}({name});\n"));
    }
    sql
}

/// Names of all columns of a table.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let sql = format!("SELECT name FROM pragma_table_info('{table}')");
    let mut stmt = conn.prepare(&sql)?;
    let columns = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>>>()?;
    Ok(columns)
}
