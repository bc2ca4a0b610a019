//! Document store core.
//!
//! `SmartStore` owns one SQLite connection behind a mutex and is shared as
//! `Arc<SmartStore>`. Every multi-statement write runs inside a savepoint via
//! [`SmartStore::mutate`], so it nests cleanly inside caller-level
//! transactions opened with [`SmartStore::begin_transaction`]. A caller-level
//! transaction belongs to the thread that opened it; other threads wait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::model::{IndexSpec, IndexSpecDiff, IndexType, QuerySpec, QueryType};
use crate::store::catalog::{self, json_extract_expr, IndexCatalog, SoupMapping};
use crate::store::schema::{apply_schema, soup_table_sql};
use crate::store::{
    now_millis, project, smart_sql, SOUP_CREATED_DATE, SOUP_ENTRY_ID, SOUP_LAST_MODIFIED_DATE,
};

/// Ids per `IN (...)` list, well under SQLite's bind-variable limit.
const ID_CHUNK: usize = 500;

#[derive(Debug)]
struct Inner {
    conn: Connection,
    /// Open caller-level savepoints.
    tx_depth: usize,
    /// Thread that opened the outermost caller-level savepoint.
    owner: Option<ThreadId>,
}

impl Inner {
    fn held_by_other(&self) -> bool {
        self.owner.is_some_and(|owner| owner != thread::current().id())
    }
}

/// SQLite-backed soup store.
#[derive(Debug)]
pub struct SmartStore {
    inner: Mutex<Inner>,
    /// Signalled when the outermost caller-level savepoint closes.
    released: Condvar,
    catalog: IndexCatalog,
    path: Option<PathBuf>,
}

impl SmartStore {
    /// Open a store at the given path, creating the file and schema if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open a store with an optional busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or schema fails.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(timeout_ms.unwrap_or(5000)))?;
        apply_schema(&conn)?;
        debug!(path = %path.display(), "Opened store");
        Ok(Self::from_connection(conn, Some(path.to_path_buf())))
    }

    /// Open an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                conn,
                tx_depth: 0,
                owner: None,
            }),
            released: Condvar::new(),
            catalog: IndexCatalog::new(),
            path,
        }
    }

    /// Database file, or `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Lock the connection. While another thread has a transaction open,
    /// this waits until that thread commits or rolls it back.
    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| Error::Other("store lock poisoned".to_string()))?;
        self.released
            .wait_while(guard, |inner| inner.held_by_other())
            .map_err(|_| Error::Other("store lock poisoned".to_string()))
    }

    /// Close the innermost scope, handing the connection back to other
    /// threads once the outermost one is closed.
    fn close_scope(&self, inner: &mut Inner) {
        inner.tx_depth -= 1;
        if inner.tx_depth == 0 {
            inner.owner = None;
            self.released.notify_all();
        }
    }

    /// Run a read against the connection.
    fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let inner = self.lock()?;
        f(&inner.conn)
    }

    /// Run a write inside a savepoint; rolled back if `f` fails.
    fn mutate<F, R>(&self, op: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let mut inner = self.lock()?;
        let sp = inner.conn.savepoint()?;
        let result = f(&sp)?;
        sp.commit()?;
        trace!(op, "Committed");
        Ok(result)
    }

    // ==================
    // Soup Operations
    // ==================

    /// Register a soup, or re-register it with a new index set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an empty name, an empty index
    /// set or duplicate paths.
    pub fn register_soup(&self, soup: &str, specs: &[IndexSpec]) -> Result<()> {
        validate_specs(soup, specs)?;
        if self.soup_exists(soup)? {
            return self.alter_soup(soup, specs, true);
        }

        self.mutate("register_soup", |conn| {
            let table = catalog::insert_soup(conn, soup)?;
            let assigned = assign_columns(&table, specs, 0);
            let columns: Vec<(String, &str)> = assigned
                .iter()
                .filter_map(|s| Some((s.column_name.clone()?, s.index_type.column_type()?)))
                .collect();
            conn.execute_batch(&soup_table_sql(&table, &columns))?;
            for spec in &assigned {
                catalog::insert_index(conn, soup, spec)?;
            }
            Ok(())
        })?;
        self.catalog.invalidate(soup);
        info!(soup, indices = specs.len(), "Registered soup");
        Ok(())
    }

    /// Change the index set of an existing soup.
    ///
    /// Unchanged indices keep their columns; removed ones leave the catalog;
    /// added ones get fresh columns, back-filled from every stored record
    /// when `reindex` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SoupNotFound`] if the soup is not registered.
    pub fn alter_soup(&self, soup: &str, specs: &[IndexSpec], reindex: bool) -> Result<()> {
        validate_specs(soup, specs)?;
        let added = self.mutate("alter_soup", |conn| {
            let mapping = self.catalog.require(conn, soup)?;
            let diff = IndexSpecDiff::compute(&mapping.specs, specs);
            if diff.is_empty() {
                return Ok(Vec::new());
            }
            let table = &mapping.table_name;

            for spec in &diff.removed {
                catalog::delete_index(conn, soup, &spec.path)?;
                if spec.index_type != IndexType::JsonRaw {
                    if let Some(column) = &spec.column_name {
                        conn.execute_batch(&format!("DROP INDEX IF EXISTS {column}_idx"))?;
                    }
                }
            }

            let start = catalog::next_column_suffix(conn, table)?;
            let assigned = assign_columns(table, &diff.added, start);
            for spec in &assigned {
                if let (Some(column), Some(kind)) = (&spec.column_name, spec.index_type.column_type())
                {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {table} ADD COLUMN {column} {kind};
                         CREATE INDEX {column}_idx ON {table}({column});"
                    ))?;
                }
                catalog::insert_index(conn, soup, spec)?;
            }
            debug!(
                soup,
                added = assigned.len(),
                removed = diff.removed.len(),
                "Altered soup"
            );
            Ok(assigned)
        })?;
        self.catalog.invalidate(soup);

        if reindex && !added.is_empty() {
            let paths: Vec<String> = added.into_iter().map(|s| s.path).collect();
            self.reindex_soup(soup, &paths)?;
        }
        Ok(())
    }

    /// Recompute the columns of `paths` from every stored record.
    ///
    /// Returns the number of records rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PathNotIndexed`] if a path is not declared.
    pub fn reindex_soup(&self, soup: &str, paths: &[String]) -> Result<usize> {
        self.mutate("reindex_soup", |conn| {
            let mapping = self.catalog.require(conn, soup)?;
            let mut specs = Vec::new();
            for path in paths {
                let spec = mapping.require_spec(path)?;
                if spec.index_type != IndexType::JsonRaw {
                    specs.push(spec);
                }
            }
            if specs.is_empty() {
                return Ok(0);
            }

            let table = &mapping.table_name;
            let mut select = conn.prepare(&format!("SELECT id, soup FROM {table}"))?;
            let rows = select
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let assignments = specs
                .iter()
                .filter_map(|s| s.column_name.as_deref())
                .map(|c| format!("{c} = ?"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut stmt = conn.prepare(&format!("UPDATE {table} SET {assignments} WHERE id = ?"))?;
            for (id, body) in &rows {
                let doc: Value = serde_json::from_str(body)?;
                let mut values: Vec<SqlValue> = specs
                    .iter()
                    .map(|s| index_value(s.index_type, &project(&doc, &s.path)))
                    .collect();
                values.push(SqlValue::Integer(*id));
                stmt.execute(params_from_iter(values))?;
            }
            info!(soup, records = rows.len(), "Reindexed soup");
            Ok(rows.len())
        })
    }

    /// Drop a soup: its table and its catalog entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SoupNotFound`] if the soup is not registered.
    pub fn drop_soup(&self, soup: &str) -> Result<()> {
        self.mutate("drop_soup", |conn| {
            let mapping = self.catalog.require(conn, soup)?;
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", mapping.table_name))?;
            catalog::delete_soup(conn, soup)
        })?;
        self.catalog.invalidate(soup);
        info!(soup, "Dropped soup");
        Ok(())
    }

    /// Drop every registered soup.
    ///
    /// # Errors
    ///
    /// Returns an error if any drop fails; soups dropped so far stay dropped.
    pub fn drop_all_soups(&self) -> Result<()> {
        for soup in self.soup_names()? {
            self.drop_soup(&soup)?;
        }
        self.catalog.clear();
        Ok(())
    }

    /// Remove every record of a soup, keeping its table and indices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SoupNotFound`] if the soup is not registered.
    pub fn clear_soup(&self, soup: &str) -> Result<usize> {
        self.mutate("clear_soup", |conn| {
            let mapping = self.catalog.require(conn, soup)?;
            Ok(conn.execute(&format!("DELETE FROM {}", mapping.table_name), [])?)
        })
    }

    /// Whether a soup is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn soup_exists(&self, soup: &str) -> Result<bool> {
        self.read(|conn| Ok(self.catalog.lookup(conn, soup)?.is_some()))
    }

    /// Names of all registered soups.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be read.
    pub fn soup_names(&self) -> Result<Vec<String>> {
        self.read(catalog::soup_names)
    }

    /// Declared indices of a soup, with their columns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SoupNotFound`] if the soup is not registered.
    pub fn index_specs(&self, soup: &str) -> Result<Vec<IndexSpec>> {
        Ok(self.mapping(soup)?.specs.clone())
    }

    /// Whether `path` is declared as an index of `soup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SoupNotFound`] if the soup is not registered.
    pub fn has_index_for_path(&self, soup: &str, path: &str) -> Result<bool> {
        Ok(self.mapping(soup)?.require_spec(path).is_ok())
    }

    fn mapping(&self, soup: &str) -> Result<std::sync::Arc<SoupMapping>> {
        self.read(|conn| self.catalog.require(conn, soup))
    }

    // ==================
    // Record Operations
    // ==================

    /// Insert a new record and return it with its managed fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `doc` is not a JSON object and
    /// [`Error::SoupNotFound`] if the soup is not registered.
    pub fn create(&self, soup: &str, doc: &Value) -> Result<Value> {
        let mut fields = as_object(doc)?.clone();
        self.mutate("create", |conn| {
            let mapping = self.catalog.require(conn, soup)?;
            let now = now_millis();
            fields.remove(SOUP_ENTRY_ID);
            fields.insert(SOUP_CREATED_DATE.to_string(), now.into());
            fields.insert(SOUP_LAST_MODIFIED_DATE.to_string(), now.into());
            let mut body = Value::Object(fields);

            let (columns, indexed) = projected_columns(&mapping, &body);
            let mut names = vec!["soup".to_string(), "created".into(), "last_modified".into()];
            names.extend(columns);
            let mut values = vec![
                SqlValue::Text(body.to_string()),
                SqlValue::Integer(now),
                SqlValue::Integer(now),
            ];
            values.extend(indexed);

            let table = &mapping.table_name;
            let placeholders = vec!["?"; names.len()].join(", ");
            conn.execute(
                &format!("INSERT INTO {table} ({}) VALUES ({placeholders})", names.join(", ")),
                params_from_iter(values),
            )?;
            let id = conn.last_insert_rowid();

            body[SOUP_ENTRY_ID] = id.into();
            conn.execute(
                &format!("UPDATE {table} SET soup = ?1 WHERE id = ?2"),
                rusqlite::params![body.to_string(), id],
            )?;
            trace!(soup, id, "Created record");
            Ok(body)
        })
    }

    /// Replace the record `entry_id` with `doc`.
    ///
    /// The stored creation time is kept whatever `doc` carries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntryNotFound`] if no record has that id.
    pub fn update(&self, soup: &str, doc: &Value, entry_id: i64) -> Result<Value> {
        let mut fields = as_object(doc)?.clone();
        self.mutate("update", |conn| {
            let mapping = self.catalog.require(conn, soup)?;
            let table = &mapping.table_name;
            let created: Option<i64> = conn
                .query_row(
                    &format!("SELECT created FROM {table} WHERE id = ?1"),
                    [entry_id],
                    |row| row.get(0),
                )
                .optional()?;
            let created = created.ok_or_else(|| Error::EntryNotFound {
                soup: soup.to_string(),
                id: entry_id,
            })?;

            let now = now_millis();
            fields.insert(SOUP_ENTRY_ID.to_string(), entry_id.into());
            fields.insert(SOUP_CREATED_DATE.to_string(), created.into());
            fields.insert(SOUP_LAST_MODIFIED_DATE.to_string(), now.into());
            let body = Value::Object(fields);

            let (columns, indexed) = projected_columns(&mapping, &body);
            let mut assignments = vec!["soup = ?".to_string(), "last_modified = ?".to_string()];
            assignments.extend(columns.iter().map(|c| format!("{c} = ?")));
            let mut values = vec![SqlValue::Text(body.to_string()), SqlValue::Integer(now)];
            values.extend(indexed);
            values.push(SqlValue::Integer(entry_id));

            conn.execute(
                &format!("UPDATE {table} SET {} WHERE id = ?", assignments.join(", ")),
                params_from_iter(values),
            )?;
            trace!(soup, id = entry_id, "Updated record");
            Ok(body)
        })
    }

    /// Update the record whose `_soupEntryId` is embedded in `doc`, or create one.
    ///
    /// # Errors
    ///
    /// See [`SmartStore::create`] and [`SmartStore::update`].
    pub fn upsert(&self, soup: &str, doc: &Value) -> Result<Value> {
        self.upsert_with_external_id(soup, doc, SOUP_ENTRY_ID)
    }

    /// Upsert keyed on the value at `path`.
    ///
    /// `path` must be an index of the soup, unless it is `_soupEntryId`.
    ///
    /// # Errors
    ///
    /// - [`Error::PathNotIndexed`] if `path` is not declared
    /// - [`Error::DuplicateExternalId`] if several records match
    pub fn upsert_with_external_id(&self, soup: &str, doc: &Value, path: &str) -> Result<Value> {
        as_object(doc)?;
        if path == SOUP_ENTRY_ID {
            return match doc.get(SOUP_ENTRY_ID).and_then(Value::as_i64) {
                Some(id) => self.update(soup, doc, id),
                None => self.create(soup, doc),
            };
        }

        self.in_transaction(|store| {
            let value = project(doc, path);
            let existing = if value.is_null() {
                store.mapping(soup)?.require_spec(path)?;
                None
            } else {
                store.lookup_entry_id(soup, path, &value)?
            };
            match existing {
                Some(id) => store.update(soup, doc, id),
                None => store.create(soup, doc),
            }
        })
    }

    /// Parse `raw` as JSON and upsert it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if `raw` is not valid JSON.
    pub fn upsert_json(&self, soup: &str, raw: &str, external_id_path: Option<&str>) -> Result<Value> {
        let doc: Value = serde_json::from_str(raw)?;
        self.upsert_with_external_id(soup, &doc, external_id_path.unwrap_or(SOUP_ENTRY_ID))
    }

    /// Entry id of the single record whose `path` equals `value`.
    ///
    /// # Errors
    ///
    /// - [`Error::PathNotIndexed`] if `path` is not declared
    /// - [`Error::DuplicateExternalId`] if several records match
    pub fn lookup_entry_id(&self, soup: &str, path: &str, value: &Value) -> Result<Option<i64>> {
        self.read(|conn| {
            let mapping = self.catalog.require(conn, soup)?;
            let spec = mapping.require_spec(path)?;
            let column = mapping
                .column_for_path(path)
                .ok_or_else(|| Error::PathNotIndexed {
                    soup: soup.to_string(),
                    path: path.to_string(),
                })?;
            let mut stmt = conn.prepare(&format!(
                "SELECT id FROM {} WHERE {column} = ?1 LIMIT 2",
                mapping.table_name
            ))?;
            let ids = stmt
                .query_map([index_value(spec.index_type, value)], |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            match ids.as_slice() {
                [] => Ok(None),
                [id] => Ok(Some(*id)),
                _ => Err(Error::DuplicateExternalId {
                    soup: soup.to_string(),
                    path: path.to_string(),
                    value: value.to_string(),
                }),
            }
        })
    }

    /// Fetch records by entry id, in the order requested. Unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SoupNotFound`] if the soup is not registered.
    pub fn retrieve(&self, soup: &str, ids: &[i64]) -> Result<Vec<Value>> {
        self.read(|conn| {
            let mapping = self.catalog.require(conn, soup)?;
            let mut found = HashMap::with_capacity(ids.len());
            for chunk in ids.chunks(ID_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                let mut stmt = conn.prepare(&format!(
                    "SELECT id, soup FROM {} WHERE id IN ({placeholders})",
                    mapping.table_name
                ))?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?;
                for row in rows {
                    let (id, body) = row?;
                    found.insert(id, serde_json::from_str::<Value>(&body)?);
                }
            }
            Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
        })
    }

    /// Delete records by entry id. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SoupNotFound`] if the soup is not registered.
    pub fn delete(&self, soup: &str, ids: &[i64]) -> Result<usize> {
        self.mutate("delete", |conn| {
            let mapping = self.catalog.require(conn, soup)?;
            let mut deleted = 0;
            for chunk in ids.chunks(ID_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(", ");
                deleted += conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE id IN ({placeholders})",
                        mapping.table_name
                    ),
                    params_from_iter(chunk.iter()),
                )?;
            }
            debug!(soup, deleted, "Deleted records");
            Ok(deleted)
        })
    }

    /// Delete every record matched by `spec`, ignoring paging.
    ///
    /// A smart spec must select `_soupEntryId`.
    ///
    /// # Errors
    ///
    /// Returns compile errors from the query and [`Error::SoupNotFound`].
    pub fn delete_by_query(&self, soup: &str, spec: &QuerySpec) -> Result<usize> {
        let (smart, args) = spec.to_id_smart_sql();
        self.mutate("delete_by_query", |conn| {
            let mapping = self.catalog.require(conn, soup)?;
            let args = self.bind_args(conn, spec, &args)?;
            let inner = smart_sql::compile(&self.catalog, conn, &smart)?;
            let deleted = conn.execute(
                &format!("DELETE FROM {} WHERE id IN ({inner})", mapping.table_name),
                params_from_iter(args),
            )?;
            debug!(soup, deleted, "Deleted records by query");
            Ok(deleted)
        })
    }

    // ==================
    // Queries
    // ==================

    /// Run `spec` and return page `page_index`.
    ///
    /// Non-smart specs yield documents. Smart specs yield one JSON array per
    /// row; a selected `soup` column is parsed back into a document.
    ///
    /// # Errors
    ///
    /// Returns compile errors from the query or database errors.
    pub fn query(&self, spec: &QuerySpec, page_index: usize) -> Result<Vec<Value>> {
        let (smart, args) = spec.to_smart_sql();
        let offset = spec.offset(page_index);
        self.read(|conn| {
            let args = self.bind_args(conn, spec, &args)?;
            let sql = smart_sql::compile(&self.catalog, conn, &smart)?;
            let sql = format!("{sql} LIMIT {} OFFSET {offset}", spec.page_size);
            trace!(sql = %sql, "Running query");

            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query(params_from_iter(args))?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                if spec.query_type == QueryType::Smart {
                    let mut cells = Vec::with_capacity(names.len());
                    for (i, name) in names.iter().enumerate() {
                        cells.push(cell_value(row.get_ref(i)?, name == "soup")?);
                    }
                    results.push(Value::Array(cells));
                } else {
                    let body: String = row.get(0)?;
                    results.push(serde_json::from_str(&body)?);
                }
            }
            Ok(results)
        })
    }

    /// Number of rows `spec` matches, ignoring paging.
    ///
    /// # Errors
    ///
    /// Returns compile errors from the query or database errors.
    pub fn count_query(&self, spec: &QuerySpec) -> Result<usize> {
        let (smart, args) = spec.to_smart_sql();
        self.read(|conn| {
            let args = self.bind_args(conn, spec, &args)?;
            let sql = smart_sql::compile(&self.catalog, conn, &smart)?;
            let count: i64 = conn.query_row(
                &format!("SELECT count(*) FROM ({sql})"),
                params_from_iter(args),
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    /// Convert query arguments to SQL values typed after the filtered index.
    fn bind_args(&self, conn: &Connection, spec: &QuerySpec, args: &[Value]) -> Result<Vec<SqlValue>> {
        let index_type = match (&spec.soup_name, &spec.path, spec.query_type) {
            (Some(soup), Some(path), QueryType::Exact | QueryType::Range | QueryType::Like) => {
                let mapping = self.catalog.require(conn, soup)?;
                mapping.require_spec(path).ok().map(|s| s.index_type)
            }
            _ => None,
        };
        Ok(args
            .iter()
            .map(|arg| match index_type {
                Some(kind) => index_value(kind, arg),
                None => bind_value(arg),
            })
            .collect())
    }

    // ==================
    // Transactions
    // ==================

    /// Open a (possibly nested) transaction scope.
    ///
    /// The scope belongs to the calling thread. Until its outermost scope is
    /// closed, every other thread's store call waits, so a rollback only ever
    /// undoes the owner's own writes. Scopes must be closed on the thread
    /// that opened them.
    ///
    /// # Errors
    ///
    /// Returns an error if the savepoint cannot be created.
    pub fn begin_transaction(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let depth = inner.tx_depth + 1;
        inner.conn.execute_batch(&format!("SAVEPOINT soup_tx_{depth}"))?;
        inner.tx_depth = depth;
        inner.owner = Some(thread::current().id());
        trace!(depth, "Began transaction");
        Ok(())
    }

    /// Commit the innermost open scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no scope is open.
    pub fn commit_transaction(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let depth = inner.tx_depth;
        if depth == 0 {
            return Err(Error::InvalidArgument("no open transaction".to_string()));
        }
        inner.conn.execute_batch(&format!("RELEASE soup_tx_{depth}"))?;
        self.close_scope(&mut inner);
        trace!(depth, "Committed transaction");
        Ok(())
    }

    /// Undo the innermost open scope and close it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no scope is open.
    pub fn rollback_transaction(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let depth = inner.tx_depth;
        if depth == 0 {
            return Err(Error::InvalidArgument("no open transaction".to_string()));
        }
        inner.conn.execute_batch(&format!(
            "ROLLBACK TO soup_tx_{depth}; RELEASE soup_tx_{depth}"
        ))?;
        self.close_scope(&mut inner);
        // Mappings read inside the scope may describe rolled-back soups.
        self.catalog.clear();
        trace!(depth, "Rolled back transaction");
        Ok(())
    }

    /// Run `f` in a transaction scope: committed on `Ok`, rolled back on `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or from opening/closing the scope.
    pub fn in_transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Self) -> Result<R>,
    {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback_transaction() {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

fn validate_specs(soup: &str, specs: &[IndexSpec]) -> Result<()> {
    if soup.trim().is_empty() {
        return Err(Error::InvalidArgument("soup name must not be empty".to_string()));
    }
    if specs.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "soup {soup} needs at least one index"
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        if spec.path.is_empty() {
            return Err(Error::InvalidArgument("index path must not be empty".to_string()));
        }
        if !seen.insert(spec.path.as_str()) {
            return Err(Error::InvalidArgument(format!(
                "index path {} declared twice",
                spec.path
            )));
        }
    }
    Ok(())
}

/// Give each spec its column: `TABLE_n_k` from `start`, or a json_extract
/// expression for json1 indices.
fn assign_columns(table: &str, specs: &[IndexSpec], start: usize) -> Vec<IndexSpec> {
    let mut next = start;
    specs
        .iter()
        .map(|spec| {
            let column = if spec.index_type == IndexType::JsonRaw {
                json_extract_expr(table, &spec.path)
            } else {
                let name = format!("{table}_{next}");
                next += 1;
                name
            };
            IndexSpec {
                column_name: Some(column),
                ..spec.clone()
            }
        })
        .collect()
}

fn as_object(doc: &Value) -> Result<&Map<String, Value>> {
    doc.as_object()
        .ok_or_else(|| Error::InvalidArgument("document must be a JSON object".to_string()))
}

/// Column names and projected values for every column-backed index.
fn projected_columns(mapping: &SoupMapping, body: &Value) -> (Vec<String>, Vec<SqlValue>) {
    mapping
        .column_specs()
        .filter_map(|spec| {
            let column = spec.column_name.clone()?;
            Some((column, index_value(spec.index_type, &project(body, &spec.path))))
        })
        .unzip()
}

/// SQL value stored in (or compared against) an index column.
pub(crate) fn index_value(kind: IndexType, value: &Value) -> SqlValue {
    match (kind, value) {
        (_, Value::Null) => SqlValue::Null,
        (IndexType::JsonRaw, v) => bind_value(v),
        (IndexType::String, Value::String(s)) => SqlValue::Text(s.clone()),
        (IndexType::String, other) => SqlValue::Text(other.to_string()),
        (IndexType::Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map_or(SqlValue::Null, SqlValue::Integer),
        (IndexType::Integer, Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
        (IndexType::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_or(SqlValue::Null, SqlValue::Integer),
        (IndexType::Floating, Value::Number(n)) => {
            n.as_f64().map_or(SqlValue::Null, SqlValue::Real)
        }
        (IndexType::Floating, Value::Bool(b)) => SqlValue::Real(if *b { 1.0 } else { 0.0 }),
        (IndexType::Floating, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_or(SqlValue::Null, SqlValue::Real),
        (IndexType::Integer | IndexType::Floating, _) => SqlValue::Null,
    }
}

/// SQL value for an untyped query argument.
pub(crate) fn bind_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn cell_value(cell: ValueRef<'_>, parse_body: bool) -> Result<Value> {
    Ok(match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => i.into(),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if parse_body {
                serde_json::from_str(&text)?
            } else {
                Value::String(text.into_owned())
            }
        }
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Order;
    use serde_json::json;

    fn store_with(soup: &str, specs: &[IndexSpec]) -> SmartStore {
        let store = SmartStore::open_memory().unwrap();
        store.register_soup(soup, specs).unwrap();
        store
    }

    fn strip_managed(mut doc: Value) -> Value {
        let obj = doc.as_object_mut().unwrap();
        obj.remove(SOUP_ENTRY_ID);
        obj.remove(SOUP_CREATED_DATE);
        obj.remove(SOUP_LAST_MODIFIED_DATE);
        doc
    }

    fn keys(docs: &[Value]) -> Vec<String> {
        docs.iter()
            .map(|d| d["key"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_create_retrieve_round_trip() {
        let store = store_with("s", &[IndexSpec::string("name")]);
        let doc = json!({"name": "Acme", "nested": {"n": 1}, "tags": ["a", "b"]});
        let created = store.create("s", &doc).unwrap();
        let id = created[SOUP_ENTRY_ID].as_i64().unwrap();

        let fetched = store.retrieve("s", &[id]).unwrap();
        assert_eq!(fetched.len(), 1);
        let fetched = &fetched[0];
        assert_eq!(fetched[SOUP_CREATED_DATE], fetched[SOUP_LAST_MODIFIED_DATE]);
        assert!(fetched[SOUP_CREATED_DATE].as_i64().unwrap() > 0);
        assert_eq!(strip_managed(fetched.clone()), doc);
    }

    #[test]
    fn test_entry_ids_increase() {
        let store = store_with("s", &[IndexSpec::string("name")]);
        let a = store.create("s", &json!({"name": "a"})).unwrap();
        let b = store.create("s", &json!({"name": "b"})).unwrap();
        assert!(b[SOUP_ENTRY_ID].as_i64() > a[SOUP_ENTRY_ID].as_i64());
    }

    #[test]
    fn test_update_keeps_created() {
        let store = store_with("s", &[IndexSpec::string("name")]);
        let created = store.create("s", &json!({"name": "a"})).unwrap();
        let id = created[SOUP_ENTRY_ID].as_i64().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let mut changed = created.clone();
        changed["name"] = json!("b");
        changed[SOUP_CREATED_DATE] = json!(1);
        let updated = store.update("s", &changed, id).unwrap();

        assert_eq!(updated[SOUP_CREATED_DATE], created[SOUP_CREATED_DATE]);
        assert!(
            updated[SOUP_LAST_MODIFIED_DATE].as_i64().unwrap()
                > created[SOUP_LAST_MODIFIED_DATE].as_i64().unwrap()
        );
        let found = store
            .query(&QuerySpec::exact("s", "name", "b", Order::Ascending, 10), 0)
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_update_unknown_entry() {
        let store = store_with("s", &[IndexSpec::string("name")]);
        let err = store.update("s", &json!({"name": "x"}), 42).unwrap_err();
        assert!(matches!(err, Error::EntryNotFound { id: 42, .. }));
    }

    #[test]
    fn test_unregistered_soup() {
        let store = SmartStore::open_memory().unwrap();
        assert!(matches!(
            store.create("nope", &json!({})),
            Err(Error::SoupNotFound { .. })
        ));
        assert!(matches!(
            store.query(&QuerySpec::all("nope", None, Order::Ascending, 10), 0),
            Err(Error::SoupNotFound { .. })
        ));
    }

    #[test]
    fn test_non_object_document() {
        let store = store_with("s", &[IndexSpec::string("name")]);
        assert!(matches!(
            store.create("s", &json!([1, 2])),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_upsert_json_parse_error() {
        let store = store_with("s", &[IndexSpec::string("name")]);
        let err = store.upsert_json("s", "{not json", None).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_upsert_by_entry_id() {
        let store = store_with("s", &[IndexSpec::string("name")]);
        let created = store.upsert("s", &json!({"name": "a"})).unwrap();
        let mut again = created.clone();
        again["name"] = json!("b");
        let updated = store.upsert("s", &again).unwrap();
        assert_eq!(updated[SOUP_ENTRY_ID], created[SOUP_ENTRY_ID]);
        let count = store
            .count_query(&QuerySpec::all("s", None, Order::Ascending, 10))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_upsert_with_external_id() {
        let store = store_with("s", &[IndexSpec::string("Id"), IndexSpec::string("name")]);

        let first = store
            .upsert_with_external_id("s", &json!({"Id": "001", "name": "a"}), "Id")
            .unwrap();
        let second = store
            .upsert_with_external_id("s", &json!({"Id": "001", "name": "b"}), "Id")
            .unwrap();
        assert_eq!(first[SOUP_ENTRY_ID], second[SOUP_ENTRY_ID]);
        assert_eq!(
            store
                .count_query(&QuerySpec::exact("s", "Id", "001", Order::Ascending, 10))
                .unwrap(),
            1
        );

        store.create("s", &json!({"Id": "001", "name": "dup"})).unwrap();
        let err = store
            .upsert_with_external_id("s", &json!({"Id": "001", "name": "c"}), "Id")
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateExternalId { .. }));
    }

    #[test]
    fn test_upsert_external_id_must_be_indexed() {
        let store = store_with("s", &[IndexSpec::string("name")]);
        let err = store
            .upsert_with_external_id("s", &json!({"Id": "1"}), "Id")
            .unwrap_err();
        assert!(matches!(err, Error::PathNotIndexed { .. }));
    }

    #[test]
    fn test_range_descending_scenario() {
        let store = store_with("s", &[IndexSpec::string("key")]);
        for key in ["a", "b", "c"] {
            store.create("s", &json!({ "key": key })).unwrap();
        }
        let spec = QuerySpec::range("s", "key", Some(json!("b")), Some(json!("c")), Order::Descending, 10);
        let results = store.query(&spec, 0).unwrap();
        assert_eq!(keys(&results), vec!["c", "b"]);
    }

    #[test]
    fn test_ascending_and_descending_are_reverses() {
        let store = store_with("s", &[IndexSpec::string("key")]);
        for key in ["m", "a", "z", "a", "k", "b"] {
            store.create("s", &json!({ "key": key })).unwrap();
        }

        let specs = [
            (
                QuerySpec::like("s", "key", "%", Order::Ascending, 50),
                QuerySpec::like("s", "key", "%", Order::Descending, 50),
            ),
            (
                QuerySpec::exact("s", "key", "a", Order::Ascending, 50),
                QuerySpec::exact("s", "key", "a", Order::Descending, 50),
            ),
            (
                QuerySpec::range("s", "key", Some(json!("b")), None, Order::Ascending, 50),
                QuerySpec::range("s", "key", Some(json!("b")), None, Order::Descending, 50),
            ),
        ];
        for (asc, desc) in specs {
            let up = store.query(&asc, 0).unwrap();
            let mut down = store.query(&desc, 0).unwrap();
            down.reverse();
            assert_eq!(up, down);
        }
    }

    #[test]
    fn test_paging_window() {
        let store = store_with("s", &[IndexSpec::integer("n")]);
        for n in 0..7 {
            store.create("s", &json!({ "n": n })).unwrap();
        }
        let spec = QuerySpec::all("s", Some("n"), Order::Ascending, 3);
        let page: Vec<i64> = store
            .query(&spec, 2)
            .unwrap()
            .iter()
            .map(|d| d["n"].as_i64().unwrap())
            .collect();
        assert_eq!(page, vec![6]);
        assert_eq!(store.count_query(&spec).unwrap(), 7);
    }

    #[test]
    fn test_smart_query_rows() {
        let store = store_with("s", &[IndexSpec::string("key"), IndexSpec::integer("n")]);
        store.create("s", &json!({"key": "a", "n": 1})).unwrap();
        store.create("s", &json!({"key": "b", "n": 2})).unwrap();

        let rows = store
            .query(
                &QuerySpec::smart(
                    "SELECT {s:key}, {s:_soup} FROM {s} WHERE {s:n} > 1",
                    10,
                ),
                0,
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], json!("b"));
        assert_eq!(rows[0][1]["n"], json!(2));

        let count = store
            .count_query(&QuerySpec::smart("SELECT count(*) FROM {s}", 10))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_index_projection_types() {
        let store = store_with(
            "s",
            &[
                IndexSpec::string("flag"),
                IndexSpec::integer("active"),
                IndexSpec::floating("amount"),
            ],
        );
        store
            .create("s", &json!({"flag": true, "active": true, "amount": 2}))
            .unwrap();

        let rows = store
            .query(&QuerySpec::smart("SELECT {s:flag}, {s:active}, {s:amount} FROM {s}", 10), 0)
            .unwrap();
        assert_eq!(rows[0], json!(["true", 1, 2.0]));
        assert_eq!(
            store
                .count_query(&QuerySpec::exact("s", "flag", true, Order::Ascending, 10))
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_json1_index() {
        let store = store_with("s", &[IndexSpec::json1("address.city")]);
        store.create("s", &json!({"address": {"city": "SF"}})).unwrap();
        store.create("s", &json!({"address": {"city": "NY"}})).unwrap();
        let found = store
            .query(&QuerySpec::exact("s", "address.city", "NY", Order::Ascending, 10), 0)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["address"]["city"], "NY");
    }

    #[test]
    fn test_alter_soup_backfills_new_index() {
        let store = store_with("s", &[IndexSpec::string("a")]);
        store.create("s", &json!({"a": "x", "b": "y"})).unwrap();

        store
            .register_soup("s", &[IndexSpec::string("a"), IndexSpec::string("b")])
            .unwrap();
        let specs = store.index_specs("s").unwrap();
        assert_eq!(specs[0].column_name.as_deref(), Some("TABLE_1_0"));
        assert_eq!(specs[1].column_name.as_deref(), Some("TABLE_1_1"));

        let found = store
            .query(&QuerySpec::exact("s", "b", "y", Order::Ascending, 10), 0)
            .unwrap();
        assert_eq!(found.len(), 1);

        // Dropping then re-adding never reuses a column suffix.
        store.register_soup("s", &[IndexSpec::string("b")]).unwrap();
        store
            .register_soup("s", &[IndexSpec::string("b"), IndexSpec::string("a")])
            .unwrap();
        let a = store
            .index_specs("s")
            .unwrap()
            .into_iter()
            .find(|s| s.path == "a")
            .unwrap();
        assert_eq!(a.column_name.as_deref(), Some("TABLE_1_2"));
        assert!(store.has_index_for_path("s", "a").unwrap());
    }

    #[test]
    fn test_delete_and_delete_by_query() {
        let store = store_with("s", &[IndexSpec::string("key")]);
        let mut ids = Vec::new();
        for key in ["a", "b", "c", "d"] {
            let doc = store.create("s", &json!({ "key": key })).unwrap();
            ids.push(doc[SOUP_ENTRY_ID].as_i64().unwrap());
        }
        assert_eq!(store.delete("s", &ids[..1]).unwrap(), 1);
        let spec = QuerySpec::range("s", "key", Some(json!("c")), None, Order::Ascending, 1);
        assert_eq!(store.delete_by_query("s", &spec).unwrap(), 2);
        let left = store
            .query(&QuerySpec::all("s", None, Order::Ascending, 10), 0)
            .unwrap();
        assert_eq!(keys(&left), vec!["b"]);
    }

    #[test]
    fn test_drop_soup() {
        let store = store_with("s", &[IndexSpec::string("key")]);
        store.register_soup("t", &[IndexSpec::string("key")]).unwrap();
        store.drop_soup("s").unwrap();
        assert!(!store.soup_exists("s").unwrap());
        assert_eq!(store.soup_names().unwrap(), vec!["t"]);
        store.drop_all_soups().unwrap();
        assert!(store.soup_names().unwrap().is_empty());
    }

    #[test]
    fn test_nested_transactions() {
        let store = store_with("s", &[IndexSpec::string("key")]);
        let all = QuerySpec::all("s", None, Order::Ascending, 10);

        store.begin_transaction().unwrap();
        store.create("s", &json!({"key": "outer"})).unwrap();
        let inner: Result<()> = store.in_transaction(|s| {
            s.create("s", &json!({"key": "inner"}))?;
            Err(Error::Other("abort".into()))
        });
        assert!(inner.is_err());
        assert_eq!(store.count_query(&all).unwrap(), 1);
        store.commit_transaction().unwrap();
        assert_eq!(keys(&store.query(&all, 0).unwrap()), vec!["outer"]);

        store.begin_transaction().unwrap();
        store.create("s", &json!({"key": "gone"})).unwrap();
        store.rollback_transaction().unwrap();
        assert_eq!(store.count_query(&all).unwrap(), 1);
        assert!(store.commit_transaction().is_err());
    }

    #[test]
    fn test_page_past_the_end_is_empty() {
        let store = store_with("s", &[IndexSpec::string("key")]);
        store.create("s", &json!({"key": "a"})).unwrap();
        let all = QuerySpec::all("s", None, Order::Ascending, 10);
        assert!(store.query(&all, usize::MAX).unwrap().is_empty());
        assert!(store.query(&all, 1).unwrap().is_empty());
    }

    #[test]
    fn test_rollback_leaves_other_threads_writes() {
        let store = std::sync::Arc::new(store_with("s", &[IndexSpec::string("Id")]));
        let all = QuerySpec::all("s", None, Order::Ascending, 10);

        store.begin_transaction().unwrap();
        let writer = {
            let store = std::sync::Arc::clone(&store);
            thread::spawn(move || store.upsert_with_external_id("s", &json!({"Id": "001"}), "Id"))
        };
        // The writer waits for the open scope.
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());
        store.rollback_transaction().unwrap();

        writer.join().unwrap().unwrap();
        let rows = store.query(&all, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Id"], "001");
    }

    #[test]
    fn test_interleaved_scopes_keep_committed_writes() {
        let store = std::sync::Arc::new(store_with("s", &[IndexSpec::string("key")]));
        let all = QuerySpec::all("s", None, Order::Ascending, 10);

        store.begin_transaction().unwrap();
        store.create("s", &json!({"key": "a"})).unwrap();
        let other = {
            let store = std::sync::Arc::clone(&store);
            thread::spawn(move || -> Result<()> {
                store.begin_transaction()?;
                store.create("s", &json!({"key": "b"}))?;
                store.rollback_transaction()
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!other.is_finished());
        store.commit_transaction().unwrap();

        other.join().unwrap().unwrap();
        assert_eq!(keys(&store.query(&all, 0).unwrap()), vec!["a"]);
    }

    #[test]
    fn test_concurrent_writers_during_open_scope() {
        let store = std::sync::Arc::new(store_with("s", &[IndexSpec::string("key")]));
        let all = QuerySpec::all("s", None, Order::Ascending, 100);

        let writers: Vec<_> = (0..4)
            .map(|n| {
                let store = std::sync::Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..10 {
                        let result: Result<Value> = store.in_transaction(|s| {
                            s.create("s", &json!({"key": format!("w{n}-{i}")}))
                        });
                        result.unwrap();
                    }
                })
            })
            .collect();

        store.begin_transaction().unwrap();
        store.create("s", &json!({"key": "discarded"})).unwrap();
        thread::sleep(Duration::from_millis(10));
        store.rollback_transaction().unwrap();

        for writer in writers {
            writer.join().unwrap();
        }
        let rows = keys(&store.query(&all, 0).unwrap());
        assert_eq!(rows.len(), 40);
        assert!(!rows.contains(&"discarded".to_string()));
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.db");
        {
            let store = SmartStore::open(&path).unwrap();
            store.register_soup("s", &[IndexSpec::string("key")]).unwrap();
            store.create("s", &json!({"key": "a"})).unwrap();
        }
        let store = SmartStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert_eq!(
            store
                .count_query(&QuerySpec::all("s", None, Order::Ascending, 10))
                .unwrap(),
            1
        );
    }
}
