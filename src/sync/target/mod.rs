//! Target strategies.
//!
//! A target says how one sync talks to the remote collection and how it
//! reads and writes the local soup. Targets are closed enums tagged by
//! `type` in the persisted descriptor; `custom` targets dispatch to handlers
//! registered in a [`TargetRegistry`] under their `customType`.
//!
//! Synced soups must index the id field (`Id` by default) and `__local__`.
//! Indexing `__sync_id__` scopes ghost cleanup to the records of one sync.

pub mod batch;
pub mod custom;
pub mod mru;
pub mod parent_children;
pub mod refresh;
pub mod soql;
pub mod up;

pub use batch::BatchSyncUpTarget;
pub use custom::{
    CustomSyncDownHandler, CustomSyncDownTarget, CustomSyncUpHandler, CustomSyncUpTarget,
    TargetRegistry,
};
pub use mru::MruSyncDownTarget;
pub use parent_children::{
    ChildrenInfo, ParentChildrenSyncDownTarget, ParentChildrenSyncUpTarget, ParentInfo,
    RelationshipType,
};
pub use refresh::RefreshSyncDownTarget;
pub use soql::SoqlSyncDownTarget;
pub use up::StandardSyncUpTarget;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::model::{MergeMode, QuerySpec, SyncOptions, UNKNOWN_TIME_STAMP};
use crate::store::{SmartStore, SOUP_ENTRY_ID};
use crate::sync::rest::RestResponse;
use crate::sync::{is_dirty, mark_clean, SyncContext, LOCAL, SYNC_ID};

/// Default server id field.
pub const DEFAULT_ID_FIELD: &str = "Id";
/// Default server modification-date field.
pub const DEFAULT_MODIFICATION_DATE_FIELD: &str = "LastModifiedDate";

/// Rows per page when scanning local soups.
const LOCAL_PAGE_SIZE: usize = 2000;
/// Ids per `IN (...)` list against the local store.
const LOCAL_ID_CHUNK: usize = 500;

fn default_id_field() -> String {
    DEFAULT_ID_FIELD.to_string()
}

fn default_modification_date_field() -> String {
    DEFAULT_MODIFICATION_DATE_FIELD.to_string()
}

/// Field names every target carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFields {
    #[serde(default = "default_id_field")]
    pub id_field_name: String,
    #[serde(default = "default_modification_date_field")]
    pub modification_date_field_name: String,
}

impl Default for TargetFields {
    fn default() -> Self {
        Self {
            id_field_name: default_id_field(),
            modification_date_field_name: default_modification_date_field(),
        }
    }
}

// ==================
// Sync down
// ==================

/// Strategy for a sync down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncDownTarget {
    Soql(SoqlSyncDownTarget),
    Mru(MruSyncDownTarget),
    Refresh(RefreshSyncDownTarget),
    ParentChildren(ParentChildrenSyncDownTarget),
    Custom(CustomSyncDownTarget),
}

impl SyncDownTarget {
    #[must_use]
    pub fn fields(&self) -> &TargetFields {
        match self {
            Self::Soql(t) => &t.fields,
            Self::Mru(t) => &t.fields,
            Self::Refresh(t) => &t.fields,
            Self::ParentChildren(t) => &t.parent.fields,
            Self::Custom(t) => &t.fields,
        }
    }

    /// Begin a paginated read of records modified after `max_time_stamp`
    /// (all records when it is not positive).
    pub fn start_fetch(
        &mut self,
        ctx: &SyncContext<'_>,
        soup: &str,
        max_time_stamp: i64,
    ) -> Result<Vec<Value>> {
        match self {
            Self::Soql(t) => t.start_fetch(ctx, max_time_stamp),
            Self::Mru(t) => t.start_fetch(ctx),
            Self::Refresh(t) => t.start_fetch(ctx, soup, max_time_stamp),
            Self::ParentChildren(t) => t.start_fetch(ctx, max_time_stamp),
            Self::Custom(t) => ctx
                .registry
                .down_handler(&t.custom_type)?
                .start_fetch(ctx, t, max_time_stamp),
        }
    }

    /// Next page, or `None` once the read is exhausted.
    pub fn continue_fetch(&mut self, ctx: &SyncContext<'_>, soup: &str) -> Result<Option<Vec<Value>>> {
        match self {
            Self::Soql(t) => t.continue_fetch(ctx),
            Self::Mru(_) => Ok(None),
            Self::Refresh(t) => t.continue_fetch(ctx, soup),
            Self::ParentChildren(t) => t.continue_fetch(ctx),
            Self::Custom(t) => ctx.registry.down_handler(&t.custom_type)?.continue_fetch(ctx, t),
        }
    }

    /// Records the current read will return, or -1 if unknown.
    #[must_use]
    pub fn total_size(&self) -> i64 {
        match self {
            Self::Soql(t) => t.total_size,
            Self::Mru(t) => t.total_size,
            Self::Refresh(t) => t.total_size,
            Self::ParentChildren(t) => t.total_size,
            Self::Custom(t) => t.total_size,
        }
    }

    /// Whether pages arrive in ascending modification-date order, which
    /// lets the high-water mark advance after every page.
    pub fn is_sorted_by_latest_modification(&self, ctx: &SyncContext<'_>) -> Result<bool> {
        Ok(match self {
            Self::Soql(t) => t.is_sorted_by_latest_modification(),
            Self::Mru(_) | Self::Refresh(_) | Self::ParentChildren(_) => false,
            Self::Custom(t) => ctx
                .registry
                .down_handler(&t.custom_type)?
                .is_sorted_by_latest_modification(t),
        })
    }

    /// Subset of `local_ids` still on the server under this target's criteria.
    pub fn get_remote_ids(&self, ctx: &SyncContext<'_>, local_ids: &[String]) -> Result<HashSet<String>> {
        if local_ids.is_empty() {
            return Ok(HashSet::new());
        }
        match self {
            Self::Soql(t) => t.get_remote_ids(ctx, local_ids),
            Self::Mru(t) => t.get_remote_ids(ctx, local_ids),
            Self::Refresh(t) => t.get_remote_ids(ctx, local_ids),
            Self::ParentChildren(t) => t.get_remote_ids(ctx, local_ids),
            Self::Custom(t) => ctx
                .registry
                .down_handler(&t.custom_type)?
                .get_remote_ids(ctx, t, local_ids),
        }
    }

    /// Newest modification time in `records`, or -1 if any record lacks a
    /// parsable one.
    ///
    /// Parent-children targets only look at the parents.
    #[must_use]
    pub fn get_latest_modification_time_stamp(&self, records: &[Value]) -> i64 {
        latest_modification_time_stamp(records, &self.fields().modification_date_field_name)
    }

    /// Write one page to the local store in a single transaction.
    ///
    /// Returns the number of records written.
    pub fn save_records_to_local_store(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        records: Vec<Value>,
    ) -> Result<usize> {
        match self {
            Self::ParentChildren(t) => t.save_records_to_local_store(ctx, soup, records),
            _ => save_records(ctx, soup, records, &self.fields().id_field_name),
        }
    }

    /// Server ids of locally dirty records.
    pub fn get_dirty_record_ids(&self, ctx: &SyncContext<'_>, soup: &str) -> Result<HashSet<String>> {
        match self {
            Self::ParentChildren(t) => t.get_dirty_record_ids(ctx, soup),
            _ => Ok(dirty_server_ids(ctx.store, soup, &self.fields().id_field_name)?
                .into_iter()
                .collect()),
        }
    }

    /// Server ids of clean records written by this sync.
    pub fn get_non_dirty_record_ids(&self, ctx: &SyncContext<'_>, soup: &str) -> Result<Vec<String>> {
        match self {
            Self::ParentChildren(t) => t.get_non_dirty_record_ids(ctx, soup),
            _ => non_dirty_server_ids(ctx, soup, &self.fields().id_field_name),
        }
    }

    /// Delete local records by server id. Returns the number removed.
    pub fn delete_records_from_local_store(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        ids: &[String],
    ) -> Result<usize> {
        match self {
            Self::ParentChildren(t) => t.delete_records_from_local_store(ctx, soup, ids),
            _ => delete_by_server_ids(ctx.store, soup, &self.fields().id_field_name, ids),
        }
    }

    /// Delete clean local records the server no longer returns.
    ///
    /// Returns the number of ghosts found.
    pub fn clean_ghosts(&self, ctx: &SyncContext<'_>, soup: &str) -> Result<usize> {
        let local_ids = self.get_non_dirty_record_ids(ctx, soup)?;
        let remote_ids = self.get_remote_ids(ctx, &local_ids)?;
        ctx.check_if_stopped()?;
        let ghosts: Vec<String> = local_ids
            .into_iter()
            .filter(|id| !remote_ids.contains(id))
            .collect();
        if !ghosts.is_empty() {
            self.delete_records_from_local_store(ctx, soup, &ghosts)?;
        }
        info!(soup, sync_id = ctx.sync_id, ghosts = ghosts.len(), "Cleaned ghosts");
        Ok(ghosts.len())
    }
}

// ==================
// Sync up
// ==================

/// Strategy for a sync up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncUpTarget {
    Standard(StandardSyncUpTarget),
    Batch(BatchSyncUpTarget),
    ParentChildren(ParentChildrenSyncUpTarget),
    Custom(CustomSyncUpTarget),
}

impl SyncUpTarget {
    #[must_use]
    pub fn fields(&self) -> &TargetFields {
        match self {
            Self::Standard(t) => &t.fields,
            Self::Batch(t) => &t.base.fields,
            Self::ParentChildren(t) => &t.parent.fields,
            Self::Custom(t) => &t.base.fields,
        }
    }

    /// Records handed to [`SyncUpTarget::sync_up_records`] at a time.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Batch(t) => t.batch_size(),
            _ => 1,
        }
    }

    /// Entry ids of every dirty record, in entry-id order.
    pub fn get_ids_of_records_to_sync_up(&self, ctx: &SyncContext<'_>, soup: &str) -> Result<Vec<i64>> {
        match self {
            Self::ParentChildren(t) => t.get_ids_of_records_to_sync_up(ctx, soup),
            _ => dirty_entry_ids(ctx.store, soup),
        }
    }

    /// Upload the given records.
    ///
    /// Non-2xx responses are recorded on the record; only transport
    /// failures and stops come back as `Err`.
    pub fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        ids: &[i64],
        options: &SyncOptions,
    ) -> Result<()> {
        match self {
            Self::Standard(t) => up::sync_up_each(t, ctx, soup, ids, options),
            Self::Batch(t) => t.sync_up_records(ctx, soup, ids, options),
            Self::ParentChildren(t) => t.sync_up_records(ctx, soup, ids, options),
            Self::Custom(t) => {
                let handler = ctx.registry.up_handler(&t.custom_type)?;
                up::sync_up_each(&custom::CustomServer { target: t, handler }, ctx, soup, ids, options)
            }
        }
    }

    /// Whether `record` may overwrite the server copy under leave-if-changed.
    pub fn is_newer_than_server(&self, ctx: &SyncContext<'_>, record: &Value) -> Result<bool> {
        match self {
            Self::Standard(t) => up::is_newer_than_server(t, ctx, record),
            Self::Batch(t) => up::is_newer_than_server(&t.base, ctx, record),
            Self::ParentChildren(t) => t.is_newer_than_server(ctx, record),
            Self::Custom(t) => {
                let handler = ctx.registry.up_handler(&t.custom_type)?;
                up::is_newer_than_server(&custom::CustomServer { target: t, handler }, ctx, record)
            }
        }
    }
}

// ==================
// Shared helpers
// ==================

/// Parse a server timestamp: `2024-01-31T12:00:00.000+0000`, RFC 3339, or
/// Unix milliseconds.
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
                .or_else(|_| DateTime::parse_from_rfc3339(s))
                .map(|d| d.timestamp_millis())
                .ok()
                .or_else(|| s.parse::<i64>().ok())
        }
        _ => None,
    }
}

/// Format Unix milliseconds as a query literal (`2024-01-31T12:00:00.000Z`).
#[must_use]
pub fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis).map_or_else(
        || millis.to_string(),
        |d| d.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
    )
}

/// Newest `field` across `records`; -1 if any record lacks a parsable value.
#[must_use]
pub fn latest_modification_time_stamp(records: &[Value], field: &str) -> i64 {
    let mut latest = UNKNOWN_TIME_STAMP;
    for record in records {
        match record.get(field).and_then(parse_timestamp) {
            Some(ts) => latest = latest.max(ts),
            None => return UNKNOWN_TIME_STAMP,
        }
    }
    latest
}

/// Id as a string, for string or numeric ids.
#[must_use]
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Set a top-level field; no-op on non-objects.
pub(crate) fn set_field(record: &mut Value, key: &str, value: Value) {
    if let Some(obj) = record.as_object_mut() {
        obj.insert(key.to_string(), value);
    }
}

/// `'a', 'b'` with SQL quoting.
pub(crate) fn sql_quote_list(ids: &[String]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", id.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Predicate selecting dirty records of `soup`.
pub(crate) fn dirty_clause(soup: &str) -> String {
    format!("{{{soup}:{LOCAL}}} IN ('true', 1)")
}

/// Predicate selecting clean records of `soup`.
pub(crate) fn clean_clause(soup: &str) -> String {
    format!("({{{soup}:{LOCAL}}} IS NULL OR {{{soup}:{LOCAL}}} NOT IN ('true', 1))")
}

/// Every row of `spec`, across all pages.
///
/// The spec must have a deterministic order.
pub(crate) fn query_all(store: &SmartStore, spec: &QuerySpec) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    for page_index in 0.. {
        let rows = store.query(spec, page_index)?;
        let done = rows.len() < spec.page_size;
        out.extend(rows);
        if done {
            break;
        }
    }
    Ok(out)
}

/// First column of every row of a logical query, across all pages.
///
/// The query must have a deterministic ORDER BY.
pub(crate) fn query_first_column(store: &SmartStore, smart_sql: &str) -> Result<Vec<Value>> {
    Ok(query_all(store, &QuerySpec::smart(smart_sql, LOCAL_PAGE_SIZE))?
        .into_iter()
        .map(|row| row.get(0).cloned().unwrap_or(Value::Null))
        .collect())
}

/// Entry ids of dirty records, ascending.
pub(crate) fn dirty_entry_ids(store: &SmartStore, soup: &str) -> Result<Vec<i64>> {
    let sql = format!(
        "SELECT {{{soup}:{SOUP_ENTRY_ID}}} FROM {{{soup}}} WHERE {} ORDER BY {{{soup}:{SOUP_ENTRY_ID}}}",
        dirty_clause(soup)
    );
    Ok(query_first_column(store, &sql)?
        .iter()
        .filter_map(Value::as_i64)
        .collect())
}

/// Server ids of dirty records.
pub(crate) fn dirty_server_ids(store: &SmartStore, soup: &str, id_field: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT {{{soup}:{id_field}}} FROM {{{soup}}} WHERE {} ORDER BY {{{soup}:{SOUP_ENTRY_ID}}}",
        dirty_clause(soup)
    );
    Ok(query_first_column(store, &sql)?
        .iter()
        .filter_map(id_string)
        .collect())
}

/// Server ids of clean records, limited to the current sync when the soup
/// indexes `__sync_id__`.
pub(crate) fn non_dirty_server_ids(ctx: &SyncContext<'_>, soup: &str, id_field: &str) -> Result<Vec<String>> {
    let mut sql = format!(
        "SELECT {{{soup}:{id_field}}} FROM {{{soup}}} WHERE {}",
        clean_clause(soup)
    );
    if ctx.store.has_index_for_path(soup, SYNC_ID)? {
        sql.push_str(&format!(" AND {{{soup}:{SYNC_ID}}} = {}", ctx.sync_id));
    }
    sql.push_str(&format!(" ORDER BY {{{soup}:{SOUP_ENTRY_ID}}}"));
    Ok(query_first_column(ctx.store, &sql)?
        .iter()
        .filter_map(id_string)
        .collect())
}

/// Delete records whose `id_field` is in `ids`.
pub(crate) fn delete_by_server_ids(
    store: &SmartStore,
    soup: &str,
    id_field: &str,
    ids: &[String],
) -> Result<usize> {
    let mut deleted = 0;
    for chunk in ids.chunks(LOCAL_ID_CHUNK) {
        let sql = format!(
            "SELECT {{{soup}:{SOUP_ENTRY_ID}}} FROM {{{soup}}} WHERE {{{soup}:{id_field}}} IN ({})",
            sql_quote_list(chunk)
        );
        deleted += store.delete_by_query(soup, &QuerySpec::smart(&sql, LOCAL_PAGE_SIZE))?;
    }
    Ok(deleted)
}

/// Store fetched records, marked clean and stamped with the sync id.
///
/// Under leave-if-changed, records that are dirty locally at write time are
/// left alone.
pub(crate) fn save_records(
    ctx: &SyncContext<'_>,
    soup: &str,
    records: Vec<Value>,
    id_field: &str,
) -> Result<usize> {
    ctx.store.in_transaction(|store| {
        let mut saved = 0;
        for mut record in records {
            if ctx.merge_mode == MergeMode::LeaveIfChanged && is_dirty_locally(store, soup, id_field, &record)? {
                continue;
            }
            mark_clean(&mut record);
            set_field(&mut record, SYNC_ID, ctx.sync_id.into());
            store.upsert_with_external_id(soup, &record, id_field)?;
            saved += 1;
        }
        Ok(saved)
    })
}

/// Whether the local copy of `record` (matched on `id_field`) is dirty.
pub(crate) fn is_dirty_locally(
    store: &SmartStore,
    soup: &str,
    id_field: &str,
    record: &Value,
) -> Result<bool> {
    let Some(id) = record.get(id_field).filter(|v| !v.is_null()) else {
        return Ok(false);
    };
    let Some(entry_id) = store.lookup_entry_id(soup, id_field, id)? else {
        return Ok(false);
    };
    Ok(store.retrieve(soup, &[entry_id])?.first().is_some_and(is_dirty))
}

/// Server id from a create response body.
pub(crate) fn created_id(response: &RestResponse) -> Option<String> {
    response.body.get("id").and_then(id_string)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::model::{Order, QuerySpec};
    use crate::sync::mark_locally_updated;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_timestamps() {
        let ts = parse_timestamp(&json!("2024-01-31T12:00:00.000+0000")).unwrap();
        assert_eq!(parse_timestamp(&json!("2024-01-31T12:00:00.000Z")), Some(ts));
        assert_eq!(parse_timestamp(&json!(ts)), Some(ts));
        assert_eq!(format_timestamp(ts), "2024-01-31T12:00:00.000Z");
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
    }

    #[test]
    fn test_latest_modification_unknown_when_any_unparsable() {
        let records = vec![
            json!({"LastModifiedDate": "2024-01-01T00:00:00.000Z"}),
            json!({"LastModifiedDate": "2024-02-01T00:00:00.000Z"}),
        ];
        let latest = latest_modification_time_stamp(&records, "LastModifiedDate");
        assert_eq!(latest, parse_timestamp(&json!("2024-02-01T00:00:00.000Z")).unwrap());

        let mut broken = records.clone();
        broken.push(json!({"LastModifiedDate": "garbage"}));
        assert_eq!(
            latest_modification_time_stamp(&broken, "LastModifiedDate"),
            UNKNOWN_TIME_STAMP
        );
        broken.pop();
        broken.push(json!({"Name": "no date"}));
        assert_eq!(
            latest_modification_time_stamp(&broken, "LastModifiedDate"),
            UNKNOWN_TIME_STAMP
        );
    }

    #[test]
    fn test_clean_ghosts_deletes_complement() {
        let store = synced_store("accounts");
        let remote: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(vec!["001".into(), "003".into()]));
        let seen = Arc::clone(&remote);
        let env = env_with(Arc::clone(&store), move |req| {
            // Id-only query: answer with the ids still on the server.
            assert!(soql_of(req).starts_with("SELECT Id FROM Account"));
            let records = seen
                .lock()
                .unwrap()
                .iter()
                .map(|id| json!({"Id": id}))
                .collect();
            Ok(records_response(records))
        });
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);

        let target = SyncDownTarget::Soql(SoqlSyncDownTarget::new("SELECT Id, Name FROM Account"));
        let records: Vec<Value> = ["001", "002", "003", "004", "005"]
            .iter()
            .map(|id| json!({"Id": id, "Name": id, "LastModifiedDate": "2024-01-01T00:00:00.000Z"}))
            .collect();
        target
            .save_records_to_local_store(&ctx, "accounts", records)
            .unwrap();

        // A dirty record is never a ghost.
        let mut dirty = store
            .query(&QuerySpec::exact("accounts", "Id", "005", Order::Ascending, 1), 0)
            .unwrap()
            .remove(0);
        mark_locally_updated(&mut dirty);
        store.upsert("accounts", &dirty).unwrap();

        let removed = target.clean_ghosts(&ctx, "accounts").unwrap();
        assert_eq!(removed, 2);

        let left: Vec<String> = store
            .query(&QuerySpec::all("accounts", Some("Id"), Order::Ascending, 10), 0)
            .unwrap()
            .iter()
            .map(|r| r["Id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(left, vec!["001", "003", "005"]);
    }

    #[test]
    fn test_ghosts_scoped_to_sync() {
        let store = synced_store("accounts");
        let env = env_with(Arc::clone(&store), |_| Ok(records_response(Vec::new())));
        let stop = token();
        let target = SyncDownTarget::Soql(SoqlSyncDownTarget::new("SELECT Id FROM Account"));

        let first = env.context(1, MergeMode::Overwrite, &stop);
        target
            .save_records_to_local_store(&first, "accounts", vec![json!({"Id": "a"})])
            .unwrap();
        let second = env.context(2, MergeMode::Overwrite, &stop);
        target
            .save_records_to_local_store(&second, "accounts", vec![json!({"Id": "b"})])
            .unwrap();

        assert_eq!(target.get_non_dirty_record_ids(&second, "accounts").unwrap(), vec!["b"]);
        assert_eq!(target.clean_ghosts(&second, "accounts").unwrap(), 1);
        assert_eq!(
            store
                .count_query(&QuerySpec::all("accounts", None, Order::Ascending, 10))
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_leave_if_changed_keeps_dirty_local_copy() {
        let store = synced_store("accounts");
        let env = env_with(Arc::clone(&store), |_| Ok(records_response(Vec::new())));
        let stop = token();
        let ctx = env.context(1, MergeMode::LeaveIfChanged, &stop);

        let mut local = json!({"Id": "001", "Name": "local edit"});
        mark_locally_updated(&mut local);
        store.create("accounts", &local).unwrap();

        let saved = save_records(
            &ctx,
            "accounts",
            vec![json!({"Id": "001", "Name": "server"}), json!({"Id": "002", "Name": "new"})],
            "Id",
        )
        .unwrap();
        assert_eq!(saved, 1);
        let kept = store
            .query(&QuerySpec::exact("accounts", "Id", "001", Order::Ascending, 1), 0)
            .unwrap();
        assert_eq!(kept[0]["Name"], "local edit");
    }

    #[test]
    fn test_target_serialization_tags() {
        let target = SyncDownTarget::Refresh(RefreshSyncDownTarget::new("Account", vec!["Name".into()], "accounts"));
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["type"], "refresh");
        assert_eq!(json["idFieldName"], "Id");
        let back: SyncDownTarget = serde_json::from_value(json).unwrap();
        assert_eq!(back, target);

        let up: SyncUpTarget = serde_json::from_value(json!({"type": "batch", "maxBatchSize": 10})).unwrap();
        assert_eq!(up.batch_size(), 10);
    }
}
