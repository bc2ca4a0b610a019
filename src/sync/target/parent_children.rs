//! Parent records synced together with their children.
//!
//! Parents and children live in separate soups. Each child carries the
//! parent's server id under `parentIdFieldName` and the parent's entry id
//! under `parentLocalIdFieldName`; the children soup must index both. A
//! parent counts as dirty when it or any of its children is.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::soql::{add_modification_filter, fetch_all_ids, fetch_page};
use super::up::{self, sync_up_one, UpAction, UpOutcome, UpServer};
use super::{
    clean_clause, dirty_clause, id_string, is_dirty_locally, query_all, query_first_column,
    set_field, sql_quote_list, TargetFields, LOCAL_PAGE_SIZE,
};
use crate::error::Result;
use crate::model::{MergeMode, QuerySpec, SyncOptions, UNKNOWN_TIME_STAMP};
use crate::store::{SmartStore, SOUP_ENTRY_ID};
use crate::sync::{is_dirty, mark_clean, SyncContext, SYNC_ID};

fn unknown() -> i64 {
    UNKNOWN_TIME_STAMP
}

/// How children depend on their parent on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// Children are deleted with their parent.
    MasterDetail,
    Lookup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentInfo {
    pub sobject_type: String,
    /// Parent soup; the sync's soup when empty.
    #[serde(default)]
    pub soup_name: String,
    #[serde(flatten)]
    pub fields: TargetFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id_field_name: Option<String>,
}

impl ParentInfo {
    #[must_use]
    pub fn new(sobject_type: &str, soup_name: &str) -> Self {
        Self {
            sobject_type: sobject_type.to_string(),
            soup_name: soup_name.to_string(),
            fields: TargetFields::default(),
            external_id_field_name: None,
        }
    }

    fn soup<'a>(&'a self, sync_soup: &'a str) -> &'a str {
        if self.soup_name.is_empty() { sync_soup } else { &self.soup_name }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildrenInfo {
    pub sobject_type: String,
    /// Relationship name used in the nested query, e.g. `Contacts`.
    pub sobject_type_plural: String,
    pub soup_name: String,
    pub parent_id_field_name: String,
    pub parent_local_id_field_name: String,
    #[serde(flatten)]
    pub fields: TargetFields,
}

impl ChildrenInfo {
    #[must_use]
    pub fn new(
        sobject_type: &str,
        sobject_type_plural: &str,
        soup_name: &str,
        parent_id_field_name: &str,
        parent_local_id_field_name: &str,
    ) -> Self {
        Self {
            sobject_type: sobject_type.to_string(),
            sobject_type_plural: sobject_type_plural.to_string(),
            soup_name: soup_name.to_string(),
            parent_id_field_name: parent_id_field_name.to_string(),
            parent_local_id_field_name: parent_local_id_field_name.to_string(),
            fields: TargetFields::default(),
        }
    }
}

/// Select list with the id and modification fields first.
fn select_list(fields: &TargetFields, extra: &[String]) -> String {
    let mut out = vec![
        fields.id_field_name.clone(),
        fields.modification_date_field_name.clone(),
    ];
    for field in extra {
        if !out.iter().any(|f| f.eq_ignore_ascii_case(field)) {
            out.push(field.clone());
        }
    }
    out.join(", ")
}

/// `EXISTS` over the dirty children of the current parent row.
fn dirty_children_clause(parent_soup: &str, children: &ChildrenInfo) -> String {
    let child_soup = &children.soup_name;
    format!(
        "EXISTS (SELECT 1 FROM {{{child_soup}}} WHERE {{{child_soup}:{}}} = {{{parent_soup}:{SOUP_ENTRY_ID}}} AND {})",
        children.parent_local_id_field_name,
        dirty_clause(child_soup)
    )
}

/// Logical query for parents that are dirty themselves or through a child.
fn dirty_parents_sql(parent_soup: &str, select_path: &str, children: &ChildrenInfo) -> String {
    format!(
        "SELECT {{{parent_soup}:{select_path}}} FROM {{{parent_soup}}} WHERE {} OR {} ORDER BY {{{parent_soup}:{SOUP_ENTRY_ID}}}",
        dirty_clause(parent_soup),
        dirty_children_clause(parent_soup, children)
    )
}

/// Every child of the parent with entry id `parent_entry_id`.
fn children_of(store: &SmartStore, children: &ChildrenInfo, parent_entry_id: i64) -> Result<Vec<Value>> {
    let spec = QuerySpec::exact(
        &children.soup_name,
        &children.parent_local_id_field_name,
        parent_entry_id,
        crate::model::Order::Ascending,
        LOCAL_PAGE_SIZE,
    )
    .with_order_path(SOUP_ENTRY_ID);
    query_all(store, &spec)
}

/// Remove the nested children of a fetched parent.
fn take_children(parent: &mut Value, plural: &str) -> Vec<Value> {
    let Some(nested) = parent.as_object_mut().and_then(|obj| obj.remove(plural)) else {
        return Vec::new();
    };
    match nested {
        Value::Object(mut obj) => match obj.remove("records") {
            Some(Value::Array(records)) => records,
            _ => Vec::new(),
        },
        Value::Array(records) => records,
        _ => Vec::new(),
    }
}

// ==================
// Sync down
// ==================

/// Fetches parents with a nested query over their children.
///
/// The high-water mark filters on the parent's modification date only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentChildrenSyncDownTarget {
    pub parent: ParentInfo,
    #[serde(default)]
    pub parent_field_list: Vec<String>,
    #[serde(default)]
    pub parent_soql_filter: String,
    pub children: ChildrenInfo,
    #[serde(default)]
    pub children_field_list: Vec<String>,
    pub relationship_type: RelationshipType,
    #[serde(skip)]
    next_records_url: Option<String>,
    #[serde(skip, default = "unknown")]
    pub(crate) total_size: i64,
}

impl ParentChildrenSyncDownTarget {
    #[must_use]
    pub fn new(
        parent: ParentInfo,
        parent_field_list: Vec<String>,
        parent_soql_filter: &str,
        children: ChildrenInfo,
        children_field_list: Vec<String>,
        relationship_type: RelationshipType,
    ) -> Self {
        Self {
            parent,
            parent_field_list,
            parent_soql_filter: parent_soql_filter.to_string(),
            children,
            children_field_list,
            relationship_type,
            next_records_url: None,
            total_size: UNKNOWN_TIME_STAMP,
        }
    }

    /// Nested query for a fetch starting at `max_time_stamp`.
    #[must_use]
    pub fn query(&self, max_time_stamp: i64) -> String {
        let mut soql = format!(
            "SELECT {}, (SELECT {} FROM {}) FROM {}",
            select_list(&self.parent.fields, &self.parent_field_list),
            select_list(&self.children.fields, &self.children_field_list),
            self.children.sobject_type_plural,
            self.parent.sobject_type
        );
        if !self.parent_soql_filter.trim().is_empty() {
            soql.push_str(" WHERE ");
            soql.push_str(self.parent_soql_filter.trim());
        }
        if max_time_stamp > 0 {
            soql = add_modification_filter(&soql, &self.parent.fields.modification_date_field_name, max_time_stamp);
        }
        soql
    }

    pub(crate) fn start_fetch(&mut self, ctx: &SyncContext<'_>, max_time_stamp: i64) -> Result<Vec<Value>> {
        let query = self.query(max_time_stamp);
        debug!(sync_id = ctx.sync_id, query = %query, "Starting parent/children fetch");
        let page = fetch_page(ctx, &ctx.api.query(&query))?;
        self.total_size = page.total_size;
        self.next_records_url = page.next();
        Ok(page.records)
    }

    pub(crate) fn continue_fetch(&mut self, ctx: &SyncContext<'_>) -> Result<Option<Vec<Value>>> {
        let Some(next) = self.next_records_url.take() else {
            return Ok(None);
        };
        let page = fetch_page(ctx, &ctx.api.query_more(&next))?;
        self.next_records_url = page.next();
        Ok(Some(page.records))
    }

    pub(crate) fn get_remote_ids(&self, ctx: &SyncContext<'_>, local_ids: &[String]) -> Result<HashSet<String>> {
        let id_field = &self.parent.fields.id_field_name;
        let mut soql = format!("SELECT {id_field} FROM {}", self.parent.sobject_type);
        if !self.parent_soql_filter.trim().is_empty() {
            soql.push_str(" WHERE ");
            soql.push_str(self.parent_soql_filter.trim());
        }
        let remote = fetch_all_ids(ctx, &soql, id_field)?;
        Ok(local_ids
            .iter()
            .filter(|id| remote.contains(*id))
            .cloned()
            .collect())
    }

    /// Whether the local parent or any of its children is dirty.
    fn local_tree_is_dirty(&self, store: &SmartStore, parent_soup: &str, parent: &Value) -> Result<bool> {
        let id_field = &self.parent.fields.id_field_name;
        if is_dirty_locally(store, parent_soup, id_field, parent)? {
            return Ok(true);
        }
        let Some(id) = parent.get(id_field).filter(|v| !v.is_null()) else {
            return Ok(false);
        };
        let Some(entry_id) = store.lookup_entry_id(parent_soup, id_field, id)? else {
            return Ok(false);
        };
        Ok(children_of(store, &self.children, entry_id)?.iter().any(is_dirty))
    }

    /// Drop clean local children of a parent that the server no longer lists.
    fn delete_stale_children(&self, store: &SmartStore, parent_entry_id: i64, kept: &[String]) -> Result<usize> {
        let child_soup = &self.children.soup_name;
        let mut sql = format!(
            "SELECT {{{child_soup}:{SOUP_ENTRY_ID}}} FROM {{{child_soup}}} WHERE {{{child_soup}:{}}} = {parent_entry_id} AND {}",
            self.children.parent_local_id_field_name,
            clean_clause(child_soup)
        );
        if !kept.is_empty() {
            sql.push_str(&format!(
                " AND {{{child_soup}:{}}} NOT IN ({})",
                self.children.fields.id_field_name,
                sql_quote_list(kept)
            ));
        }
        store.delete_by_query(child_soup, &QuerySpec::smart(&sql, 1000))
    }

    pub(crate) fn save_records_to_local_store(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        records: Vec<Value>,
    ) -> Result<usize> {
        let parent_soup = self.parent.soup(soup);
        let parent_id_field = &self.parent.fields.id_field_name;
        let child_soup = &self.children.soup_name;
        let child_id_field = &self.children.fields.id_field_name;

        ctx.store.in_transaction(|store| {
            let mut saved = 0;
            for mut parent in records {
                let children = take_children(&mut parent, &self.children.sobject_type_plural);
                if ctx.merge_mode == MergeMode::LeaveIfChanged
                    && self.local_tree_is_dirty(store, parent_soup, &parent)?
                {
                    continue;
                }
                mark_clean(&mut parent);
                set_field(&mut parent, SYNC_ID, ctx.sync_id.into());
                let stored = store.upsert_with_external_id(parent_soup, &parent, parent_id_field)?;
                let parent_entry_id = stored.get(SOUP_ENTRY_ID).and_then(Value::as_i64).unwrap_or_default();
                let parent_server_id = parent.get(parent_id_field).cloned().unwrap_or(Value::Null);

                let mut kept = Vec::with_capacity(children.len());
                for mut child in children {
                    set_field(&mut child, &self.children.parent_id_field_name, parent_server_id.clone());
                    set_field(&mut child, &self.children.parent_local_id_field_name, parent_entry_id.into());
                    mark_clean(&mut child);
                    set_field(&mut child, SYNC_ID, ctx.sync_id.into());
                    if let Some(id) = child.get(child_id_field).and_then(id_string) {
                        kept.push(id);
                    }
                    store.upsert_with_external_id(child_soup, &child, child_id_field)?;
                }
                self.delete_stale_children(store, parent_entry_id, &kept)?;
                saved += 1;
            }
            Ok(saved)
        })
    }

    pub(crate) fn get_dirty_record_ids(&self, ctx: &SyncContext<'_>, soup: &str) -> Result<HashSet<String>> {
        let parent_soup = self.parent.soup(soup);
        let sql = dirty_parents_sql(parent_soup, &self.parent.fields.id_field_name, &self.children);
        Ok(query_first_column(ctx.store, &sql)?
            .iter()
            .filter_map(id_string)
            .collect())
    }

    pub(crate) fn get_non_dirty_record_ids(&self, ctx: &SyncContext<'_>, soup: &str) -> Result<Vec<String>> {
        let parent_soup = self.parent.soup(soup);
        let id_field = &self.parent.fields.id_field_name;
        let mut sql = format!(
            "SELECT {{{parent_soup}:{id_field}}} FROM {{{parent_soup}}} WHERE {} AND NOT {}",
            clean_clause(parent_soup),
            dirty_children_clause(parent_soup, &self.children)
        );
        if ctx.store.has_index_for_path(parent_soup, SYNC_ID)? {
            sql.push_str(&format!(" AND {{{parent_soup}:{SYNC_ID}}} = {}", ctx.sync_id));
        }
        sql.push_str(&format!(" ORDER BY {{{parent_soup}:{SOUP_ENTRY_ID}}}"));
        Ok(query_first_column(ctx.store, &sql)?
            .iter()
            .filter_map(id_string)
            .collect())
    }

    /// Delete parents by server id. Master-detail children go with them.
    pub(crate) fn delete_records_from_local_store(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        ids: &[String],
    ) -> Result<usize> {
        let parent_soup = self.parent.soup(soup);
        ctx.store.in_transaction(|store| {
            if self.relationship_type == RelationshipType::MasterDetail {
                super::delete_by_server_ids(
                    store,
                    &self.children.soup_name,
                    &self.children.parent_id_field_name,
                    ids,
                )?;
            }
            super::delete_by_server_ids(store, parent_soup, &self.parent.fields.id_field_name, ids)
        })
    }
}

// ==================
// Sync up
// ==================

/// Uploads each dirty parent, then its dirty children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentChildrenSyncUpTarget {
    pub parent: ParentInfo,
    #[serde(default)]
    pub parent_create_field_list: Vec<String>,
    #[serde(default)]
    pub parent_update_field_list: Vec<String>,
    pub children: ChildrenInfo,
    #[serde(default)]
    pub children_create_field_list: Vec<String>,
    #[serde(default)]
    pub children_update_field_list: Vec<String>,
    pub relationship_type: RelationshipType,
}

/// One side of the relationship as an upload endpoint.
struct RecordServer<'a> {
    object_type: &'a str,
    fields: &'a TargetFields,
    create: Vec<String>,
    update: Vec<String>,
    excluded: Vec<String>,
}

impl UpServer for RecordServer<'_> {
    fn fields(&self) -> &TargetFields {
        self.fields
    }

    fn object_type(&self, _record: &Value) -> Option<String> {
        Some(self.object_type.to_string())
    }

    fn create_field_list(&self) -> Option<&[String]> {
        Some(&self.create)
    }

    fn update_field_list(&self) -> Option<&[String]> {
        Some(&self.update)
    }

    fn excluded_fields(&self) -> &[String] {
        &self.excluded
    }
}

/// `list` plus `field` when `list` is non-empty.
fn with_field(list: &[String], field: &str) -> Vec<String> {
    let mut out = list.to_vec();
    if !out.is_empty() && !out.iter().any(|f| f == field) {
        out.push(field.to_string());
    }
    out
}

impl ParentChildrenSyncUpTarget {
    #[must_use]
    pub fn new(parent: ParentInfo, children: ChildrenInfo, relationship_type: RelationshipType) -> Self {
        Self {
            parent,
            parent_create_field_list: Vec::new(),
            parent_update_field_list: Vec::new(),
            children,
            children_create_field_list: Vec::new(),
            children_update_field_list: Vec::new(),
            relationship_type,
        }
    }

    fn parent_server(&self) -> RecordServer<'_> {
        RecordServer {
            object_type: &self.parent.sobject_type,
            fields: &self.parent.fields,
            create: self.parent_create_field_list.clone(),
            update: self.parent_update_field_list.clone(),
            excluded: Vec::new(),
        }
    }

    fn child_server(&self) -> RecordServer<'_> {
        let parent_id = &self.children.parent_id_field_name;
        RecordServer {
            object_type: &self.children.sobject_type,
            fields: &self.children.fields,
            create: with_field(&self.children_create_field_list, parent_id),
            update: with_field(&self.children_update_field_list, parent_id),
            excluded: vec![self.children.parent_local_id_field_name.clone()],
        }
    }

    pub(crate) fn get_ids_of_records_to_sync_up(&self, ctx: &SyncContext<'_>, soup: &str) -> Result<Vec<i64>> {
        let sql = dirty_parents_sql(self.parent.soup(soup), SOUP_ENTRY_ID, &self.children);
        Ok(query_first_column(ctx.store, &sql)?
            .iter()
            .filter_map(Value::as_i64)
            .collect())
    }

    pub(crate) fn is_newer_than_server(&self, ctx: &SyncContext<'_>, record: &Value) -> Result<bool> {
        up::is_newer_than_server(&self.parent_server(), ctx, record)
    }

    pub(crate) fn sync_up_records(
        &self,
        ctx: &SyncContext<'_>,
        soup: &str,
        ids: &[i64],
        options: &SyncOptions,
    ) -> Result<()> {
        let parent_soup = self.parent.soup(soup);
        let parent_server = self.parent_server();
        let child_server = self.child_server();

        for mut parent in ctx.store.retrieve(parent_soup, ids)? {
            ctx.check_if_stopped()?;
            let parent_entry_id = up::entry_id(&parent)?;
            let children = children_of(ctx.store, &self.children, parent_entry_id)?;

            let action = UpAction::for_record(&parent);
            let outcome = sync_up_one(&parent_server, ctx, parent_soup, &mut parent, options)?;
            let proceed = match outcome {
                UpOutcome::Deleted => {
                    if self.relationship_type == RelationshipType::MasterDetail {
                        let entry_ids: Vec<i64> = children
                            .iter()
                            .filter_map(|c| c.get(SOUP_ENTRY_ID).and_then(Value::as_i64))
                            .collect();
                        ctx.store.delete(&self.children.soup_name, &entry_ids)?;
                        false
                    } else {
                        true
                    }
                }
                UpOutcome::Created(_) | UpOutcome::Updated => true,
                UpOutcome::Skipped => action == UpAction::Skip,
                UpOutcome::Failed => false,
            };
            if !proceed {
                debug!(sync_id = ctx.sync_id, parent = parent_entry_id, "Leaving children of parent dirty");
                continue;
            }

            let parent_server_id = parent
                .get(&self.parent.fields.id_field_name)
                .cloned()
                .unwrap_or(Value::Null);
            for mut child in children.into_iter().filter(is_dirty) {
                ctx.check_if_stopped()?;
                set_field(&mut child, &self.children.parent_id_field_name, parent_server_id.clone());
                sync_up_one(&child_server, ctx, &self.children.soup_name, &mut child, options)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{SyncDownTarget, SyncUpTarget};
    use super::*;
    use crate::model::IndexSpec;
    use crate::sync::rest::{Method, RestResponse};
    use crate::sync::{mark_locally_created, mark_locally_updated, LOCAL};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn store() -> Arc<SmartStore> {
        let store = synced_store("accounts");
        store
            .register_soup(
                "contacts",
                &[
                    IndexSpec::string("Id"),
                    IndexSpec::string(LOCAL),
                    IndexSpec::string("AccountId"),
                    IndexSpec::integer("AccountLocalId"),
                ],
            )
            .unwrap();
        store
    }

    fn parent() -> ParentInfo {
        ParentInfo::new("Account", "accounts")
    }

    fn children() -> ChildrenInfo {
        ChildrenInfo::new("Contact", "Contacts", "contacts", "AccountId", "AccountLocalId")
    }

    fn down_target() -> ParentChildrenSyncDownTarget {
        ParentChildrenSyncDownTarget::new(
            parent(),
            vec!["Name".into()],
            "Industry = 'Tech'",
            children(),
            vec!["LastName".into()],
            RelationshipType::MasterDetail,
        )
    }

    fn tree(id: &str, child_ids: &[&str]) -> Value {
        let records: Vec<Value> = child_ids
            .iter()
            .map(|c| json!({"Id": c, "LastName": c}))
            .collect();
        json!({"Id": id, "Name": id, "Contacts": {"totalSize": records.len(), "done": true, "records": records}})
    }

    fn count(store: &SmartStore, soup: &str) -> usize {
        store
            .count_query(&QuerySpec::all(soup, None, crate::model::Order::Ascending, 10))
            .unwrap()
    }

    #[test]
    fn test_query_filters_parent_only() {
        assert_eq!(
            down_target().query(1_706_702_400_000),
            "SELECT Id, LastModifiedDate, Name, (SELECT Id, LastModifiedDate, LastName FROM Contacts) FROM Account WHERE (Industry = 'Tech') AND LastModifiedDate > 2024-01-31T12:00:00.000Z"
        );
    }

    #[test]
    fn test_save_splits_tree_and_drops_stale_children() {
        let store = store();
        let env = env_with(Arc::clone(&store), |_| Ok(records_response(Vec::new())));
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let target = down_target();

        target
            .save_records_to_local_store(&ctx, "accounts", vec![tree("A1", &["C1", "C2"])])
            .unwrap();
        assert_eq!(count(&store, "accounts"), 1);
        assert_eq!(count(&store, "contacts"), 2);
        let child = &store
            .query(&QuerySpec::exact("contacts", "Id", "C1", crate::model::Order::Ascending, 1), 0)
            .unwrap()[0];
        assert_eq!(child["AccountId"], "A1");
        assert!(child["AccountLocalId"].as_i64().unwrap() > 0);

        target
            .save_records_to_local_store(&ctx, "accounts", vec![tree("A1", &["C2"])])
            .unwrap();
        assert_eq!(count(&store, "accounts"), 1);
        assert_eq!(count(&store, "contacts"), 1);
    }

    #[test]
    fn test_dirty_child_makes_parent_dirty() {
        let store = store();
        let env = env_with(Arc::clone(&store), |_| Ok(records_response(Vec::new())));
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let target = SyncDownTarget::ParentChildren(down_target());
        target
            .save_records_to_local_store(&ctx, "accounts", vec![tree("A1", &["C1"]), tree("A2", &["C2"])])
            .unwrap();

        let mut child = store
            .query(&QuerySpec::exact("contacts", "Id", "C2", crate::model::Order::Ascending, 1), 0)
            .unwrap()
            .remove(0);
        mark_locally_updated(&mut child);
        store.upsert("contacts", &child).unwrap();

        assert_eq!(
            target.get_dirty_record_ids(&ctx, "accounts").unwrap(),
            HashSet::from(["A2".to_string()])
        );
        assert_eq!(target.get_non_dirty_record_ids(&ctx, "accounts").unwrap(), vec!["A1"]);
    }

    #[test]
    fn test_children_beyond_one_page_are_read() {
        let store = store();
        let env = env_with(Arc::clone(&store), |_| Ok(records_response(Vec::new())));
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let target = down_target();
        target
            .save_records_to_local_store(&ctx, "accounts", vec![tree("A1", &[])])
            .unwrap();
        let parent_entry_id = store
            .lookup_entry_id("accounts", "Id", &json!("A1"))
            .unwrap()
            .unwrap();

        let total = LOCAL_PAGE_SIZE + 3;
        let created: Result<()> = store.in_transaction(|s| {
            for i in 0..total {
                let mut child = json!({"Id": format!("C{i}"), "AccountId": "A1", "AccountLocalId": parent_entry_id});
                if i == total - 1 {
                    mark_locally_updated(&mut child);
                }
                s.create("contacts", &child)?;
            }
            Ok(())
        });
        created.unwrap();

        let children = children_of(&store, &target.children, parent_entry_id).unwrap();
        assert_eq!(children.len(), total);
        assert_eq!(children[total - 1]["Id"], format!("C{}", total - 1));
        assert!(target
            .local_tree_is_dirty(&store, "accounts", &json!({"Id": "A1"}))
            .unwrap());
    }

    #[test]
    fn test_master_detail_delete_cascades() {
        let store = store();
        let env = env_with(Arc::clone(&store), |_| Ok(records_response(Vec::new())));
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let mut target = down_target();
        target
            .save_records_to_local_store(&ctx, "accounts", vec![tree("A1", &["C1", "C2"]), tree("A2", &["C3"])])
            .unwrap();

        target
            .delete_records_from_local_store(&ctx, "accounts", &["A1".into()])
            .unwrap();
        assert_eq!(count(&store, "accounts"), 1);
        assert_eq!(count(&store, "contacts"), 1);

        target.relationship_type = RelationshipType::Lookup;
        target
            .delete_records_from_local_store(&ctx, "accounts", &["A2".into()])
            .unwrap();
        assert_eq!(count(&store, "accounts"), 0);
        assert_eq!(count(&store, "contacts"), 1);
    }

    #[test]
    fn test_sync_up_creates_parent_then_children() {
        let store = store();
        let mut account = json!({"Name": "Acme"});
        mark_locally_created(&mut account, "Id");
        let account = store.create("accounts", &account).unwrap();
        let mut contact = json!({"LastName": "Doe", "AccountId": account["Id"], "AccountLocalId": account[SOUP_ENTRY_ID]});
        mark_locally_created(&mut contact, "Id");
        store.create("contacts", &contact).unwrap();

        let bodies: Arc<Mutex<Vec<(String, Value)>>> = Arc::default();
        let log = Arc::clone(&bodies);
        let env = env_with(Arc::clone(&store), move |req| {
            assert_eq!(req.method, Method::Post);
            let body = req.body.clone().unwrap_or_default();
            log.lock().unwrap().push((req.path.clone(), body));
            let id = if req.path.ends_with("/Account") { "001A" } else { "003C" };
            Ok(RestResponse::new(201, json!({"id": id})))
        });
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let target = SyncUpTarget::ParentChildren(ParentChildrenSyncUpTarget::new(
            parent(),
            children(),
            RelationshipType::MasterDetail,
        ));

        let ids = target.get_ids_of_records_to_sync_up(&ctx, "accounts").unwrap();
        assert_eq!(ids.len(), 1);
        target
            .sync_up_records(&ctx, "accounts", &ids, &SyncOptions::default())
            .unwrap();

        let sent = bodies.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].0.ends_with("/sobjects/Account"));
        assert_eq!(sent[1].1, json!({"LastName": "Doe", "AccountId": "001A"}));

        let child = &store
            .query(&QuerySpec::exact("contacts", "Id", "003C", crate::model::Order::Ascending, 1), 0)
            .unwrap()[0];
        assert!(!is_dirty(child));
        assert_eq!(child["AccountId"], "001A");
        assert!(target.get_ids_of_records_to_sync_up(&ctx, "accounts").unwrap().is_empty());
    }
}
