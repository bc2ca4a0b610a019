//! Record-at-a-time sync up.
//!
//! [`UpServer`] is the seam between the upload state machine and the calls
//! that reach the server; the standard target, custom targets and the
//! parent/children target each plug in their own.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::soql::{fetch_page, soql_quote_list};
use super::{created_id, id_string, parse_timestamp, set_field, TargetFields};
use crate::error::{Error, Result};
use crate::model::{MergeMode, SyncOptions};
use crate::store::SOUP_ENTRY_ID;
use crate::sync::rest::RestResponse;
use crate::sync::{
    is_dirty, is_locally_created, is_locally_deleted, is_locally_updated, mark_clean,
    SyncContext, LAST_ERROR,
};

/// Uploads each dirty record with its own create, update or delete call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardSyncUpTarget {
    #[serde(flatten)]
    pub fields: TargetFields,
    /// Object type for every record; otherwise read from `attributes.type`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sobject_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_field_list: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_field_list: Option<Vec<String>>,
}

impl StandardSyncUpTarget {
    /// Target for records of one object type.
    #[must_use]
    pub fn for_type(sobject_type: &str) -> Self {
        Self {
            sobject_type: Some(sobject_type.to_string()),
            ..Self::default()
        }
    }
}

/// What an upload does with one dirty record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpAction {
    /// Created and deleted offline; never reached the server.
    DeleteLocalOnly,
    Delete,
    Create,
    Update,
    Skip,
}

impl UpAction {
    #[must_use]
    pub fn for_record(record: &Value) -> Self {
        if !is_dirty(record) {
            Self::Skip
        } else if is_locally_deleted(record) {
            if is_locally_created(record) {
                Self::DeleteLocalOnly
            } else {
                Self::Delete
            }
        } else if is_locally_created(record) {
            Self::Create
        } else if is_locally_updated(record) {
            Self::Update
        } else {
            Self::Skip
        }
    }
}

/// Result of uploading one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpOutcome {
    /// Created on the server under this id.
    Created(String),
    Updated,
    Deleted,
    /// Left alone: clean, or not newer than the server.
    Skipped,
    /// Server refused; the error is stored on the record.
    Failed,
}

/// Server side of an upload.
pub(crate) trait UpServer {
    fn fields(&self) -> &TargetFields;

    fn object_type(&self, record: &Value) -> Option<String>;

    fn create_field_list(&self) -> Option<&[String]> {
        None
    }

    fn update_field_list(&self) -> Option<&[String]> {
        None
    }

    /// Fields never sent, on top of the local bookkeeping ones.
    fn excluded_fields(&self) -> &[String] {
        &[]
    }

    fn create_on_server(&self, ctx: &SyncContext<'_>, object_type: &str, fields: Value) -> Result<RestResponse> {
        ctx.send(&ctx.api.create(object_type, fields))
    }

    fn update_on_server(
        &self,
        ctx: &SyncContext<'_>,
        object_type: &str,
        id: &str,
        fields: Value,
    ) -> Result<RestResponse> {
        ctx.send(&ctx.api.update(object_type, id, fields))
    }

    fn delete_on_server(&self, ctx: &SyncContext<'_>, object_type: &str, id: &str) -> Result<RestResponse> {
        ctx.send(&ctx.api.delete(object_type, id))
    }

    /// `None` when the record is gone from the server; `Some(None)` when it
    /// exists without a usable modification date.
    fn fetch_remote_modification(
        &self,
        ctx: &SyncContext<'_>,
        object_type: &str,
        id: &str,
    ) -> Result<Option<Option<i64>>> {
        remote_modification(ctx, self.fields(), object_type, id)
    }
}

impl UpServer for StandardSyncUpTarget {
    fn fields(&self) -> &TargetFields {
        &self.fields
    }

    fn object_type(&self, record: &Value) -> Option<String> {
        self.sobject_type.clone().or_else(|| record_type(record))
    }

    fn create_field_list(&self) -> Option<&[String]> {
        self.create_field_list.as_deref()
    }

    fn update_field_list(&self) -> Option<&[String]> {
        self.update_field_list.as_deref()
    }
}

/// `attributes.type` of a record as returned by the server.
#[must_use]
pub fn record_type(record: &Value) -> Option<String> {
    record
        .pointer("/attributes/type")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Look up the modification date the server holds for one record.
///
/// `None` when the record does not exist; `Some(None)` when its date is
/// missing or unparsable.
pub fn remote_modification(
    ctx: &SyncContext<'_>,
    fields: &TargetFields,
    object_type: &str,
    id: &str,
) -> Result<Option<Option<i64>>> {
    let soql = format!(
        "SELECT {id_field}, {mod_field} FROM {object_type} WHERE {id_field} = {}",
        soql_quote_list(&[id.to_string()]),
        id_field = fields.id_field_name,
        mod_field = fields.modification_date_field_name,
    );
    let page = fetch_page(ctx, &ctx.api.query(&soql))?;
    Ok(page
        .records
        .first()
        .map(|r| r.get(&fields.modification_date_field_name).and_then(parse_timestamp)))
}

/// Whether the local copy may overwrite the server copy.
///
/// Records created offline and records without a local modification date
/// always win. A record deleted on both sides wins. A record missing on the
/// server, or present without a date, loses unless deleted locally.
pub(crate) fn is_newer_than_server<S: UpServer + ?Sized>(
    server: &S,
    ctx: &SyncContext<'_>,
    record: &Value,
) -> Result<bool> {
    if is_locally_created(record) {
        return Ok(true);
    }
    let fields = server.fields();
    let Some(local) = record
        .get(&fields.modification_date_field_name)
        .and_then(parse_timestamp)
    else {
        return Ok(true);
    };
    let (Some(object_type), Some(id)) = (
        server.object_type(record),
        record.get(&fields.id_field_name).and_then(id_string),
    ) else {
        return Ok(true);
    };
    Ok(match server.fetch_remote_modification(ctx, &object_type, &id)? {
        None => is_locally_deleted(record),
        Some(None) => false,
        Some(Some(remote)) => local >= remote,
    })
}

/// Field map sent to the server.
///
/// `list` wins over the sync's field list; with neither, every field but
/// the bookkeeping ones, `attributes`, the id and the modification date.
pub(crate) fn fields_to_send<S: UpServer + ?Sized>(
    server: &S,
    record: &Value,
    list: Option<&[String]>,
    options: &SyncOptions,
) -> Value {
    let fields = server.fields();
    let skip = |name: &str| {
        name == fields.id_field_name
            || name == fields.modification_date_field_name
            || server.excluded_fields().iter().any(|e| e == name)
    };
    let mut out = Map::new();
    let names = list
        .filter(|l| !l.is_empty())
        .or(options.fieldlist.as_deref().filter(|l| !l.is_empty()));
    match (names, record.as_object()) {
        (Some(names), _) => {
            for name in names.iter().filter(|n| !skip(n)) {
                if let Some(value) = record.get(name) {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
        (None, Some(obj)) => {
            for (name, value) in obj {
                if name.starts_with("__") || name.starts_with("_soup") || name == "attributes" || skip(name) {
                    continue;
                }
                out.insert(name.clone(), value.clone());
            }
        }
        (None, None) => {}
    }
    Value::Object(out)
}

pub(crate) fn entry_id(record: &Value) -> Result<i64> {
    record
        .get(SOUP_ENTRY_ID)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::InvalidArgument("record has no soup entry id".to_string()))
}

/// Store the server's complaint on the record; it stays dirty.
pub(crate) fn record_failure(
    ctx: &SyncContext<'_>,
    soup: &str,
    record: &mut Value,
    response: &RestResponse,
) -> Result<UpOutcome> {
    warn!(
        sync_id = ctx.sync_id,
        soup,
        status = response.status,
        "Server rejected record"
    );
    set_field(record, LAST_ERROR, Value::String(response.body.to_string()));
    ctx.store.update(soup, record, entry_id(record)?)?;
    Ok(UpOutcome::Failed)
}

/// Apply the response to a create.
pub(crate) fn on_create_response(
    ctx: &SyncContext<'_>,
    soup: &str,
    id_field: &str,
    record: &mut Value,
    response: &RestResponse,
) -> Result<UpOutcome> {
    if !response.is_success() {
        return record_failure(ctx, soup, record, response);
    }
    let Some(id) = created_id(response) else {
        return record_failure(ctx, soup, record, response);
    };
    set_field(record, id_field, Value::String(id.clone()));
    mark_clean(record);
    ctx.store.update(soup, record, entry_id(record)?)?;
    Ok(UpOutcome::Created(id))
}

/// Apply the response to a delete. A missing server record counts as deleted.
pub(crate) fn on_delete_response(
    ctx: &SyncContext<'_>,
    soup: &str,
    record: &mut Value,
    response: &RestResponse,
) -> Result<UpOutcome> {
    if response.is_success() || response.is_not_found() {
        ctx.store.delete(soup, &[entry_id(record)?])?;
        Ok(UpOutcome::Deleted)
    } else {
        record_failure(ctx, soup, record, response)
    }
}

fn create_record<S: UpServer + ?Sized>(
    server: &S,
    ctx: &SyncContext<'_>,
    soup: &str,
    record: &mut Value,
    object_type: &str,
    options: &SyncOptions,
) -> Result<UpOutcome> {
    let fields = fields_to_send(server, record, server.create_field_list(), options);
    let response = server.create_on_server(ctx, object_type, fields)?;
    on_create_response(ctx, soup, &server.fields().id_field_name, record, &response)
}

/// Apply the response to an update. Under overwrite, a record deleted on
/// the server is created again.
pub(crate) fn on_update_response<S: UpServer + ?Sized>(
    server: &S,
    ctx: &SyncContext<'_>,
    soup: &str,
    record: &mut Value,
    object_type: &str,
    response: &RestResponse,
    options: &SyncOptions,
) -> Result<UpOutcome> {
    if response.is_success() {
        mark_clean(record);
        ctx.store.update(soup, record, entry_id(record)?)?;
        Ok(UpOutcome::Updated)
    } else if response.is_not_found() && ctx.merge_mode == MergeMode::Overwrite {
        debug!(sync_id = ctx.sync_id, soup, "Record gone from server, creating it again");
        create_record(server, ctx, soup, record, object_type, options)
    } else {
        record_failure(ctx, soup, record, response)
    }
}

/// Whether leave-if-changed vetoes `action` for `record`.
pub(crate) fn blocked_by_merge_mode<S: UpServer + ?Sized>(
    server: &S,
    ctx: &SyncContext<'_>,
    record: &Value,
    action: UpAction,
) -> Result<bool> {
    if ctx.merge_mode != MergeMode::LeaveIfChanged || !matches!(action, UpAction::Update | UpAction::Delete) {
        return Ok(false);
    }
    Ok(!is_newer_than_server(server, ctx, record)?)
}

/// Upload one dirty record.
pub(crate) fn sync_up_one<S: UpServer + ?Sized>(
    server: &S,
    ctx: &SyncContext<'_>,
    soup: &str,
    record: &mut Value,
    options: &SyncOptions,
) -> Result<UpOutcome> {
    let action = UpAction::for_record(record);
    if action == UpAction::Skip {
        return Ok(UpOutcome::Skipped);
    }
    if action == UpAction::DeleteLocalOnly {
        ctx.store.delete(soup, &[entry_id(record)?])?;
        return Ok(UpOutcome::Deleted);
    }
    if blocked_by_merge_mode(server, ctx, record, action)? {
        info!(sync_id = ctx.sync_id, soup, "Server copy is newer, leaving record alone");
        return Ok(UpOutcome::Skipped);
    }

    let Some(object_type) = server.object_type(record) else {
        let response = RestResponse::new(0, Value::String("record has no object type".to_string()));
        return record_failure(ctx, soup, record, &response);
    };
    let id = record
        .get(&server.fields().id_field_name)
        .and_then(id_string)
        .unwrap_or_default();

    match action {
        UpAction::Create => create_record(server, ctx, soup, record, &object_type, options),
        UpAction::Update => {
            let fields = fields_to_send(server, record, server.update_field_list(), options);
            let response = server.update_on_server(ctx, &object_type, &id, fields)?;
            on_update_response(server, ctx, soup, record, &object_type, &response, options)
        }
        UpAction::Delete => {
            let response = server.delete_on_server(ctx, &object_type, &id)?;
            on_delete_response(ctx, soup, record, &response)
        }
        UpAction::DeleteLocalOnly | UpAction::Skip => Ok(UpOutcome::Skipped),
    }
}

/// Upload the records with the given entry ids one at a time.
pub(crate) fn sync_up_each<S: UpServer + ?Sized>(
    server: &S,
    ctx: &SyncContext<'_>,
    soup: &str,
    ids: &[i64],
    options: &SyncOptions,
) -> Result<()> {
    for mut record in ctx.store.retrieve(soup, ids)? {
        ctx.check_if_stopped()?;
        sync_up_one(server, ctx, soup, &mut record, options)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::model::{Order, QuerySpec};
    use crate::sync::rest::Method;
    use crate::sync::{mark_locally_created, mark_locally_deleted, mark_locally_updated};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn local(store: &crate::store::SmartStore, mut record: Value, mark: fn(&mut Value)) -> i64 {
        mark(&mut record);
        store.create("accounts", &record).unwrap()[SOUP_ENTRY_ID]
            .as_i64()
            .unwrap()
    }

    fn remote_ts(ts: Option<&str>) -> impl Fn(&crate::sync::rest::RestRequest) -> Result<RestResponse> + Send + Sync + 'static {
        let ts = ts.map(str::to_string);
        move |req| {
            assert!(soql_of(req).starts_with("SELECT Id, LastModifiedDate FROM Account WHERE Id = '001'"));
            Ok(match &ts {
                Some(ts) if ts == "missing" => records_response(Vec::new()),
                Some(ts) => records_response(vec![json!({"Id": "001", "LastModifiedDate": ts})]),
                None => records_response(vec![json!({"Id": "001"})]),
            })
        }
    }

    fn newer(record: &Value, server: Option<&str>) -> bool {
        let env = env_with(synced_store("accounts"), remote_ts(server));
        let stop = token();
        let ctx = env.context(1, MergeMode::LeaveIfChanged, &stop);
        is_newer_than_server(&StandardSyncUpTarget::for_type("Account"), &ctx, record).unwrap()
    }

    #[test]
    fn test_is_newer_than_server() {
        let at = |ts: &str| json!({"Id": "001", "LastModifiedDate": ts, "__local__": true, "__locally_updated__": true});

        assert!(newer(&at("2024-02-01T00:00:00.000Z"), Some("2024-01-01T00:00:00.000Z")));
        assert!(newer(&at("2024-01-01T00:00:00.000Z"), Some("2024-01-01T00:00:00.000Z")));
        assert!(!newer(&at("2024-01-01T00:00:00.000Z"), Some("2024-02-01T00:00:00.000Z")));
        // Server copy without a date, or gone while we still hold it.
        assert!(!newer(&at("2024-01-01T00:00:00.000Z"), None));
        assert!(!newer(&at("2024-01-01T00:00:00.000Z"), Some("missing")));

        let mut deleted = at("2024-01-01T00:00:00.000Z");
        deleted["__locally_deleted__"] = json!(true);
        assert!(newer(&deleted, Some("missing")));

        // No local date, or created offline: no server call needed.
        assert!(newer(&json!({"Id": "001"}), Some("2030-01-01T00:00:00.000Z")));
        let mut created = json!({"Name": "x"});
        mark_locally_created(&mut created, "Id");
        assert!(newer(&created, Some("2030-01-01T00:00:00.000Z")));
    }

    #[test]
    fn test_actions() {
        let mut record = json!({"Id": "001"});
        assert_eq!(UpAction::for_record(&record), UpAction::Skip);
        mark_locally_updated(&mut record);
        assert_eq!(UpAction::for_record(&record), UpAction::Update);
        mark_locally_deleted(&mut record);
        assert_eq!(UpAction::for_record(&record), UpAction::Delete);

        let mut offline = json!({});
        mark_locally_created(&mut offline, "Id");
        assert_eq!(UpAction::for_record(&offline), UpAction::Create);
        mark_locally_deleted(&mut offline);
        assert_eq!(UpAction::for_record(&offline), UpAction::DeleteLocalOnly);
    }

    #[test]
    fn test_fields_to_send() {
        let target = StandardSyncUpTarget::for_type("Account");
        let record = json!({
            "Id": "001", "LastModifiedDate": "x", "Name": "n", "Phone": "p",
            "attributes": {"type": "Account"}, "__local__": true, "_soupEntryId": 3
        });
        assert_eq!(
            fields_to_send(&target, &record, None, &SyncOptions::default()),
            json!({"Name": "n", "Phone": "p"})
        );
        let options = SyncOptions::with_fieldlist(MergeMode::Overwrite, vec!["Name".into(), "Id".into()]);
        assert_eq!(fields_to_send(&target, &record, None, &options), json!({"Name": "n"}));
        let list = vec!["Phone".to_string()];
        assert_eq!(fields_to_send(&target, &record, Some(&list), &options), json!({"Phone": "p"}));
    }

    #[test]
    fn test_sync_up_each_applies_outcomes() {
        let store = synced_store("accounts");
        let created = local(&store, json!({"Name": "new", "attributes": {"type": "Account"}}), |r| {
            mark_locally_created(r, "Id");
        });
        let updated = local(&store, json!({"Id": "002", "Name": "edit", "attributes": {"type": "Account"}}), mark_locally_updated);
        let deleted = local(&store, json!({"Id": "003", "attributes": {"type": "Account"}}), mark_locally_deleted);
        let rejected = local(&store, json!({"Id": "004", "attributes": {"type": "Account"}}), mark_locally_updated);

        let calls: Arc<Mutex<Vec<(Method, String)>>> = Arc::default();
        let log = Arc::clone(&calls);
        let env = env_with(Arc::clone(&store), move |req| {
            log.lock().unwrap().push((req.method, req.path.clone()));
            Ok(match (req.method, req.path.rsplit('/').next().unwrap_or_default()) {
                (Method::Post, "Account") => RestResponse::new(201, json!({"id": "001NEW", "success": true})),
                (Method::Patch, "004") => RestResponse::new(400, json!([{"errorCode": "FIELD_INTEGRITY_EXCEPTION"}])),
                (Method::Patch | Method::Delete, _) => RestResponse::new(204, serde_json::Value::Null),
                _ => RestResponse::new(500, serde_json::Value::Null),
            })
        });
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let target = StandardSyncUpTarget::default();

        sync_up_each(&target, &ctx, "accounts", &[created, updated, deleted, rejected], &SyncOptions::default())
            .unwrap();

        let by_id = |id: i64| store.retrieve("accounts", &[id]).unwrap().pop();
        let created = by_id(created).unwrap();
        assert_eq!(created["Id"], "001NEW");
        assert!(!is_dirty(&created));
        assert!(!is_dirty(&by_id(updated).unwrap()));
        assert!(by_id(deleted).is_none());
        let rejected = by_id(rejected).unwrap();
        assert!(is_dirty(&rejected));
        assert!(rejected[LAST_ERROR].as_str().unwrap().contains("FIELD_INTEGRITY_EXCEPTION"));
        assert_eq!(calls.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_update_of_deleted_server_record_recreates_under_overwrite() {
        let store = synced_store("accounts");
        let entry = local(&store, json!({"Id": "009", "Name": "gone", "attributes": {"type": "Account"}}), mark_locally_updated);
        let env = env_with(Arc::clone(&store), |req| {
            Ok(match req.method {
                Method::Patch => RestResponse::new(404, json!([{"errorCode": "NOT_FOUND"}])),
                Method::Post => {
                    assert_eq!(req.body.as_ref().unwrap(), &json!({"Name": "gone"}));
                    RestResponse::new(201, json!({"id": "010"}))
                }
                _ => RestResponse::new(500, serde_json::Value::Null),
            })
        });
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        sync_up_each(&StandardSyncUpTarget::default(), &ctx, "accounts", &[entry], &SyncOptions::default()).unwrap();

        let rows = store
            .query(&QuerySpec::exact("accounts", "Id", "010", Order::Ascending, 1), 0)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!is_dirty(&rows[0]));
    }

    #[test]
    fn test_leave_if_changed_skips_older_local_copy() {
        let store = synced_store("accounts");
        let entry = local(
            &store,
            json!({"Id": "001", "LastModifiedDate": "2024-01-01T00:00:00.000Z", "attributes": {"type": "Account"}}),
            mark_locally_updated,
        );
        let env = env_with(Arc::clone(&store), |req| {
            assert_eq!(req.method, Method::Get, "only the date lookup may reach the server");
            Ok(records_response(vec![json!({"Id": "001", "LastModifiedDate": "2024-06-01T00:00:00.000Z"})]))
        });
        let stop = token();
        let ctx = env.context(1, MergeMode::LeaveIfChanged, &stop);
        sync_up_each(&StandardSyncUpTarget::default(), &ctx, "accounts", &[entry], &SyncOptions::default()).unwrap();
        assert!(is_dirty(&store.retrieve("accounts", &[entry]).unwrap()[0]));
    }
}
