//! Sync engine.
//!
//! Downloads and uploads soup records through pluggable targets, tracking
//! per-record dirty state and persisting job descriptors in a reserved soup.
//!
//! # Layout
//!
//! - [`rest`]: transport trait and request builders
//! - [`state_store`]: `SyncState` persistence
//! - [`target`]: down/up target strategies
//! - [`job`]: single-job state machine
//! - [`manager`]: admission control and the worker thread

pub mod job;
pub mod manager;
pub mod rest;
pub mod state_store;
pub mod target;

pub use job::{GhostCallback, SyncCallback};
pub use manager::{ManagerState, SyncManager, SyncManagerRegistry};
pub use rest::{FnRestClient, HttpRestClient, Method, RestApi, RestClient, RestRequest, RestResponse};
pub use target::{SyncDownTarget, SyncUpTarget, TargetRegistry};

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::MergeMode;
use crate::store::SmartStore;

/// Record differs from the last known server state.
pub const LOCAL: &str = "__local__";
pub const LOCALLY_CREATED: &str = "__locally_created__";
pub const LOCALLY_UPDATED: &str = "__locally_updated__";
pub const LOCALLY_DELETED: &str = "__locally_deleted__";
/// Server error from the last failed upload of this record.
pub const LAST_ERROR: &str = "__last_error__";
/// Id of the down sync that last wrote this record.
pub const SYNC_ID: &str = "__sync_id__";

/// Prefix of ids assigned to records created offline.
pub const LOCAL_ID_PREFIX: &str = "local_";

/// Fresh id for a record created offline, replaced by the server id on upload.
#[must_use]
pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4().simple())
}

/// Whether `id` was assigned by [`new_local_id`].
#[must_use]
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Read a dirty flag; `true` and `"true"` both count.
#[must_use]
pub fn flag(record: &Value, name: &str) -> bool {
    match record.get(name) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

#[must_use]
pub fn is_dirty(record: &Value) -> bool {
    flag(record, LOCAL)
}

#[must_use]
pub fn is_locally_created(record: &Value) -> bool {
    flag(record, LOCALLY_CREATED)
}

#[must_use]
pub fn is_locally_updated(record: &Value) -> bool {
    flag(record, LOCALLY_UPDATED)
}

#[must_use]
pub fn is_locally_deleted(record: &Value) -> bool {
    flag(record, LOCALLY_DELETED)
}

fn set_flags(record: &mut Value, created: bool, updated: bool, deleted: bool) {
    if let Some(obj) = record.as_object_mut() {
        obj.insert(LOCAL.into(), (created || updated || deleted).into());
        obj.insert(LOCALLY_CREATED.into(), created.into());
        obj.insert(LOCALLY_UPDATED.into(), updated.into());
        obj.insert(LOCALLY_DELETED.into(), deleted.into());
    }
}

/// Flag a new offline record. Gives it a local id under `id_field` if it has none.
pub fn mark_locally_created(record: &mut Value, id_field: &str) {
    if record.get(id_field).is_none_or(Value::is_null) {
        if let Some(obj) = record.as_object_mut() {
            obj.insert(id_field.to_string(), new_local_id().into());
        }
    }
    set_flags(record, true, false, false);
}

/// Flag an offline edit. A record still awaiting creation stays created.
pub fn mark_locally_updated(record: &mut Value) {
    let created = is_locally_created(record);
    set_flags(record, created, true, false);
}

/// Flag an offline delete.
pub fn mark_locally_deleted(record: &mut Value) {
    let created = is_locally_created(record);
    let updated = is_locally_updated(record);
    set_flags(record, created, updated, true);
}

/// Clear every dirty flag and any recorded upload error.
pub fn mark_clean(record: &mut Value) {
    set_flags(record, false, false, false);
    if let Some(obj) = record.as_object_mut() {
        obj.remove(LAST_ERROR);
    }
}

/// Shared collaborators of every job run by one manager.
pub struct SyncEnv {
    pub store: Arc<SmartStore>,
    pub client: Arc<dyn RestClient>,
    pub api: RestApi,
    pub registry: Arc<TargetRegistry>,
}

impl SyncEnv {
    #[must_use]
    pub fn new(store: Arc<SmartStore>, client: Arc<dyn RestClient>, api: RestApi) -> Self {
        Self {
            store,
            client,
            api,
            registry: Arc::new(TargetRegistry::default()),
        }
    }

    /// Context for one run of sync `sync_id`.
    #[must_use]
    pub fn context<'a>(
        &'a self,
        sync_id: i64,
        merge_mode: MergeMode,
        stop: &'a CancellationToken,
    ) -> SyncContext<'a> {
        SyncContext {
            store: &self.store,
            client: self.client.as_ref(),
            api: &self.api,
            registry: &self.registry,
            sync_id,
            merge_mode,
            stop,
        }
    }
}

/// Everything a target needs while a job runs.
pub struct SyncContext<'a> {
    pub store: &'a SmartStore,
    pub client: &'a dyn RestClient,
    pub api: &'a RestApi,
    pub registry: &'a TargetRegistry,
    pub sync_id: i64,
    pub merge_mode: MergeMode,
    pub stop: &'a CancellationToken,
}

impl SyncContext<'_> {
    /// Send a request; any HTTP status is `Ok`.
    pub fn send(&self, request: &RestRequest) -> Result<RestResponse> {
        self.client.send(request)
    }

    /// Send a request and return the body of a 2xx response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Remote`] on any other status.
    pub fn send_ok(&self, request: &RestRequest) -> Result<Value> {
        Ok(self.send(request)?.into_result()?.body)
    }

    /// Fail with [`Error::SyncStopped`] once a stop has been requested.
    pub fn check_if_stopped(&self) -> Result<()> {
        if self.stop.is_cancelled() {
            Err(Error::SyncStopped)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dirty_flags() {
        let mut record = json!({"Name": "x"});
        mark_locally_created(&mut record, "Id");
        assert!(is_dirty(&record));
        assert!(is_locally_created(&record));
        assert!(is_local_id(record["Id"].as_str().unwrap()));

        mark_locally_updated(&mut record);
        assert!(is_locally_created(&record) && is_locally_updated(&record));

        mark_locally_deleted(&mut record);
        assert!(is_locally_deleted(&record));

        record[LAST_ERROR] = json!("boom");
        mark_clean(&mut record);
        assert!(!is_dirty(&record));
        assert!(record.get(LAST_ERROR).is_none());
    }

    #[test]
    fn test_flag_accepts_string_form() {
        assert!(flag(&json!({"__local__": "true"}), LOCAL));
        assert!(!flag(&json!({"__local__": "false"}), LOCAL));
        assert!(!flag(&json!({}), LOCAL));
    }

    #[test]
    fn test_mark_created_keeps_existing_id() {
        let mut record = json!({"Id": "001"});
        mark_locally_created(&mut record, "Id");
        assert_eq!(record["Id"], "001");
    }
}
