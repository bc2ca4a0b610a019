//! Application-defined targets.
//!
//! A custom target is persisted as data (`customType` plus free-form
//! `params`); the behavior lives in a handler registered under the same
//! name before the sync runs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::up::{remote_modification, StandardSyncUpTarget, UpServer};
use super::TargetFields;
use crate::error::{Error, Result};
use crate::model::UNKNOWN_TIME_STAMP;
use crate::sync::rest::RestResponse;
use crate::sync::SyncContext;

fn unknown() -> i64 {
    UNKNOWN_TIME_STAMP
}

/// Persisted form of a custom sync down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSyncDownTarget {
    pub custom_type: String,
    #[serde(flatten)]
    pub fields: TargetFields,
    #[serde(default)]
    pub params: Value,
    /// Set by the handler once known.
    #[serde(skip, default = "unknown")]
    pub total_size: i64,
    /// Handler-owned paging state.
    #[serde(skip)]
    pub cursor: Option<Value>,
}

impl CustomSyncDownTarget {
    #[must_use]
    pub fn new(custom_type: &str, params: Value) -> Self {
        Self {
            custom_type: custom_type.to_string(),
            fields: TargetFields::default(),
            params,
            total_size: UNKNOWN_TIME_STAMP,
            cursor: None,
        }
    }
}

/// Persisted form of a custom sync up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomSyncUpTarget {
    pub custom_type: String,
    #[serde(flatten)]
    pub base: StandardSyncUpTarget,
    #[serde(default)]
    pub params: Value,
}

impl CustomSyncUpTarget {
    #[must_use]
    pub fn new(custom_type: &str, params: Value) -> Self {
        Self {
            custom_type: custom_type.to_string(),
            base: StandardSyncUpTarget::default(),
            params,
        }
    }
}

/// Behavior of a custom sync down.
pub trait CustomSyncDownHandler: Send + Sync {
    /// First page of records modified after `max_time_stamp`.
    fn start_fetch(
        &self,
        ctx: &SyncContext<'_>,
        target: &mut CustomSyncDownTarget,
        max_time_stamp: i64,
    ) -> Result<Vec<Value>>;

    /// Next page, or `None` when done.
    fn continue_fetch(
        &self,
        ctx: &SyncContext<'_>,
        target: &mut CustomSyncDownTarget,
    ) -> Result<Option<Vec<Value>>>;

    /// Which of `local_ids` still exist remotely.
    fn get_remote_ids(
        &self,
        ctx: &SyncContext<'_>,
        target: &CustomSyncDownTarget,
        local_ids: &[String],
    ) -> Result<HashSet<String>>;

    fn is_sorted_by_latest_modification(&self, _target: &CustomSyncDownTarget) -> bool {
        false
    }
}

/// Behavior of a custom sync up. Every call defaults to the standard REST
/// request.
pub trait CustomSyncUpHandler: Send + Sync {
    fn create_on_server(
        &self,
        ctx: &SyncContext<'_>,
        _target: &CustomSyncUpTarget,
        object_type: &str,
        fields: Value,
    ) -> Result<RestResponse> {
        ctx.send(&ctx.api.create(object_type, fields))
    }

    fn update_on_server(
        &self,
        ctx: &SyncContext<'_>,
        _target: &CustomSyncUpTarget,
        object_type: &str,
        id: &str,
        fields: Value,
    ) -> Result<RestResponse> {
        ctx.send(&ctx.api.update(object_type, id, fields))
    }

    fn delete_on_server(
        &self,
        ctx: &SyncContext<'_>,
        _target: &CustomSyncUpTarget,
        object_type: &str,
        id: &str,
    ) -> Result<RestResponse> {
        ctx.send(&ctx.api.delete(object_type, id))
    }

    /// See [`remote_modification`].
    fn fetch_remote_modification(
        &self,
        ctx: &SyncContext<'_>,
        target: &CustomSyncUpTarget,
        object_type: &str,
        id: &str,
    ) -> Result<Option<Option<i64>>> {
        remote_modification(ctx, &target.base.fields, object_type, id)
    }
}

/// Custom target handlers, keyed by `customType`.
#[derive(Default)]
pub struct TargetRegistry {
    down: RwLock<HashMap<String, Arc<dyn CustomSyncDownHandler>>>,
    up: RwLock<HashMap<String, Arc<dyn CustomSyncUpHandler>>>,
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry").finish_non_exhaustive()
    }
}

impl TargetRegistry {
    /// Register (or replace) the handler for a custom sync down type.
    pub fn register_down(&self, custom_type: &str, handler: Arc<dyn CustomSyncDownHandler>) {
        debug!(custom_type, "Registering custom sync down handler");
        if let Ok(mut map) = self.down.write() {
            map.insert(custom_type.to_string(), handler);
        }
    }

    /// Register (or replace) the handler for a custom sync up type.
    pub fn register_up(&self, custom_type: &str, handler: Arc<dyn CustomSyncUpHandler>) {
        debug!(custom_type, "Registering custom sync up handler");
        if let Ok(mut map) = self.up.write() {
            map.insert(custom_type.to_string(), handler);
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownTargetType`] if nothing is registered.
    pub fn down_handler(&self, custom_type: &str) -> Result<Arc<dyn CustomSyncDownHandler>> {
        self.down
            .read()
            .ok()
            .and_then(|map| map.get(custom_type).cloned())
            .ok_or_else(|| Error::UnknownTargetType(custom_type.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownTargetType`] if nothing is registered.
    pub fn up_handler(&self, custom_type: &str) -> Result<Arc<dyn CustomSyncUpHandler>> {
        self.up
            .read()
            .ok()
            .and_then(|map| map.get(custom_type).cloned())
            .ok_or_else(|| Error::UnknownTargetType(custom_type.to_string()))
    }
}

/// A custom sync up target bound to its handler.
pub(crate) struct CustomServer<'a> {
    pub target: &'a CustomSyncUpTarget,
    pub handler: Arc<dyn CustomSyncUpHandler>,
}

impl UpServer for CustomServer<'_> {
    fn fields(&self) -> &TargetFields {
        &self.target.base.fields
    }

    fn object_type(&self, record: &Value) -> Option<String> {
        self.target.base.object_type(record)
    }

    fn create_field_list(&self) -> Option<&[String]> {
        self.target.base.create_field_list()
    }

    fn update_field_list(&self) -> Option<&[String]> {
        self.target.base.update_field_list()
    }

    fn create_on_server(&self, ctx: &SyncContext<'_>, object_type: &str, fields: Value) -> Result<RestResponse> {
        self.handler.create_on_server(ctx, self.target, object_type, fields)
    }

    fn update_on_server(
        &self,
        ctx: &SyncContext<'_>,
        object_type: &str,
        id: &str,
        fields: Value,
    ) -> Result<RestResponse> {
        self.handler.update_on_server(ctx, self.target, object_type, id, fields)
    }

    fn delete_on_server(&self, ctx: &SyncContext<'_>, object_type: &str, id: &str) -> Result<RestResponse> {
        self.handler.delete_on_server(ctx, self.target, object_type, id)
    }

    fn fetch_remote_modification(
        &self,
        ctx: &SyncContext<'_>,
        object_type: &str,
        id: &str,
    ) -> Result<Option<Option<i64>>> {
        self.handler.fetch_remote_modification(ctx, self.target, object_type, id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{SyncDownTarget, SyncUpTarget};
    use super::*;
    use crate::model::{MergeMode, SyncOptions};
    use crate::store::SOUP_ENTRY_ID;
    use crate::sync::{is_dirty, mark_locally_created};
    use serde_json::json;

    /// Serves `params.pages` one page at a time.
    struct Paged;

    impl CustomSyncDownHandler for Paged {
        fn start_fetch(
            &self,
            ctx: &SyncContext<'_>,
            target: &mut CustomSyncDownTarget,
            _max_time_stamp: i64,
        ) -> Result<Vec<Value>> {
            target.total_size = 3;
            target.cursor = Some(json!(0));
            Ok(self.continue_fetch(ctx, target)?.unwrap_or_default())
        }

        fn continue_fetch(
            &self,
            _ctx: &SyncContext<'_>,
            target: &mut CustomSyncDownTarget,
        ) -> Result<Option<Vec<Value>>> {
            let Some(index) = target.cursor.as_ref().and_then(Value::as_u64) else {
                return Ok(None);
            };
            let page = target.params["pages"].get(usize::try_from(index).unwrap()).cloned();
            target.cursor = page.as_ref().map(|_| json!(index + 1));
            Ok(page.and_then(|p| p.as_array().cloned()))
        }

        fn get_remote_ids(
            &self,
            _ctx: &SyncContext<'_>,
            _target: &CustomSyncDownTarget,
            _local_ids: &[String],
        ) -> Result<HashSet<String>> {
            Ok(HashSet::new())
        }
    }

    struct Echo;

    impl CustomSyncUpHandler for Echo {
        fn create_on_server(
            &self,
            _ctx: &SyncContext<'_>,
            target: &CustomSyncUpTarget,
            _object_type: &str,
            fields: Value,
        ) -> Result<RestResponse> {
            Ok(RestResponse::new(
                201,
                json!({"id": format!("{}-{}", target.params["prefix"].as_str().unwrap_or(""), fields["Name"].as_str().unwrap_or(""))}),
            ))
        }
    }

    #[test]
    fn test_unregistered_type_fails() {
        let env = env_with(synced_store("things"), |_| Ok(records_response(Vec::new())));
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let mut target = SyncDownTarget::Custom(CustomSyncDownTarget::new("nope", Value::Null));
        assert!(matches!(
            target.start_fetch(&ctx, "things", -1),
            Err(Error::UnknownTargetType(kind)) if kind == "nope"
        ));
    }

    #[test]
    fn test_custom_down_pages() {
        let env = env_with(synced_store("things"), |_| Ok(records_response(Vec::new())));
        env.registry.register_down("paged", Arc::new(Paged));
        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let mut target = SyncDownTarget::Custom(CustomSyncDownTarget::new(
            "paged",
            json!({"pages": [[{"Id": "1"}, {"Id": "2"}], [{"Id": "3"}]]}),
        ));

        assert_eq!(target.start_fetch(&ctx, "things", -1).unwrap().len(), 2);
        assert_eq!(target.total_size(), 3);
        assert_eq!(target.continue_fetch(&ctx, "things").unwrap().unwrap().len(), 1);
        assert!(target.continue_fetch(&ctx, "things").unwrap().is_none());
    }

    #[test]
    fn test_custom_up_uses_handler() {
        let store = synced_store("things");
        let env = env_with(Arc::clone(&store), |_| panic!("handler should answer"));
        env.registry.register_up("echo", Arc::new(Echo));
        let mut record = json!({"Name": "widget"});
        mark_locally_created(&mut record, "Id");
        let entry = store.create("things", &record).unwrap()[SOUP_ENTRY_ID].as_i64().unwrap();

        let stop = token();
        let ctx = env.context(1, MergeMode::Overwrite, &stop);
        let mut custom = CustomSyncUpTarget::new("echo", json!({"prefix": "x"}));
        custom.base.sobject_type = Some("Widget".to_string());
        SyncUpTarget::Custom(custom)
            .sync_up_records(&ctx, "things", &[entry], &SyncOptions::default())
            .unwrap();

        let stored = &store.retrieve("things", &[entry]).unwrap()[0];
        assert_eq!(stored["Id"], "x-widget");
        assert!(!is_dirty(stored));
    }
}
