//! Sync down of the most recently viewed records of one object type.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::soql::{fetch_page, soql_quote_list};
use super::{id_string, TargetFields};
use crate::error::Result;
use crate::model::UNKNOWN_TIME_STAMP;
use crate::sync::SyncContext;

fn unknown() -> i64 {
    UNKNOWN_TIME_STAMP
}

/// Fetches the recently viewed list, then the records on it.
///
/// Always fetches the whole list; the high-water mark is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MruSyncDownTarget {
    #[serde(flatten)]
    pub fields: TargetFields,
    pub sobject_type: String,
    #[serde(default)]
    pub field_list: Vec<String>,
    #[serde(skip, default = "unknown")]
    pub(crate) total_size: i64,
}

impl MruSyncDownTarget {
    #[must_use]
    pub fn new(sobject_type: &str, field_list: Vec<String>) -> Self {
        Self {
            fields: TargetFields::default(),
            sobject_type: sobject_type.to_string(),
            field_list,
            total_size: UNKNOWN_TIME_STAMP,
        }
    }

    /// Ids on the recently viewed list, most recent first.
    fn recent_ids(&self, ctx: &SyncContext<'_>) -> Result<Vec<String>> {
        let body = ctx.send_ok(&ctx.api.recently_viewed(&self.sobject_type))?;
        Ok(body
            .get("recentItems")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get(&self.fields.id_field_name))
                    .filter_map(id_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn select_list(&self) -> String {
        let mut fields = vec![self.fields.id_field_name.clone()];
        for field in &self.field_list {
            if !fields.iter().any(|f| f.eq_ignore_ascii_case(field)) {
                fields.push(field.clone());
            }
        }
        fields.join(", ")
    }

    pub(crate) fn start_fetch(&mut self, ctx: &SyncContext<'_>) -> Result<Vec<Value>> {
        let ids = self.recent_ids(ctx)?;
        debug!(sync_id = ctx.sync_id, sobject_type = %self.sobject_type, count = ids.len(), "Recently viewed");
        if ids.is_empty() {
            self.total_size = 0;
            return Ok(Vec::new());
        }
        let soql = format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            self.select_list(),
            self.sobject_type,
            self.fields.id_field_name,
            soql_quote_list(&ids)
        );
        let mut page = fetch_page(ctx, &ctx.api.query(&soql))?;
        let mut records = std::mem::take(&mut page.records);
        while let Some(next) = page.next() {
            ctx.check_if_stopped()?;
            page = fetch_page(ctx, &ctx.api.query_more(&next))?;
            records.append(&mut page.records);
        }
        self.total_size = i64::try_from(records.len()).unwrap_or(i64::MAX);
        Ok(records)
    }

    pub(crate) fn get_remote_ids(&self, ctx: &SyncContext<'_>, local_ids: &[String]) -> Result<HashSet<String>> {
        let recent: HashSet<String> = self.recent_ids(ctx)?.into_iter().collect();
        Ok(local_ids
            .iter()
            .filter(|id| recent.contains(*id))
            .cloned()
            .collect())
    }
}
