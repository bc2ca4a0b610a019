//! Re-fetch from the server the records already present in a soup.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::soql::{fetch_all_ids, fetch_page, soql_quote_list};
use super::{format_timestamp, id_string, query_first_column, TargetFields};
use crate::error::Result;
use crate::model::UNKNOWN_TIME_STAMP;
use crate::store::SOUP_ENTRY_ID;
use crate::sync::{is_local_id, SyncContext};

/// Ids per `IN (...)` list when none is configured.
pub const DEFAULT_COUNT_IDS_PER_SOQL: usize = 500;
const MAX_COUNT_IDS_PER_SOQL: usize = 2000;

fn unknown() -> i64 {
    UNKNOWN_TIME_STAMP
}

fn default_count() -> usize {
    DEFAULT_COUNT_IDS_PER_SOQL
}

/// Pages through the ids of a soup and fetches those records again.
///
/// On a resync only records modified after the high-water mark come back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSyncDownTarget {
    #[serde(flatten)]
    pub fields: TargetFields,
    pub sobject_type: String,
    #[serde(default)]
    pub field_list: Vec<String>,
    pub soup_name: String,
    #[serde(default = "default_count")]
    pub count_ids_per_soql: usize,
    #[serde(skip, default = "unknown")]
    pub(crate) total_size: i64,
    #[serde(skip)]
    pending_ids: Vec<String>,
    #[serde(skip)]
    max_time_stamp: i64,
}

impl RefreshSyncDownTarget {
    #[must_use]
    pub fn new(sobject_type: &str, field_list: Vec<String>, soup_name: &str) -> Self {
        Self {
            fields: TargetFields::default(),
            sobject_type: sobject_type.to_string(),
            field_list,
            soup_name: soup_name.to_string(),
            count_ids_per_soql: DEFAULT_COUNT_IDS_PER_SOQL,
            total_size: UNKNOWN_TIME_STAMP,
            pending_ids: Vec::new(),
            max_time_stamp: 0,
        }
    }

    fn chunk_size(&self) -> usize {
        self.count_ids_per_soql.clamp(1, MAX_COUNT_IDS_PER_SOQL)
    }

    fn soup<'a>(&'a self, soup: &'a str) -> &'a str {
        if self.soup_name.is_empty() { soup } else { &self.soup_name }
    }

    fn select_list(&self) -> String {
        let mut fields = vec![
            self.fields.id_field_name.clone(),
            self.fields.modification_date_field_name.clone(),
        ];
        for field in &self.field_list {
            if !fields.iter().any(|f| f.eq_ignore_ascii_case(field)) {
                fields.push(field.clone());
            }
        }
        fields.join(", ")
    }

    /// Server ids in the soup, skipping records never uploaded.
    fn local_server_ids(&self, ctx: &SyncContext<'_>, soup: &str) -> Result<Vec<String>> {
        let id_field = &self.fields.id_field_name;
        let sql = format!("SELECT {{{soup}:{id_field}}} FROM {{{soup}}} ORDER BY {{{soup}:{SOUP_ENTRY_ID}}}");
        Ok(query_first_column(ctx.store, &sql)?
            .iter()
            .filter_map(id_string)
            .filter(|id| !is_local_id(id))
            .collect())
    }

    fn fetch_next_chunk(&mut self, ctx: &SyncContext<'_>) -> Result<Option<Vec<Value>>> {
        if self.pending_ids.is_empty() {
            return Ok(None);
        }
        let take = self.chunk_size().min(self.pending_ids.len());
        let chunk: Vec<String> = self.pending_ids.drain(..take).collect();

        let mut soql = format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            self.select_list(),
            self.sobject_type,
            self.fields.id_field_name,
            soql_quote_list(&chunk)
        );
        if self.max_time_stamp > 0 {
            soql.push_str(&format!(
                " AND {} > {}",
                self.fields.modification_date_field_name,
                format_timestamp(self.max_time_stamp)
            ));
        }

        let mut page = fetch_page(ctx, &ctx.api.query(&soql))?;
        let mut records = std::mem::take(&mut page.records);
        while let Some(next) = page.next() {
            page = fetch_page(ctx, &ctx.api.query_more(&next))?;
            records.append(&mut page.records);
        }
        Ok(Some(records))
    }

    pub(crate) fn start_fetch(
        &mut self,
        ctx: &SyncContext<'_>,
        soup: &str,
        max_time_stamp: i64,
    ) -> Result<Vec<Value>> {
        let soup = self.soup(soup).to_string();
        self.pending_ids = self.local_server_ids(ctx, &soup)?;
        self.total_size = i64::try_from(self.pending_ids.len()).unwrap_or(i64::MAX);
        self.max_time_stamp = max_time_stamp;
        debug!(sync_id = ctx.sync_id, soup = %soup, ids = self.pending_ids.len(), "Refreshing soup");
        Ok(self.fetch_next_chunk(ctx)?.unwrap_or_default())
    }

    pub(crate) fn continue_fetch(&mut self, ctx: &SyncContext<'_>, _soup: &str) -> Result<Option<Vec<Value>>> {
        self.fetch_next_chunk(ctx)
    }

    pub(crate) fn get_remote_ids(&self, ctx: &SyncContext<'_>, local_ids: &[String]) -> Result<HashSet<String>> {
        let id_field = &self.fields.id_field_name;
        let mut remote = HashSet::new();
        for chunk in local_ids.chunks(self.chunk_size()) {
            ctx.check_if_stopped()?;
            let soql = format!(
                "SELECT {id_field} FROM {} WHERE {id_field} IN ({})",
                self.sobject_type,
                soql_quote_list(chunk)
            );
            remote.extend(fetch_all_ids(ctx, &soql, id_field)?);
        }
        Ok(remote)
    }
}
