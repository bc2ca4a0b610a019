//! Query-driven sync down, plus the SOQL text helpers other targets share.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{format_timestamp, id_string, TargetFields};
use crate::error::Result;
use crate::model::UNKNOWN_TIME_STAMP;
use crate::sync::rest::RestRequest;
use crate::sync::SyncContext;

fn unknown() -> i64 {
    UNKNOWN_TIME_STAMP
}

/// Clauses that end a WHERE clause.
const TRAILING_CLAUSES: [&str; 4] = ["GROUP BY", "ORDER BY", "LIMIT", "OFFSET"];

/// One page of a query response.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryPage {
    #[serde(default)]
    pub total_size: i64,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default)]
    pub next_records_url: Option<String>,
}

impl QueryPage {
    /// Cursor for the next page, if the server reported one.
    pub fn next(&self) -> Option<String> {
        if self.done {
            None
        } else {
            self.next_records_url.clone()
        }
    }
}

/// Send a query request and parse the page.
pub(crate) fn fetch_page(ctx: &SyncContext<'_>, request: &RestRequest) -> Result<QueryPage> {
    let body = ctx.send_ok(request)?;
    Ok(serde_json::from_value(body)?)
}

/// Every `id_field` value returned by `soql`, following `nextRecordsUrl`.
pub(crate) fn fetch_all_ids(ctx: &SyncContext<'_>, soql: &str, id_field: &str) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    let mut page = fetch_page(ctx, &ctx.api.query(soql))?;
    loop {
        ids.extend(page.records.iter().filter_map(|r| r.get(id_field)).filter_map(id_string));
        let Some(next) = page.next() else { break };
        ctx.check_if_stopped()?;
        page = fetch_page(ctx, &ctx.api.query_more(&next))?;
    }
    Ok(ids)
}

/// Syncs down whatever a SOQL query returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoqlSyncDownTarget {
    #[serde(flatten)]
    pub fields: TargetFields,
    pub query: String,
    #[serde(skip)]
    next_records_url: Option<String>,
    #[serde(skip, default = "unknown")]
    pub(crate) total_size: i64,
}

impl SoqlSyncDownTarget {
    #[must_use]
    pub fn new(query: &str) -> Self {
        Self::with_fields(query, TargetFields::default())
    }

    #[must_use]
    pub fn with_fields(query: &str, fields: TargetFields) -> Self {
        Self {
            fields,
            query: query.trim().to_string(),
            next_records_url: None,
            total_size: UNKNOWN_TIME_STAMP,
        }
    }

    /// Query actually sent for a fetch starting at `max_time_stamp`.
    #[must_use]
    pub fn effective_query(&self, max_time_stamp: i64) -> String {
        let query = ensure_fields(
            &self.query,
            &[
                self.fields.id_field_name.as_str(),
                self.fields.modification_date_field_name.as_str(),
            ],
        );
        if max_time_stamp > 0 {
            add_modification_filter(&query, &self.fields.modification_date_field_name, max_time_stamp)
        } else {
            query
        }
    }

    pub(crate) fn start_fetch(&mut self, ctx: &SyncContext<'_>, max_time_stamp: i64) -> Result<Vec<Value>> {
        let query = self.effective_query(max_time_stamp);
        debug!(sync_id = ctx.sync_id, query = %query, "Starting fetch");
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

    /// True when the query orders by the modification field, ascending.
    #[must_use]
    pub fn is_sorted_by_latest_modification(&self) -> bool {
        let Some(pos) = find_keyword(&self.query, "ORDER BY") else {
            return false;
        };
        let mut tokens = self.query[pos + "ORDER BY".len()..]
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty());
        let Some(first) = tokens.next() else {
            return false;
        };
        first.eq_ignore_ascii_case(&self.fields.modification_date_field_name)
            && !tokens.next().is_some_and(|t| t.eq_ignore_ascii_case("DESC"))
    }

    pub(crate) fn get_remote_ids(&self, ctx: &SyncContext<'_>, local_ids: &[String]) -> Result<HashSet<String>> {
        let id_field = &self.fields.id_field_name;
        let soql = id_only_query(&self.query, id_field);
        let remote = fetch_all_ids(ctx, &soql, id_field)?;
        Ok(local_ids
            .iter()
            .filter(|id| remote.contains(*id))
            .cloned()
            .collect())
    }
}

// ==================
// SOQL text helpers
// ==================

/// Byte offset of `keyword` at paren depth 0 outside string literals.
///
/// Matching is case-insensitive and on word boundaries; `keyword` must be
/// ASCII with single spaces.
#[must_use]
pub fn find_keyword(soql: &str, keyword: &str) -> Option<usize> {
    let bytes = soql.as_bytes();
    let kw = keyword.as_bytes();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_quote {
            match b {
                b'\\' => i += 1,
                b'\'' => in_quote = false,
                _ => {}
            }
        } else {
            match b {
                b'\'' => in_quote = true,
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                _ if depth == 0
                    && bytes.len() - i >= kw.len()
                    && bytes[i..i + kw.len()].eq_ignore_ascii_case(kw)
                    && (i == 0 || !is_word_byte(bytes[i - 1]))
                    && bytes.get(i + kw.len()).is_none_or(|&next| !is_word_byte(next)) =>
                {
                    return Some(i);
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// Offset where the WHERE clause (or the FROM tail) ends.
fn where_clause_end(soql: &str) -> usize {
    TRAILING_CLAUSES
        .iter()
        .filter_map(|kw| find_keyword(soql, kw))
        .min()
        .unwrap_or(soql.len())
}

/// Restrict `soql` to records modified after `max_time_stamp`.
///
/// An existing top-level WHERE is parenthesized and AND-ed with the filter.
#[must_use]
pub fn add_modification_filter(soql: &str, field: &str, max_time_stamp: i64) -> String {
    let filter = format!("{field} > {}", format_timestamp(max_time_stamp));
    let end = where_clause_end(soql);
    let (head, tail) = soql.split_at(end);
    let tail = tail.trim();

    let filtered = match find_keyword(head, "WHERE") {
        Some(pos) => {
            let condition = head[pos + "WHERE".len()..].trim();
            format!("{} WHERE ({condition}) AND {filter}", head[..pos].trim_end())
        }
        None => format!("{} WHERE {filter}", head.trim_end()),
    };
    if tail.is_empty() {
        filtered
    } else {
        format!("{filtered} {tail}")
    }
}

/// Split on commas at paren depth 0.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(list[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(list[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Make sure the select list contains every field in `required`.
#[must_use]
pub fn ensure_fields(soql: &str, required: &[&str]) -> String {
    let (Some(select), Some(from)) = (find_keyword(soql, "SELECT"), find_keyword(soql, "FROM")) else {
        return soql.to_string();
    };
    if from <= select {
        return soql.to_string();
    }
    let existing = split_top_level(&soql[select + "SELECT".len()..from]);
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|field| !existing.iter().any(|e| e.eq_ignore_ascii_case(field)))
        .collect();
    if missing.is_empty() {
        return soql.to_string();
    }
    let fields: Vec<&str> = missing.into_iter().chain(existing).collect();
    format!(
        "{}SELECT {} {}",
        &soql[..select],
        fields.join(", "),
        &soql[from..]
    )
}

/// Same FROM and WHERE as `soql`, selecting only `id_field`.
#[must_use]
pub fn id_only_query(soql: &str, id_field: &str) -> String {
    let Some(from) = find_keyword(soql, "FROM") else {
        return soql.to_string();
    };
    let end = where_clause_end(soql).max(from);
    format!("SELECT {id_field} {}", soql[from..end].trim_end())
}

/// `'a', 'b'` with SOQL quoting.
#[must_use]
pub fn soql_quote_list(ids: &[String]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", id.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect::<Vec<_>>()
        .join(", ")
}
