//! Query specifications.
//!
//! A `QuerySpec` describes how to read a soup. Every variant except `Smart`
//! is lowered to a logical query string (with `{soup}` / `{soup:path}`
//! placeholders) plus bind arguments; the store compiles that string the same
//! way it compiles a caller-supplied smart query.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::SOUP_ENTRY_ID;

/// Default number of rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Kind of query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    All,
    Exact,
    Range,
    Like,
    Smart,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

impl Order {
    /// SQL keyword for this direction.
    #[must_use]
    pub const fn sql(&self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

/// A query against one soup (or, for smart queries, any set of soups).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    pub query_type: QueryType,
    pub soup_name: Option<String>,
    pub path: Option<String>,
    pub match_key: Option<Value>,
    pub begin_key: Option<Value>,
    pub end_key: Option<Value>,
    pub like_key: Option<String>,
    pub order_path: Option<String>,
    pub order: Order,
    pub page_size: usize,
    pub smart_sql: Option<String>,
}

impl QuerySpec {
    fn base(query_type: QueryType, soup: Option<&str>, page_size: usize) -> Self {
        Self {
            query_type,
            soup_name: soup.map(str::to_string),
            path: None,
            match_key: None,
            begin_key: None,
            end_key: None,
            like_key: None,
            order_path: None,
            order: Order::Ascending,
            page_size: page_size.max(1),
            smart_sql: None,
        }
    }

    /// Full scan ordered on `order_path` (entry id when `None`).
    #[must_use]
    pub fn all(soup: &str, order_path: Option<&str>, order: Order, page_size: usize) -> Self {
        let mut spec = Self::base(QueryType::All, Some(soup), page_size);
        spec.order_path = order_path.map(str::to_string);
        spec.order = order;
        spec
    }

    /// Equality on one index path.
    #[must_use]
    pub fn exact(
        soup: &str,
        path: &str,
        match_key: impl Into<Value>,
        order: Order,
        page_size: usize,
    ) -> Self {
        let mut spec = Self::base(QueryType::Exact, Some(soup), page_size);
        spec.path = Some(path.to_string());
        spec.match_key = Some(match_key.into());
        spec.order = order;
        spec
    }

    /// Inclusive bounds on one index path. A `None` bound is open.
    #[must_use]
    pub fn range(
        soup: &str,
        path: &str,
        begin_key: Option<Value>,
        end_key: Option<Value>,
        order: Order,
        page_size: usize,
    ) -> Self {
        let mut spec = Self::base(QueryType::Range, Some(soup), page_size);
        spec.path = Some(path.to_string());
        spec.begin_key = begin_key;
        spec.end_key = end_key;
        spec.order = order;
        spec
    }

    /// SQL `LIKE` over one index path. The pattern is used exactly as given.
    #[must_use]
    pub fn like(soup: &str, path: &str, like_key: &str, order: Order, page_size: usize) -> Self {
        let mut spec = Self::base(QueryType::Like, Some(soup), page_size);
        spec.path = Some(path.to_string());
        spec.like_key = Some(like_key.to_string());
        spec.order = order;
        spec
    }

    /// Arbitrary logical query.
    #[must_use]
    pub fn smart(smart_sql: &str, page_size: usize) -> Self {
        let mut spec = Self::base(QueryType::Smart, None, page_size);
        spec.smart_sql = Some(smart_sql.to_string());
        spec
    }

    /// Order on a path other than the filtered one.
    #[must_use]
    pub fn with_order_path(mut self, order_path: &str) -> Self {
        self.order_path = Some(order_path.to_string());
        self
    }

    /// Path results are ordered on.
    ///
    /// Defaults to the filtered path, and to the entry id for full scans.
    #[must_use]
    pub fn effective_order_path(&self) -> &str {
        self.order_path
            .as_deref()
            .or(self.path.as_deref())
            .unwrap_or(SOUP_ENTRY_ID)
    }

    /// First row of the window for a zero-based page index.
    ///
    /// Saturates at `i64::MAX`, the largest OFFSET SQLite accepts.
    #[must_use]
    pub fn offset(&self, page_index: usize) -> usize {
        let max = usize::try_from(i64::MAX).unwrap_or(usize::MAX);
        page_index.saturating_mul(self.page_size).min(max)
    }

    /// Lower this spec to a logical query and its bind arguments.
    ///
    /// The returned query has no LIMIT clause; paging is applied at execution.
    #[must_use]
    pub fn to_smart_sql(&self) -> (String, Vec<Value>) {
        self.lower("_soup")
    }

    /// Like [`QuerySpec::to_smart_sql`] but selecting entry ids.
    ///
    /// Smart specs are returned unchanged; their query must already select
    /// `_soupEntryId`.
    #[must_use]
    pub fn to_id_smart_sql(&self) -> (String, Vec<Value>) {
        self.lower(SOUP_ENTRY_ID)
    }

    fn lower(&self, select_path: &str) -> (String, Vec<Value>) {
        if self.query_type == QueryType::Smart {
            return (self.smart_sql.clone().unwrap_or_default(), Vec::new());
        }

        let soup = self.soup_name.as_deref().unwrap_or_default();
        let path = self.path.as_deref().unwrap_or(SOUP_ENTRY_ID);
        let mut args = Vec::new();
        let mut sql = format!("SELECT {{{soup}:{select_path}}} FROM {{{soup}}}");

        match self.query_type {
            QueryType::Exact => {
                sql.push_str(&format!(" WHERE {{{soup}:{path}}} = ?"));
                args.push(self.match_key.clone().unwrap_or(Value::Null));
            }
            QueryType::Range => {
                let mut conditions = Vec::new();
                if let Some(begin) = &self.begin_key {
                    conditions.push(format!("{{{soup}:{path}}} >= ?"));
                    args.push(begin.clone());
                }
                if let Some(end) = &self.end_key {
                    conditions.push(format!("{{{soup}:{path}}} <= ?"));
                    args.push(end.clone());
                }
                if !conditions.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&conditions.join(" AND "));
                }
            }
            QueryType::Like => {
                sql.push_str(&format!(" WHERE {{{soup}:{path}}} LIKE ?"));
                args.push(Value::String(self.like_key.clone().unwrap_or_default()));
            }
            QueryType::All | QueryType::Smart => {}
        }

        let order_path = self.effective_order_path();
        let dir = self.order.sql();
        sql.push_str(&format!(" ORDER BY {{{soup}:{order_path}}} {dir}"));
        if order_path != SOUP_ENTRY_ID {
            sql.push_str(&format!(", {{{soup}:{SOUP_ENTRY_ID}}} {dir}"));
        }

        (sql, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_lowering() {
        let spec = QuerySpec::exact("accounts", "Name", "Acme", Order::Ascending, 10);
        let (sql, args) = spec.to_smart_sql();
        assert_eq!(
            sql,
            "SELECT {accounts:_soup} FROM {accounts} WHERE {accounts:Name} = ? \
             ORDER BY {accounts:Name} ASC, {accounts:_soupEntryId} ASC"
        );
        assert_eq!(args, vec![json!("Acme")]);
    }

    #[test]
    fn test_open_range_has_no_where() {
        let spec = QuerySpec::range("s", "key", None, None, Order::Descending, 5);
        let (sql, args) = spec.to_smart_sql();
        assert!(!sql.contains("WHERE"));
        assert!(sql.ends_with("ORDER BY {s:key} DESC, {s:_soupEntryId} DESC"));
        assert!(args.is_empty());
    }

    #[test]
    fn test_all_orders_on_entry_id_without_tiebreak() {
        let spec = QuerySpec::all("s", None, Order::Ascending, 5);
        let (sql, _) = spec.to_smart_sql();
        assert_eq!(sql, "SELECT {s:_soup} FROM {s} ORDER BY {s:_soupEntryId} ASC");
    }

    #[test]
    fn test_id_lowering_selects_entry_ids() {
        let spec = QuerySpec::like("s", "name", "a%", Order::Ascending, 5);
        let (sql, args) = spec.to_id_smart_sql();
        assert!(sql.starts_with("SELECT {s:_soupEntryId} FROM {s} WHERE {s:name} LIKE ?"));
        assert_eq!(args, vec![json!("a%")]);
    }

    #[test]
    fn test_page_window() {
        let spec = QuerySpec::all("s", None, Order::Ascending, 25);
        assert_eq!(spec.offset(0), 0);
        assert_eq!(spec.offset(3), 75);
        assert_eq!(spec.offset(usize::MAX), usize::try_from(i64::MAX).unwrap());
    }
}
