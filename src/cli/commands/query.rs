//! Query command implementation.

use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

use super::{open_existing, parse_value, print_json};
use crate::cli::{QueryArgs, QueryKind};
use crate::error::Result;
use crate::model::QuerySpec;

#[derive(Serialize)]
struct QueryOutput {
    rows: Vec<Value>,
    count: usize,
    page: usize,
}

fn build_spec(kind: &QueryKind, page_size: usize) -> QuerySpec {
    let (spec, order_path) = match kind {
        QueryKind::All { soup, order_path, order } => {
            (QuerySpec::all(soup, order_path.as_deref(), (*order).into(), page_size), None)
        }
        QueryKind::Exact { soup, path, value, order_path, order } => (
            QuerySpec::exact(soup, path, parse_value(value), (*order).into(), page_size),
            order_path.as_deref(),
        ),
        QueryKind::Range { soup, path, begin, end, order_path, order } => (
            QuerySpec::range(
                soup,
                path,
                begin.as_deref().map(parse_value),
                end.as_deref().map(parse_value),
                (*order).into(),
                page_size,
            ),
            order_path.as_deref(),
        ),
        QueryKind::Like { soup, path, pattern, order_path, order } => (
            QuerySpec::like(soup, path, pattern, (*order).into(), page_size),
            order_path.as_deref(),
        ),
        QueryKind::Smart { sql } => (QuerySpec::smart(sql, page_size), None),
    };
    match order_path {
        Some(path) => spec.with_order_path(path),
        None => spec,
    }
}

/// Execute the query command.
pub fn execute(args: &QueryArgs, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let store = open_existing(db_path)?;
    let spec = build_spec(&args.kind, args.page_size);

    if args.count {
        let count = store.count_query(&spec)?;
        if json {
            return print_json(&serde_json::json!({ "count": count }));
        }
        println!("{count}");
        return Ok(());
    }

    let rows = store.query(&spec, args.page)?;
    if json {
        return print_json(&QueryOutput {
            count: rows.len(),
            page: args.page,
            rows,
        });
    }
    if rows.is_empty() {
        println!("No results.");
    }
    for row in &rows {
        println!("{}", serde_json::to_string(row)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::SortOrder;
    use crate::model::{Order, QueryType};
    use serde_json::json;

    #[test]
    fn test_exact_value_parsed_as_json() {
        let kind = QueryKind::Exact {
            soup: "contacts".to_string(),
            path: "age".to_string(),
            value: "42".to_string(),
            order_path: Some("name".to_string()),
            order: SortOrder::Desc,
        };
        let spec = build_spec(&kind, 20);
        assert_eq!(spec.query_type, QueryType::Exact);
        assert_eq!(spec.match_key, Some(json!(42)));
        assert_eq!(spec.order, Order::Descending);
        assert_eq!(spec.effective_order_path(), "name");
        assert_eq!(spec.page_size, 20);
    }

    #[test]
    fn test_range_bounds_optional() {
        let kind = QueryKind::Range {
            soup: "contacts".to_string(),
            path: "age".to_string(),
            begin: Some("18".to_string()),
            end: None,
            order_path: None,
            order: SortOrder::Asc,
        };
        let spec = build_spec(&kind, 10);
        assert_eq!(spec.begin_key, Some(json!(18)));
        assert_eq!(spec.end_key, None);
    }
}
