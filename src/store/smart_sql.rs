//! Logical query compiler.
//!
//! A logical query is SQL in which `{soup}` stands for a soup's table and
//! `{soup:path}` for the column or expression holding `path`. Everything
//! outside braces, and anything inside single-quoted literals, is copied
//! through unchanged.

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::store::catalog::IndexCatalog;

/// Compile a logical query into executable SQL.
///
/// # Errors
///
/// - [`Error::SoupNotFound`] for an unknown soup
/// - [`Error::PathNotIndexed`] for a path that is neither managed nor indexed
/// - [`Error::InvalidQuery`] for unbalanced or empty placeholders
pub fn compile(catalog: &IndexCatalog, conn: &Connection, smart_sql: &str) -> Result<String> {
    let mut out = String::with_capacity(smart_sql.len());
    let mut chars = smart_sql.char_indices();
    let mut in_literal = false;

    while let Some((pos, c)) = chars.next() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '{' if !in_literal => {
                let rest = &smart_sql[pos + 1..];
                let end = rest.find(['}', '{']).filter(|&i| rest[i..].starts_with('}'));
                let Some(end) = end else {
                    return Err(Error::InvalidQuery(format!(
                        "unbalanced '{{' at offset {pos}"
                    )));
                };
                out.push_str(&resolve(catalog, conn, &rest[..end])?);
                // Skip the placeholder body and the closing brace.
                for _ in 0..=rest[..end].chars().count() {
                    chars.next();
                }
            }
            '}' if !in_literal => {
                return Err(Error::InvalidQuery(format!(
                    "unbalanced '}}' at offset {pos}"
                )));
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

fn resolve(catalog: &IndexCatalog, conn: &Connection, token: &str) -> Result<String> {
    let (soup, path) = match token.split_once(':') {
        Some((soup, path)) => (soup.trim(), Some(path.trim())),
        None => (token.trim(), None),
    };
    if soup.is_empty() || path.is_some_and(str::is_empty) {
        return Err(Error::InvalidQuery(format!("empty placeholder {{{token}}}")));
    }

    let mapping = catalog.require(conn, soup)?;
    match path {
        None => Ok(mapping.table_name.clone()),
        Some(path) => mapping
            .column_for_path(path)
            .ok_or_else(|| Error::PathNotIndexed {
                soup: soup.to_string(),
                path: path.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IndexSpec;
    use crate::store::catalog::{insert_index, insert_soup, json_extract_expr};
    use crate::store::schema::apply_schema;

    fn setup() -> (IndexCatalog, Connection) {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        for soup in ["employees", "departments"] {
            let table = insert_soup(&conn, soup).unwrap();
            let mut code = IndexSpec::string("deptCode");
            code.column_name = Some(format!("{table}_0"));
            insert_index(&conn, soup, &code).unwrap();
        }
        let mut city = IndexSpec::json1("address.city");
        city.column_name = Some(json_extract_expr("TABLE_1", "address.city"));
        insert_index(&conn, "employees", &city).unwrap();
        (IndexCatalog::new(), conn)
    }

    #[test]
    fn test_compile_join() {
        let (catalog, conn) = setup();
        let sql = compile(
            &catalog,
            &conn,
            "SELECT {employees:_soup}, {departments:deptCode} FROM {employees}, {departments} \
             WHERE {employees:deptCode} = {departments:deptCode} \
             ORDER BY {employees:_soupLastModifiedDate}",
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT TABLE_1.soup, TABLE_2.TABLE_2_0 FROM TABLE_1, TABLE_2 \
             WHERE TABLE_1.TABLE_1_0 = TABLE_2.TABLE_2_0 \
             ORDER BY TABLE_1.last_modified"
        );
    }

    #[test]
    fn test_compile_json1_and_managed_fields() {
        let (catalog, conn) = setup();
        let sql = compile(
            &catalog,
            &conn,
            "SELECT {employees:_soupEntryId} FROM {employees} WHERE {employees:address.city} = 'SF'",
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT TABLE_1.id FROM TABLE_1 WHERE json_extract(TABLE_1.soup, '$.address.city') = 'SF'"
        );
    }

    #[test]
    fn test_braces_inside_literals_are_kept() {
        let (catalog, conn) = setup();
        let sql = compile(&catalog, &conn, "SELECT '{not a soup}' FROM {employees}").unwrap();
        assert_eq!(sql, "SELECT '{not a soup}' FROM TABLE_1");
    }

    #[test]
    fn test_errors() {
        let (catalog, conn) = setup();
        assert!(matches!(
            compile(&catalog, &conn, "SELECT * FROM {ghosts}"),
            Err(Error::SoupNotFound { .. })
        ));
        assert!(matches!(
            compile(&catalog, &conn, "SELECT {employees:salary} FROM {employees}"),
            Err(Error::PathNotIndexed { .. })
        ));
        assert!(matches!(
            compile(&catalog, &conn, "SELECT * FROM {employees"),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            compile(&catalog, &conn, "SELECT * FROM employees}"),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            compile(&catalog, &conn, "SELECT * FROM {}"),
            Err(Error::InvalidQuery(_))
        ));
    }
}
