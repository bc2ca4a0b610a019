//! Record command implementations: upsert, get, delete.

use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

use super::{open_existing, print_json, read_json_arg};
use crate::cli::UpsertArgs;
use crate::error::{Error, Result};
use crate::store::SOUP_ENTRY_ID;
use crate::sync::{is_local_id, mark_locally_created, mark_locally_deleted, mark_locally_updated};

/// Server id field of records upserted with `--local`.
const ID_FIELD: &str = "Id";

#[derive(Serialize)]
struct RecordsOutput {
    records: Vec<Value>,
    count: usize,
}

/// Execute the upsert command.
pub fn execute_upsert(args: &UpsertArgs, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let mut record = read_json_arg(&args.record)?;
    if !record.is_object() {
        return Err(Error::InvalidArgument("record must be a JSON object".to_string()));
    }
    if args.local {
        let has_server_id = record
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .is_some_and(|id| !is_local_id(id));
        if has_server_id {
            mark_locally_updated(&mut record);
        } else {
            mark_locally_created(&mut record, ID_FIELD);
        }
    }

    let store = open_existing(db_path)?;
    let saved = store.upsert_with_external_id(
        &args.soup,
        &record,
        args.external_id.as_deref().unwrap_or(SOUP_ENTRY_ID),
    )?;

    if json {
        return print_json(&saved);
    }
    let entry_id = saved.get(SOUP_ENTRY_ID).and_then(Value::as_i64).unwrap_or_default();
    println!("Saved entry {entry_id} in {}", args.soup);
    Ok(())
}

/// Execute the get command.
pub fn execute_get(soup: &str, ids: &[i64], db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let store = open_existing(db_path)?;
    let records = store.retrieve(soup, ids)?;

    if json {
        return print_json(&RecordsOutput {
            count: records.len(),
            records,
        });
    }
    for record in &records {
        println!("{}", serde_json::to_string_pretty(record)?);
    }
    Ok(())
}

/// Execute the delete command.
///
/// With `local`, records are only flagged; the next sync up deletes them
/// remotely and then locally.
pub fn execute_delete(
    soup: &str,
    ids: &[i64],
    local: bool,
    db_path: Option<&PathBuf>,
    json: bool,
) -> Result<()> {
    let store = open_existing(db_path)?;
    let affected = if local {
        store.in_transaction(|store| {
            let records = store.retrieve(soup, ids)?;
            let count = records.len();
            for mut record in records {
                mark_locally_deleted(&mut record);
                store.upsert(soup, &record)?;
            }
            Ok(count)
        })?
    } else {
        store.delete(soup, ids)?
    };

    if json {
        return print_json(&serde_json::json!({ "soup": soup, "affected": affected, "local": local }));
    }
    if local {
        println!("Marked {affected} records for deletion in {soup}");
    } else {
        println!("Deleted {affected} records from {soup}");
    }
    Ok(())
}
