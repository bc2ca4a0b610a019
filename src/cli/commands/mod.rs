//! Command implementations.

pub mod completions;
pub mod config;
pub mod query;
pub mod record;
pub mod soup;
pub mod sync;
pub mod version;

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::config::resolve_db_path;
use crate::error::{Error, Result};
use crate::store::SmartStore;

/// Open the store for a command that needs an existing database.
pub(crate) fn open_existing(db_path: Option<&PathBuf>) -> Result<SmartStore> {
    let path = db_location(db_path)?;
    if !path.exists() {
        return Err(Error::NotInitialized { path });
    }
    SmartStore::open(&path)
}

/// Open the store, creating the database file if needed.
pub(crate) fn open_or_create(db_path: Option<&PathBuf>) -> Result<SmartStore> {
    SmartStore::open(&db_location(db_path)?)
}

fn db_location(db_path: Option<&PathBuf>) -> Result<PathBuf> {
    resolve_db_path(db_path.map(PathBuf::as_path))
        .ok_or_else(|| Error::Config("could not determine database location".to_string()))
}

/// Print one JSON document on stdout.
pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Parse a command-line value as JSON, falling back to a plain string.
pub(crate) fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Read a JSON document from an argument, or from stdin when it is `-`.
pub(crate) fn read_json_arg(raw: &str) -> Result<Value> {
    if raw == "-" {
        let input = std::io::read_to_string(std::io::stdin())?;
        return Ok(serde_json::from_str(&input)?);
    }
    if Path::new(raw).extension().is_some_and(|e| e == "json") && Path::new(raw).is_file() {
        return Ok(serde_json::from_str(&std::fs::read_to_string(raw)?)?);
    }
    serde_json::from_str(raw).map_err(|e| Error::InvalidArgument(format!("invalid JSON: {e}")))
}
