//! Soup command implementations.

use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

use super::{open_existing, open_or_create, print_json};
use crate::cli::SoupCommands;
use crate::error::{Error, Result};
use crate::model::{IndexSpec, QuerySpec, Order};

#[derive(Serialize)]
struct SoupOutput<'a> {
    soup: &'a str,
    indices: Vec<IndexSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
}

#[derive(Serialize)]
struct SoupListOutput {
    soups: Vec<String>,
    count: usize,
}

/// Execute soup commands.
pub fn execute(command: &SoupCommands, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    match command {
        SoupCommands::Register { name, indices } => register(name, indices, db_path, json),
        SoupCommands::Drop { name } => drop_soup(name, db_path, json),
        SoupCommands::Clear { name } => clear(name, db_path, json),
        SoupCommands::List => list(db_path, json),
        SoupCommands::Describe { name } => describe(name, db_path, json),
    }
}

fn parse_indices(raw: &[String]) -> Result<Vec<IndexSpec>> {
    raw.iter()
        .map(|r| {
            IndexSpec::parse(r).ok_or_else(|| {
                Error::InvalidArgument(format!("invalid index '{r}', expected path[:type]"))
            })
        })
        .collect()
}

fn register(name: &str, raw: &[String], db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let specs = parse_indices(raw)?;
    let store = open_or_create(db_path)?;
    store.register_soup(name, &specs)?;
    let indices = store.index_specs(name)?;

    if json {
        return print_json(&SoupOutput {
            soup: name,
            indices,
            count: None,
        });
    }
    println!("{} soup {} ({} indices)", "Registered".green(), name.bold(), indices.len());
    Ok(())
}

fn drop_soup(name: &str, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let store = open_existing(db_path)?;
    store.drop_soup(name)?;
    if json {
        return print_json(&serde_json::json!({ "dropped": name }));
    }
    println!("Dropped soup {name}");
    Ok(())
}

fn clear(name: &str, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let store = open_existing(db_path)?;
    let removed = store.clear_soup(name)?;
    if json {
        return print_json(&serde_json::json!({ "soup": name, "removed": removed }));
    }
    println!("Removed {removed} records from {name}");
    Ok(())
}

fn list(db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let store = open_existing(db_path)?;
    let soups = store.soup_names()?;
    if json {
        return print_json(&SoupListOutput {
            count: soups.len(),
            soups,
        });
    }
    if soups.is_empty() {
        println!("No soups registered.");
    }
    for soup in &soups {
        println!("{soup}");
    }
    Ok(())
}

fn describe(name: &str, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let store = open_existing(db_path)?;
    let indices = store.index_specs(name)?;
    let count = store.count_query(&QuerySpec::all(name, None, Order::Ascending, 1))?;

    if json {
        return print_json(&SoupOutput {
            soup: name,
            indices,
            count: Some(count),
        });
    }
    println!("{} ({count} records)", name.bold());
    for spec in &indices {
        let column = spec.column_name.as_deref().unwrap_or("-");
        println!("  {:<30} {:<9} {}", spec.path, spec.index_type.as_str(), column.dimmed());
    }
    Ok(())
}
