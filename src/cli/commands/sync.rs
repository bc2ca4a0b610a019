//! Sync command implementations.
//!
//! Commands that talk to the remote service build a [`SyncManager`] from the
//! saved settings and block until the submitted job reaches a terminal
//! status. `status`, `list` and `delete` only read or edit the syncs soup.

use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use super::{open_existing, print_json, read_json_arg};
use crate::cli::SyncCommands;
use crate::config::load_settings;
use crate::error::{Error, Result};
use crate::model::{SyncOptions, SyncState, SyncStatus};
use crate::store::SmartStore;
use crate::sync::target::{BatchSyncUpTarget, SoqlSyncDownTarget, StandardSyncUpTarget};
use crate::sync::{
    state_store, HttpRestClient, RestApi, RestClient, SyncCallback, SyncDownTarget, SyncEnv,
    SyncManager, SyncUpTarget,
};

#[derive(Serialize)]
struct SyncListOutput {
    syncs: Vec<SyncState>,
    count: usize,
}

/// Execute sync commands.
pub fn execute(command: &SyncCommands, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    match command {
        SyncCommands::Down {
            soup,
            query,
            target,
            name,
            merge_mode,
        } => {
            let target = match (target, query) {
                (Some(raw), _) => serde_json::from_value::<SyncDownTarget>(read_json_arg(raw)?)
                    .map_err(|e| Error::InvalidArgument(format!("invalid sync down target: {e}")))?,
                (None, Some(query)) => SyncDownTarget::Soql(SoqlSyncDownTarget::new(query)),
                (None, None) => {
                    return Err(Error::InvalidArgument("--query or --target is required".to_string()));
                }
            };
            let options = SyncOptions::with_merge_mode((*merge_mode).into());
            let manager = remote_manager(open_existing(db_path)?)?;
            let state = run_and_wait(json, |callback| {
                manager.sync_down(&target, options, soup, name.as_deref(), Some(callback))
            })?;
            finish(&state, json)
        }
        SyncCommands::Up {
            soup,
            object_type,
            batch_size,
            target,
            fieldlist,
            name,
            merge_mode,
        } => {
            let target = match target {
                Some(raw) => serde_json::from_value::<SyncUpTarget>(read_json_arg(raw)?)
                    .map_err(|e| Error::InvalidArgument(format!("invalid sync up target: {e}")))?,
                None => up_target(object_type.as_deref(), *batch_size),
            };
            let options = match fieldlist {
                Some(fields) => SyncOptions::with_fieldlist((*merge_mode).into(), fields.clone()),
                None => SyncOptions::with_merge_mode((*merge_mode).into()),
            };
            let manager = remote_manager(open_existing(db_path)?)?;
            let state = run_and_wait(json, |callback| {
                manager.sync_up(&target, options, soup, name.as_deref(), Some(callback))
            })?;
            finish(&state, json)
        }
        SyncCommands::Resync { sync } => {
            let store = open_existing(db_path)?;
            let id = find_sync(&store, sync)?.id;
            let manager = remote_manager(store)?;
            let state = run_and_wait(json, |callback| manager.re_sync(id, Some(callback)))?;
            finish(&state, json)
        }
        SyncCommands::Status { sync } => {
            let state = find_sync(&open_existing(db_path)?, sync)?;
            if json {
                return print_json(&state);
            }
            print_state(&state);
            Ok(())
        }
        SyncCommands::List { status } => list(status.as_deref(), db_path, json),
        SyncCommands::Delete { sync } => {
            let store = open_existing(db_path)?;
            let state = find_sync(&store, sync)?;
            state_store::delete_by_id(&store, state.id)?;
            if json {
                return print_json(&serde_json::json!({ "deleted": state.id }));
            }
            println!("Deleted sync {}", state.id);
            Ok(())
        }
        SyncCommands::CleanGhosts { sync } => {
            let store = open_existing(db_path)?;
            let id = find_sync(&store, sync)?.id;
            let manager = remote_manager(store)?;
            let (tx, rx) = mpsc::channel();
            manager.clean_resync_ghosts(
                id,
                Some(Box::new(move |result: Result<usize>| {
                    let _ = tx.send(result);
                })),
            )?;
            let removed = rx
                .recv()
                .map_err(|_| Error::Other("sync worker exited early".to_string()))??;
            if json {
                return print_json(&serde_json::json!({ "sync": id, "removed": removed }));
            }
            println!("Removed {removed} ghost records");
            Ok(())
        }
    }
}

fn up_target(object_type: Option<&str>, batch_size: Option<usize>) -> SyncUpTarget {
    let base = object_type.map_or_else(StandardSyncUpTarget::default, StandardSyncUpTarget::for_type);
    match batch_size {
        Some(max_batch_size) => SyncUpTarget::Batch(BatchSyncUpTarget {
            base,
            max_batch_size,
        }),
        None => SyncUpTarget::Standard(base),
    }
}

/// Look a sync up by numeric id, falling back to its name.
fn find_sync(store: &SmartStore, raw: &str) -> Result<SyncState> {
    match raw.parse::<i64>() {
        Ok(id) => state_store::require_by_id(store, id),
        Err(_) => state_store::require_by_name(store, raw),
    }
}

fn remote_manager(store: SmartStore) -> Result<SyncManager> {
    let settings = load_settings()?;
    let client: Arc<dyn RestClient> = Arc::new(HttpRestClient::from_settings(&settings)?);
    let env = SyncEnv::new(Arc::new(store), client, RestApi::new(&settings.api_version));
    SyncManager::new(env)
}

/// Submit a job and block until it reaches a terminal status.
fn run_and_wait<F>(json: bool, submit: F) -> Result<SyncState>
where
    F: FnOnce(SyncCallback) -> Result<SyncState>,
{
    let (tx, rx) = mpsc::channel::<SyncState>();
    let callback: SyncCallback = Arc::new(move |state: &SyncState| {
        let _ = tx.send(state.clone());
    });
    let queued = submit(callback)?;

    let mut last_progress = -1;
    for state in rx {
        if state.status.is_terminal() {
            return Ok(state);
        }
        if !json && state.progress != last_progress {
            last_progress = state.progress;
            eprintln!("  sync {} {}%", state.id, state.progress);
        }
    }
    Err(Error::Other(format!("sync {} ended without a final status", queued.id)))
}

fn finish(state: &SyncState, json: bool) -> Result<()> {
    if json {
        print_json(state)?;
    } else {
        print_state(state);
    }
    match state.status {
        SyncStatus::Failed => Err(Error::Other(format!(
            "sync {} failed: {}",
            state.id,
            state.error.as_deref().unwrap_or("unknown error")
        ))),
        _ => Ok(()),
    }
}

fn list(status: Option<&str>, db_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let store = open_existing(db_path)?;
    let syncs = match status {
        Some(raw) => state_store::all_with_status(&store, SyncStatus::parse(raw)?)?,
        None => state_store::all(&store)?,
    };

    if json {
        return print_json(&SyncListOutput {
            count: syncs.len(),
            syncs,
        });
    }
    if syncs.is_empty() {
        println!("No syncs.");
    }
    for state in &syncs {
        println!(
            "{:>5}  {:<8} {:<20} {:<10} {:>3}%  {}",
            state.id,
            state.sync_type.as_str(),
            state.name.as_deref().unwrap_or("-"),
            colored_status(state.status),
            state.progress,
            state.soup_name
        );
    }
    Ok(())
}

fn colored_status(status: SyncStatus) -> colored::ColoredString {
    match status {
        SyncStatus::Done => status.as_str().green(),
        SyncStatus::Failed => status.as_str().red(),
        SyncStatus::Stopped => status.as_str().yellow(),
        SyncStatus::Running => status.as_str().cyan(),
        SyncStatus::New => status.as_str().normal(),
    }
}

fn print_state(state: &SyncState) {
    let title = state.name.as_deref().map_or_else(|| format!("Sync {}", state.id), |n| format!("Sync {} ({n})", state.id));
    println!("{}", title.bold());
    println!("  type:        {}", state.sync_type.as_str());
    println!("  soup:        {}", state.soup_name);
    println!("  status:      {}", colored_status(state.status));
    println!("  progress:    {}%", state.progress);
    if state.total_size >= 0 {
        println!("  total size:  {}", state.total_size);
    }
    if state.max_time_stamp >= 0 {
        println!("  max ts:      {}", state.max_time_stamp);
    }
    if let Some(error) = &state.error {
        println!("  error:       {}", error.red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MergeMode;

    #[test]
    fn test_up_target_from_flags() {
        assert!(matches!(up_target(None, None), SyncUpTarget::Standard(ref t) if t.sobject_type.is_none()));
        let SyncUpTarget::Batch(batch) = up_target(Some("Contact"), Some(10)) else {
            panic!("expected batch target");
        };
        assert_eq!(batch.max_batch_size, 10);
        assert_eq!(batch.base.sobject_type.as_deref(), Some("Contact"));
    }

    #[test]
    fn test_find_sync_by_id_or_name() {
        let store = SmartStore::open_memory().unwrap();
        let target = SyncDownTarget::Soql(SoqlSyncDownTarget::new("SELECT Id FROM Account"));
        let created = state_store::create_sync_down(
            &store,
            &target,
            SyncOptions::with_merge_mode(MergeMode::Overwrite),
            "accounts",
            Some("accounts-down"),
        )
        .unwrap();

        assert_eq!(find_sync(&store, &created.id.to_string()).unwrap().id, created.id);
        assert_eq!(find_sync(&store, "accounts-down").unwrap().id, created.id);
        assert!(matches!(find_sync(&store, "nope"), Err(Error::SyncNotFound { .. })));
    }
}
