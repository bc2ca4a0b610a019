//! One run of one sync.
//!
//! A run takes a persisted `SyncState` in `RUNNING`, drives its target and
//! ends in exactly one of `DONE`, `FAILED` or `STOPPED`. Every change is
//! saved before the callback sees it.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::target::id_string;
use super::{state_store, SyncEnv};
use crate::error::Result;
use crate::model::{MergeMode, SyncState, SyncStatus, SyncType};
use crate::store::now_millis;

/// Receives every persisted change of a sync's state.
pub type SyncCallback = Arc<dyn Fn(&SyncState) + Send + Sync>;

/// Receives the outcome of a ghost cleanup: the number of records removed.
pub type GhostCallback = Box<dyn FnOnce(Result<usize>) + Send>;

/// Work item for the manager's worker.
pub(crate) struct Job {
    pub sync_id: i64,
    /// Token of the manager epoch the job was submitted in.
    pub stop: CancellationToken,
    pub kind: JobKind,
}

pub(crate) enum JobKind {
    Sync(Option<SyncCallback>),
    CleanGhosts(Option<GhostCallback>),
}

fn notify(callback: Option<&SyncCallback>, state: &SyncState) {
    if let Some(callback) = callback {
        callback(state);
    }
}

/// Persist `state`, then hand it to the callback.
fn report(env: &SyncEnv, state: &SyncState, callback: Option<&SyncCallback>) -> Result<()> {
    state_store::save(&env.store, state)?;
    notify(callback, state);
    Ok(())
}

fn percent(done: usize, total: i64) -> i32 {
    if total <= 0 {
        return 0;
    }
    let done = i64::try_from(done).unwrap_or(i64::MAX);
    i32::try_from((done.saturating_mul(100) / total).min(100)).unwrap_or(100)
}

/// Run one sync to a terminal status.
///
/// `on_finish` runs after the terminal state is saved and before the
/// callback is told about it. If the terminal state cannot be saved at all,
/// `on_finish` still runs and the callback is not told.
pub(crate) fn run_sync(
    env: &SyncEnv,
    mut state: SyncState,
    stop: &CancellationToken,
    callback: Option<&SyncCallback>,
    on_finish: impl FnOnce(&SyncState),
) -> SyncState {
    info!(id = state.id, sync_type = state.sync_type.as_str(), soup = %state.soup_name, "Running sync");
    let result = match state.sync_type {
        SyncType::Down => sync_down(env, &mut state, stop, callback),
        SyncType::Up => sync_up(env, &mut state, stop, callback),
    };

    match result {
        Ok(()) => {
            state.status = SyncStatus::Done;
            state.progress = 100;
            state.error = None;
            info!(id = state.id, "Sync done");
        }
        Err(e) if e.is_stopped() => {
            state.status = SyncStatus::Stopped;
            info!(id = state.id, progress = state.progress, "Sync stopped");
        }
        Err(e) => {
            state.status = SyncStatus::Failed;
            state.error = Some(e.to_string());
            warn!(id = state.id, error = %e, "Sync failed");
        }
    }
    state.end_time = now_millis();

    let persisted = save_final(env, &mut state);
    on_finish(&state);
    if persisted {
        notify(callback, &state);
    }
    state
}

/// Save the terminal state. A failed save is retried once as `FAILED`
/// carrying the save error; returns whether anything was stored.
fn save_final(env: &SyncEnv, state: &mut SyncState) -> bool {
    let Err(e) = state_store::save(&env.store, state) else {
        return true;
    };
    warn!(id = state.id, status = state.status.as_str(), error = %e, "Failed to save final sync state");
    state.status = SyncStatus::Failed;
    state.error = Some(format!("could not save sync state: {e}"));
    match state_store::save(&env.store, state) {
        Ok(()) => true,
        Err(e) => {
            error!(id = state.id, error = %e, "Final sync state not saved, callback skipped");
            false
        }
    }
}

fn sync_down(
    env: &SyncEnv,
    state: &mut SyncState,
    stop: &CancellationToken,
    callback: Option<&SyncCallback>,
) -> Result<()> {
    let mut target = state.down_target()?;
    let ctx = env.context(state.id, state.merge_mode(), stop);
    let soup = state.soup_name.clone();
    let id_field = target.fields().id_field_name.clone();

    let skip: HashSet<String> = if ctx.merge_mode == MergeMode::LeaveIfChanged {
        target.get_dirty_record_ids(&ctx, &soup)?
    } else {
        HashSet::new()
    };
    let sorted = target.is_sorted_by_latest_modification(&ctx)?;

    ctx.check_if_stopped()?;
    let mut page = Some(target.start_fetch(&ctx, &soup, state.max_time_stamp)?);
    state.total_size = target.total_size();
    report(env, state, callback)?;

    let mut saved = 0usize;
    let mut latest = state.max_time_stamp;
    while let Some(records) = page {
        ctx.check_if_stopped()?;
        let page_latest = target.get_latest_modification_time_stamp(&records);
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| {
                !r.get(&id_field)
                    .and_then(id_string)
                    .is_some_and(|id| skip.contains(&id))
            })
            .collect();
        saved += target.save_records_to_local_store(&ctx, &soup, records)?;

        latest = latest.max(page_latest);
        if sorted && page_latest > state.max_time_stamp {
            state.max_time_stamp = page_latest;
        }
        state.progress = percent(saved, state.total_size);
        report(env, state, callback)?;
        debug!(id = state.id, saved, progress = state.progress, "Saved page");

        page = target.continue_fetch(&ctx, &soup)?;
    }

    if latest > state.max_time_stamp {
        state.max_time_stamp = latest;
    }
    Ok(())
}

fn sync_up(
    env: &SyncEnv,
    state: &mut SyncState,
    stop: &CancellationToken,
    callback: Option<&SyncCallback>,
) -> Result<()> {
    let target = state.up_target()?;
    let ctx = env.context(state.id, state.merge_mode(), stop);
    let soup = state.soup_name.clone();

    let ids = target.get_ids_of_records_to_sync_up(&ctx, &soup)?;
    state.total_size = i64::try_from(ids.len()).unwrap_or(i64::MAX);
    report(env, state, callback)?;

    let mut done = 0;
    for chunk in ids.chunks(target.batch_size()) {
        ctx.check_if_stopped()?;
        target.sync_up_records(&ctx, &soup, chunk, &state.options)?;
        done += chunk.len();
        state.progress = percent(done, state.total_size);
        report(env, state, callback)?;
    }
    Ok(())
}

/// Delete the ghosts of a sync down. The sync's state is left untouched.
pub(crate) fn run_clean_ghosts(env: &SyncEnv, sync_id: i64, stop: &CancellationToken) -> Result<usize> {
    let state = state_store::require_by_id(&env.store, sync_id)?;
    let target = state.down_target()?;
    let ctx = env.context(state.id, state.merge_mode(), stop);
    target.clean_ghosts(&ctx, &state.soup_name)
}
