//! Persistence of sync descriptors.
//!
//! Every `SyncState` is a record of the reserved soup [`SYNCS_SOUP`]; its
//! entry id is the sync id. Names are unique across sync types.

use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{IndexSpec, Order, QuerySpec, SyncOptions, SyncState, SyncStatus, SyncType};
use crate::store::SmartStore;
use crate::sync::target::{SyncDownTarget, SyncUpTarget};

/// Reserved soup holding sync descriptors.
pub const SYNCS_SOUP: &str = "syncs_soup";

const PAGE_SIZE: usize = 1000;

/// Register the syncs soup if needed.
///
/// # Errors
///
/// Returns an error if the soup cannot be registered.
pub fn setup(store: &SmartStore) -> Result<()> {
    if store.soup_exists(SYNCS_SOUP)? {
        return Ok(());
    }
    store.register_soup(
        SYNCS_SOUP,
        &[
            IndexSpec::string("name"),
            IndexSpec::string("type"),
            IndexSpec::string("status"),
        ],
    )
}

/// Persist a new sync down in the `NEW` status.
///
/// # Errors
///
/// Returns [`Error::DuplicateSyncName`] if `name` is taken.
pub fn create_sync_down(
    store: &SmartStore,
    target: &SyncDownTarget,
    options: SyncOptions,
    soup_name: &str,
    name: Option<&str>,
) -> Result<SyncState> {
    create(store, SyncType::Down, serde_json::to_value(target)?, options, soup_name, name)
}

/// Persist a new sync up in the `NEW` status.
///
/// # Errors
///
/// Returns [`Error::DuplicateSyncName`] if `name` is taken.
pub fn create_sync_up(
    store: &SmartStore,
    target: &SyncUpTarget,
    options: SyncOptions,
    soup_name: &str,
    name: Option<&str>,
) -> Result<SyncState> {
    create(store, SyncType::Up, serde_json::to_value(target)?, options, soup_name, name)
}

fn create(
    store: &SmartStore,
    sync_type: SyncType,
    target: Value,
    options: SyncOptions,
    soup_name: &str,
    name: Option<&str>,
) -> Result<SyncState> {
    setup(store)?;
    let state = SyncState::new(sync_type, target, options, soup_name, name);
    let saved = store.in_transaction(|store| {
        if let Some(name) = name {
            if has_sync_with_name(store, name)? {
                return Err(Error::DuplicateSyncName {
                    name: name.to_string(),
                });
            }
        }
        store.create(SYNCS_SOUP, &state.to_json()?)
    })?;
    let state = SyncState::from_json(&saved)?;
    info!(id = state.id, name = ?state.name, sync_type = sync_type.as_str(), "Created sync");
    Ok(state)
}

/// Look up a sync by id.
///
/// # Errors
///
/// Returns an error if the soup cannot be read or a descriptor is corrupt.
pub fn by_id(store: &SmartStore, id: i64) -> Result<Option<SyncState>> {
    setup(store)?;
    store
        .retrieve(SYNCS_SOUP, &[id])?
        .first()
        .map(SyncState::from_json)
        .transpose()
}

/// Look up a sync by name.
///
/// # Errors
///
/// Returns an error if the soup cannot be read or a descriptor is corrupt.
pub fn by_name(store: &SmartStore, name: &str) -> Result<Option<SyncState>> {
    setup(store)?;
    store
        .query(
            &QuerySpec::exact(SYNCS_SOUP, "name", name, Order::Ascending, 1),
            0,
        )?
        .first()
        .map(SyncState::from_json)
        .transpose()
}

/// Like [`by_id`] but a missing sync is an error.
///
/// # Errors
///
/// Returns [`Error::SyncNotFound`] if no sync has that id.
pub fn require_by_id(store: &SmartStore, id: i64) -> Result<SyncState> {
    by_id(store, id)?.ok_or_else(|| Error::SyncNotFound { id: id.to_string() })
}

/// Like [`by_name`] but a missing sync is an error.
///
/// # Errors
///
/// Returns [`Error::SyncNotFound`] if no sync has that name.
pub fn require_by_name(store: &SmartStore, name: &str) -> Result<SyncState> {
    by_name(store, name)?.ok_or_else(|| Error::SyncNotFound {
        id: name.to_string(),
    })
}

/// Whether a sync (of any type) already uses `name`.
///
/// # Errors
///
/// Returns an error if the soup cannot be read.
pub fn has_sync_with_name(store: &SmartStore, name: &str) -> Result<bool> {
    setup(store)?;
    Ok(store.count_query(&QuerySpec::exact(SYNCS_SOUP, "name", name, Order::Ascending, 1))? > 0)
}

/// Every sync in the given status, oldest first.
///
/// # Errors
///
/// Returns an error if the soup cannot be read or a descriptor is corrupt.
pub fn all_with_status(store: &SmartStore, status: SyncStatus) -> Result<Vec<SyncState>> {
    setup(store)?;
    let spec = QuerySpec::exact(SYNCS_SOUP, "status", status.as_str(), Order::Ascending, PAGE_SIZE)
        .with_order_path(crate::store::SOUP_ENTRY_ID);
    collect_pages(store, &spec)
}

/// Every sync, oldest first.
///
/// # Errors
///
/// Returns an error if the soup cannot be read or a descriptor is corrupt.
pub fn all(store: &SmartStore) -> Result<Vec<SyncState>> {
    setup(store)?;
    collect_pages(store, &QuerySpec::all(SYNCS_SOUP, None, Order::Ascending, PAGE_SIZE))
}

fn collect_pages(store: &SmartStore, spec: &QuerySpec) -> Result<Vec<SyncState>> {
    let mut out = Vec::new();
    for page_index in 0.. {
        let page = store.query(spec, page_index)?;
        let done = page.len() < spec.page_size;
        for value in &page {
            out.push(SyncState::from_json(value)?);
        }
        if done {
            break;
        }
    }
    Ok(out)
}

/// Write back a sync descriptor.
///
/// # Errors
///
/// Returns [`Error::EntryNotFound`] if the sync was deleted meanwhile.
pub fn save(store: &SmartStore, state: &SyncState) -> Result<()> {
    store.update(SYNCS_SOUP, &state.to_json()?, state.id)?;
    debug!(id = state.id, status = %state.status, progress = state.progress, "Saved sync");
    Ok(())
}

/// Delete a sync by id. Deleting an unknown id is a no-op.
///
/// # Errors
///
/// Returns an error if the soup cannot be written.
pub fn delete_by_id(store: &SmartStore, id: i64) -> Result<()> {
    setup(store)?;
    store.delete(SYNCS_SOUP, &[id])?;
    Ok(())
}

/// Delete a sync by name. Deleting an unknown name is a no-op.
///
/// # Errors
///
/// Returns an error if the soup cannot be read or written.
pub fn delete_by_name(store: &SmartStore, name: &str) -> Result<()> {
    if let Some(state) = by_name(store, name)? {
        delete_by_id(store, state.id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MergeMode;
    use crate::sync::target::soql::SoqlSyncDownTarget;
    use crate::sync::target::up::StandardSyncUpTarget;

    fn down_target() -> SyncDownTarget {
        SyncDownTarget::Soql(SoqlSyncDownTarget::new("SELECT Id, Name FROM Account"))
    }

    fn up_target() -> SyncUpTarget {
        SyncUpTarget::Standard(StandardSyncUpTarget::default())
    }

    #[test]
    fn test_create_and_lookup() {
        let store = SmartStore::open_memory().unwrap();
        let created = create_sync_down(
            &store,
            &down_target(),
            SyncOptions::with_merge_mode(MergeMode::LeaveIfChanged),
            "accounts",
            Some("accounts-down"),
        )
        .unwrap();
        assert!(created.id > 0);
        assert_eq!(created.status, SyncStatus::New);
        assert_eq!(created.target["type"], "soql");

        assert_eq!(by_id(&store, created.id).unwrap().unwrap(), created);
        assert_eq!(by_name(&store, "accounts-down").unwrap().unwrap(), created);
        assert!(by_id(&store, 999).unwrap().is_none());
        assert!(matches!(
            require_by_name(&store, "nope"),
            Err(Error::SyncNotFound { .. })
        ));
    }

    #[test]
    fn test_name_unique_across_types() {
        let store = SmartStore::open_memory().unwrap();
        create_sync_down(&store, &down_target(), SyncOptions::default(), "s", Some("dup"))
            .unwrap();
        let err = create_sync_up(&store, &up_target(), SyncOptions::default(), "s", Some("dup"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSyncName { .. }));
        // Unnamed syncs never collide.
        create_sync_up(&store, &up_target(), SyncOptions::default(), "s", None).unwrap();
        create_sync_up(&store, &up_target(), SyncOptions::default(), "s", None).unwrap();
        assert_eq!(all(&store).unwrap().len(), 3);
    }

    #[test]
    fn test_save_and_status_filter() {
        let store = SmartStore::open_memory().unwrap();
        let mut a = create_sync_down(&store, &down_target(), SyncOptions::default(), "s", None)
            .unwrap();
        let b = create_sync_down(&store, &down_target(), SyncOptions::default(), "s", None)
            .unwrap();
        a.status = SyncStatus::Stopped;
        a.max_time_stamp = 42;
        save(&store, &a).unwrap();

        let stopped = all_with_status(&store, SyncStatus::Stopped).unwrap();
        assert_eq!(stopped, vec![a.clone()]);
        let fresh = all_with_status(&store, SyncStatus::New).unwrap();
        assert_eq!(fresh, vec![b]);
    }

    #[test]
    fn test_delete() {
        let store = SmartStore::open_memory().unwrap();
        let a = create_sync_down(&store, &down_target(), SyncOptions::default(), "s", Some("a"))
            .unwrap();
        delete_by_name(&store, "a").unwrap();
        assert!(by_id(&store, a.id).unwrap().is_none());
        assert!(!has_sync_with_name(&store, "a").unwrap());
        delete_by_id(&store, a.id).unwrap();
    }
}
