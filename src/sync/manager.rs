//! Sync orchestration.
//!
//! A [`SyncManager`] admits syncs, persists them as `RUNNING` and hands them
//! to a single worker thread that runs them one at a time in submission
//! order. Stopping cancels the current epoch's token; queued and running
//! jobs notice at their next check and end `STOPPED`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{run_clean_ghosts, run_sync, GhostCallback, Job, JobKind, SyncCallback};
use super::target::{CustomSyncDownHandler, CustomSyncUpHandler, SyncDownTarget, SyncUpTarget};
use super::{state_store, SyncEnv};
use crate::error::{Error, Result};
use crate::model::{SyncOptions, SyncState, SyncStatus, SyncType, UNKNOWN_TIME_STAMP};
use crate::store::{now_millis, SmartStore};

/// Admission state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    AcceptingSyncs,
    /// Stop requested; some jobs have not finished yet.
    StopRequested,
    Stopped,
}

impl ManagerState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptingSyncs => "ACCEPTING_SYNCS",
            Self::StopRequested => "STOP_REQUESTED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    state: ManagerState,
    /// Submitted and not yet finished.
    active: HashSet<i64>,
    token: CancellationToken,
}

struct Shared {
    env: SyncEnv,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a finished job; the last one out completes a pending stop.
    fn finish(&self, sync_id: i64) {
        let mut inner = self.lock();
        inner.active.remove(&sync_id);
        if inner.state == ManagerState::StopRequested && inner.active.is_empty() {
            inner.state = ManagerState::Stopped;
            info!("Sync manager stopped");
        }
    }
}

fn worker_loop(shared: &Shared, mut jobs: UnboundedReceiver<Job>) {
    while let Some(job) = jobs.blocking_recv() {
        match job.kind {
            JobKind::Sync(callback) => match state_store::require_by_id(&shared.env.store, job.sync_id) {
                Ok(state) => {
                    run_sync(&shared.env, state, &job.stop, callback.as_ref(), |s| shared.finish(s.id));
                }
                Err(e) => {
                    warn!(id = job.sync_id, error = %e, "Dropping job for unreadable sync");
                    shared.finish(job.sync_id);
                }
            },
            JobKind::CleanGhosts(callback) => {
                let result = run_clean_ghosts(&shared.env, job.sync_id, &job.stop);
                shared.finish(job.sync_id);
                if let Some(callback) = callback {
                    callback(result);
                }
            }
        }
    }
    debug!("Sync worker exiting");
}

/// Runs syncs against one store.
pub struct SyncManager {
    shared: Arc<Shared>,
    sender: Mutex<Option<UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SyncManager {
    /// Create a manager and start its worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the syncs soup cannot be set up or the thread
    /// cannot be spawned.
    pub fn new(env: SyncEnv) -> Result<Self> {
        state_store::setup(&env.store)?;
        let shared = Arc::new(Shared {
            env,
            inner: Mutex::new(Inner {
                state: ManagerState::AcceptingSyncs,
                active: HashSet::new(),
                token: CancellationToken::new(),
            }),
        });
        let (sender, receiver) = unbounded_channel();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("soupsync-worker".to_string())
            .spawn(move || worker_loop(&worker_shared, receiver))?;
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    #[must_use]
    pub fn env(&self) -> &SyncEnv {
        &self.shared.env
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SmartStore> {
        &self.shared.env.store
    }

    #[must_use]
    pub fn state(&self) -> ManagerState {
        self.shared.lock().state
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.state() == ManagerState::StopRequested
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == ManagerState::Stopped
    }

    /// Whether the sync is queued or running.
    #[must_use]
    pub fn is_sync_running(&self, sync_id: i64) -> bool {
        self.shared.lock().active.contains(&sync_id)
    }

    /// Ask every queued and running job to stop.
    pub fn stop(&self) {
        let mut inner = self.shared.lock();
        inner.token.cancel();
        inner.state = if inner.active.is_empty() {
            ManagerState::Stopped
        } else {
            ManagerState::StopRequested
        };
        info!(state = %inner.state, active = inner.active.len(), "Stop requested");
    }

    /// Accept syncs again, optionally resubmitting every `STOPPED` sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the stopped syncs cannot be listed.
    pub fn restart(&self, resubmit_stopped: bool, callback: Option<SyncCallback>) -> Result<()> {
        {
            let mut inner = self.shared.lock();
            inner.state = ManagerState::AcceptingSyncs;
            inner.token = CancellationToken::new();
        }
        info!(resubmit_stopped, "Sync manager restarted");
        if resubmit_stopped {
            for state in state_store::all_with_status(self.store(), SyncStatus::Stopped)? {
                if let Err(e) = self.re_sync(state.id, callback.clone()) {
                    warn!(id = state.id, error = %e, "Could not resubmit stopped sync");
                }
            }
        }
        Ok(())
    }

    /// Register and start a sync down.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSyncName`] or [`Error::NotAcceptingSyncs`].
    pub fn sync_down(
        &self,
        target: &SyncDownTarget,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
        callback: Option<SyncCallback>,
    ) -> Result<SyncState> {
        self.ensure_accepting()?;
        let state = state_store::create_sync_down(self.store(), target, options, soup_name, name)?;
        self.submit(state, callback)
    }

    /// Register and start a sync up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateSyncName`] or [`Error::NotAcceptingSyncs`].
    pub fn sync_up(
        &self,
        target: &SyncUpTarget,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
        callback: Option<SyncCallback>,
    ) -> Result<SyncState> {
        self.ensure_accepting()?;
        let state = state_store::create_sync_up(self.store(), target, options, soup_name, name)?;
        self.submit(state, callback)
    }

    /// Run an existing sync again.
    ///
    /// A sync down resumes from its high-water mark, rewound by one after a
    /// stop so the boundary record is fetched again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncNotFound`], [`Error::SyncAlreadyRunning`] or
    /// [`Error::NotAcceptingSyncs`].
    pub fn re_sync(&self, sync_id: i64, callback: Option<SyncCallback>) -> Result<SyncState> {
        let mut state = state_store::require_by_id(self.store(), sync_id)?;
        if state.sync_type == SyncType::Down {
            if state.status == SyncStatus::Stopped {
                state.max_time_stamp = (state.max_time_stamp - 1).max(UNKNOWN_TIME_STAMP);
            }
            state.total_size = UNKNOWN_TIME_STAMP;
        }
        self.submit(state, callback)
    }

    /// [`SyncManager::re_sync`] by name.
    ///
    /// # Errors
    ///
    /// As [`SyncManager::re_sync`].
    pub fn re_sync_by_name(&self, name: &str, callback: Option<SyncCallback>) -> Result<SyncState> {
        let state = state_store::require_by_name(self.store(), name)?;
        self.re_sync(state.id, callback)
    }

    /// Queue a ghost cleanup for a sync down. The sync's status is not
    /// touched; the count removed goes to `callback`.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync is unknown, not a sync down, already
    /// active, or the manager is not accepting syncs.
    pub fn clean_resync_ghosts(&self, sync_id: i64, callback: Option<GhostCallback>) -> Result<()> {
        let state = state_store::require_by_id(self.store(), sync_id)?;
        state.down_target()?;
        let stop = self.admit(sync_id)?;
        self.enqueue(Job {
            sync_id,
            stop,
            kind: JobKind::CleanGhosts(callback),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the syncs soup cannot be read.
    pub fn get_sync_status(&self, sync_id: i64) -> Result<Option<SyncState>> {
        state_store::by_id(self.store(), sync_id)
    }

    /// # Errors
    ///
    /// Returns an error if the syncs soup cannot be read.
    pub fn get_sync_status_by_name(&self, name: &str) -> Result<Option<SyncState>> {
        state_store::by_name(self.store(), name)
    }

    /// Forget a sync. Its records stay in the soup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncAlreadyRunning`] if it is queued or running.
    pub fn delete_sync(&self, sync_id: i64) -> Result<()> {
        if self.is_sync_running(sync_id) {
            return Err(Error::SyncAlreadyRunning { id: sync_id });
        }
        state_store::delete_by_id(self.store(), sync_id)
    }

    /// [`SyncManager::delete_sync`] by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncNotFound`] or [`Error::SyncAlreadyRunning`].
    pub fn delete_sync_by_name(&self, name: &str) -> Result<()> {
        let state = state_store::require_by_name(self.store(), name)?;
        self.delete_sync(state.id)
    }

    pub fn register_custom_down(&self, custom_type: &str, handler: Arc<dyn CustomSyncDownHandler>) {
        self.shared.env.registry.register_down(custom_type, handler);
    }

    pub fn register_custom_up(&self, custom_type: &str, handler: Arc<dyn CustomSyncUpHandler>) {
        self.shared.env.registry.register_up(custom_type, handler);
    }

    fn ensure_accepting(&self) -> Result<()> {
        let state = self.state();
        if state == ManagerState::AcceptingSyncs {
            Ok(())
        } else {
            Err(Error::NotAcceptingSyncs {
                state: state.to_string(),
            })
        }
    }

    /// Mark `sync_id` active and return the token of the current epoch.
    fn admit(&self, sync_id: i64) -> Result<CancellationToken> {
        let mut inner = self.shared.lock();
        if inner.state != ManagerState::AcceptingSyncs {
            return Err(Error::NotAcceptingSyncs {
                state: inner.state.to_string(),
            });
        }
        if !inner.active.insert(sync_id) {
            return Err(Error::SyncAlreadyRunning { id: sync_id });
        }
        Ok(inner.token.clone())
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        let sync_id = job.sync_id;
        let sent = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sender| sender.send(job).is_ok());
        if sent {
            Ok(())
        } else {
            self.shared.finish(sync_id);
            Err(Error::Other("sync worker is not running".to_string()))
        }
    }

    fn submit(&self, mut state: SyncState, callback: Option<SyncCallback>) -> Result<SyncState> {
        let stop = self.admit(state.id)?;
        state.status = SyncStatus::Running;
        state.progress = 0;
        state.error = None;
        state.start_time = now_millis();
        state.end_time = 0;
        if let Err(e) = state_store::save(self.store(), &state) {
            self.shared.finish(state.id);
            return Err(e);
        }
        if let Some(callback) = &callback {
            callback(&state);
        }
        debug!(id = state.id, "Queued sync");
        self.enqueue(Job {
            sync_id: state.id,
            stop,
            kind: JobKind::Sync(callback),
        })?;
        Ok(state)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shared.lock().token.cancel();
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
                warn!("Sync worker panicked");
            }
        }
    }
}

/// Managers keyed by store, so each store gets exactly one.
#[derive(Default)]
pub struct SyncManagerRegistry {
    managers: Mutex<HashMap<String, Arc<SyncManager>>>,
}

impl fmt::Debug for SyncManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManagerRegistry").finish_non_exhaustive()
    }
}

impl SyncManagerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry key for a store: its path, or its address when in memory.
    #[must_use]
    pub fn key_for(store: &SmartStore) -> String {
        store.path().map_or_else(
            || format!("memory:{:p}", std::ptr::from_ref(store)),
            |p| p.display().to_string(),
        )
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SyncManager>>> {
        self.managers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The manager for `key`, built by `factory` on first use.
    ///
    /// # Errors
    ///
    /// Returns the error from `factory`.
    pub fn get_or_create<F>(&self, key: &str, factory: F) -> Result<Arc<SyncManager>>
    where
        F: FnOnce() -> Result<SyncManager>,
    {
        let mut managers = self.lock();
        if let Some(manager) = managers.get(key) {
            return Ok(Arc::clone(manager));
        }
        let manager = Arc::new(factory()?);
        managers.insert(key.to_string(), Arc::clone(&manager));
        Ok(manager)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<SyncManager>> {
        self.lock().get(key).cloned()
    }

    /// Stop and forget the manager for `key`. Returns whether one existed.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.lock().remove(key);
        removed.is_some_and(|manager| {
            manager.stop();
            true
        })
    }

    /// Stop and forget every manager.
    pub fn reset_all(&self) {
        let managers: Vec<_> = self.lock().drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.stop();
        }
    }
}
