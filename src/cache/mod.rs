//! Repository cache
//!
//! Keeps exactly one base clone and one dependency environment per
//! [`RepoIdentity`] under `cache_root`:
//!
//! ```text
//! <cache_root>/<owner>__<name>.lock        cross-process setup lock
//! <cache_root>/<owner>__<name>.lease       shared while any process holds a lease
//! <cache_root>/<owner>__<name>/repo/       base clone (worktrees hang off it)
//! <cache_root>/<owner>__<name>/env/        shared dependency environment
//! <cache_root>/<owner>__<name>/.patchbay/  entry.json or failure.json
//! ```
//!
//! # Concurrency
//!
//! Each identity gets its own slot. The first caller for an identity spawns a
//! detached setup task; every caller (including the first) then waits on the
//! slot's state channel. Setup therefore finishes even if the caller that
//! started it is cancelled, and callers for other identities never touch the
//! slot. A failed setup is cached in the slot (and on disk) and returned to
//! every later caller until [`RepositoryCache::reset`] is called.
//!
//! Every [`CacheLease`] also holds a shared `fs2` lock on the entry's `.lease`
//! file. [`RepositoryCache::try_purge`] needs the exclusive lock, so an entry
//! in use by any process on the machine is never deleted.

mod provision;

pub use provision::{GitProvisioner, Provisioner};

use crate::error::{SetupFailure, SetupStage};
use crate::install::{EnvironmentHandle, InterpreterVersion};
use crate::task::RepoIdentity;
use crate::util::write_atomic;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

const META_DIR: &str = ".patchbay";
const ENTRY_FILE: &str = "entry.json";
const FAILURE_FILE: &str = "failure.json";
const CLONE_DIR: &str = "repo";
const ENV_DIR: &str = "env";
const SETUP_LOCK_RETRY_MS: u64 = 250;
const DEFAULT_SETUP_LOCK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupState {
    Uninitialized,
    Cloning,
    InstallingDeps,
    Ready,
    Failed,
}

impl SetupState {
    fn is_settled(&self) -> bool {
        matches!(
            self,
            SetupState::Uninitialized | SetupState::Ready | SetupState::Failed
        )
    }
}

/// What a caller needs from the cache for one repository.
#[derive(Debug, Clone)]
pub struct SetupRequest {
    pub identity: RepoIdentity,
    /// Commit the clone is checked out at while the environment is built.
    pub setup_commit: String,
    pub interpreter: InterpreterVersion,
}

/// A Ready cache entry. Shared read-only by every worktree derived from it.
#[derive(Debug)]
pub struct CacheEntry {
    identity: RepoIdentity,
    dir: PathBuf,
    setup_commit: String,
    environment: EnvironmentHandle,
    /// Serializes `git worktree add/remove` against the shared clone.
    admin: tokio::sync::Mutex<()>,
}

impl CacheEntry {
    pub fn identity(&self) -> &RepoIdentity {
        &self.identity
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn clone_path(&self) -> PathBuf {
        self.dir.join(CLONE_DIR)
    }

    pub fn setup_commit(&self) -> &str {
        &self.setup_commit
    }

    pub fn environment(&self) -> &EnvironmentHandle {
        &self.environment
    }

    pub async fn admin_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.admin.lock().await
    }

    /// Non-blocking variant for `Drop` paths.
    pub fn try_admin_lock(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.admin.try_lock().ok()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    identity: RepoIdentity,
    setup_commit: String,
    environment: EnvironmentHandle,
    ready_at: DateTime<Utc>,
}

struct SlotInner {
    state: SetupState,
    entry: Option<Arc<CacheEntry>>,
    failure: Option<SetupFailure>,
    /// Set when the slot was purged; holders must look the identity up again.
    retired: bool,
}

struct CacheSlot {
    inner: Mutex<SlotInner>,
    state_tx: watch::Sender<SetupState>,
    leases: AtomicUsize,
}

impl CacheSlot {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(SetupState::Uninitialized);
        Self {
            inner: Mutex::new(SlotInner {
                state: SetupState::Uninitialized,
                entry: None,
                failure: None,
                retired: false,
            }),
            state_tx,
            leases: AtomicUsize::new(0),
        }
    }

    fn set_state(&self, inner: &mut SlotInner, state: SetupState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn advance(&self, state: SetupState) {
        let mut inner = lock(&self.inner);
        self.set_state(&mut inner, state);
    }

    fn finish(&self, result: Result<Arc<CacheEntry>, SetupFailure>) {
        let mut inner = lock(&self.inner);
        match result {
            Ok(entry) => {
                inner.entry = Some(entry);
                inner.failure = None;
                self.set_state(&mut inner, SetupState::Ready);
            }
            Err(failure) => {
                inner.entry = None;
                inner.failure = Some(failure);
                self.set_state(&mut inner, SetupState::Failed);
            }
        }
    }

    fn in_use(&self, inner: &SlotInner) -> bool {
        self.leases.load(Ordering::SeqCst) > 0
            || matches!(inner.state, SetupState::Cloning | SetupState::InstallingDeps)
    }
}

/// Shared handle to a Ready entry. While any lease is alive the entry cannot
/// be purged, by this process or another one.
pub struct CacheLease {
    entry: Arc<CacheEntry>,
    slot: Arc<CacheSlot>,
    _shared: Arc<CacheLock>,
}

impl CacheLease {
    fn new(entry: Arc<CacheEntry>, slot: Arc<CacheSlot>, shared: Arc<CacheLock>) -> Self {
        slot.leases.fetch_add(1, Ordering::SeqCst);
        Self {
            entry,
            slot,
            _shared: shared,
        }
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

impl Clone for CacheLease {
    fn clone(&self) -> Self {
        Self::new(self.entry.clone(), self.slot.clone(), self._shared.clone())
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        self.slot.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::ops::Deref for CacheLease {
    type Target = CacheEntry;

    fn deref(&self) -> &CacheEntry {
        &self.entry
    }
}

impl std::fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLease")
            .field("identity", &self.entry.identity)
            .finish()
    }
}

/// Cross-process `fs2` lock on one of an identity's lock files; released on drop.
struct CacheLock {
    file: std::fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Summary of one cache directory, for `patchbay status`.
#[derive(Debug, Clone, Serialize)]
pub struct CachedRepo {
    pub identity: RepoIdentity,
    pub dir: PathBuf,
    pub state: SetupState,
    pub setup_commit: Option<String>,
    pub strategy: Option<String>,
    pub failure: Option<String>,
}

impl CachedRepo {
    pub fn clone_path(&self) -> PathBuf {
        self.dir.join(CLONE_DIR)
    }
}

pub struct RepositoryCache {
    root: PathBuf,
    provisioner: Arc<dyn Provisioner>,
    slots: Mutex<HashMap<RepoIdentity, Arc<CacheSlot>>>,
    lock_timeout: Duration,
}

impl RepositoryCache {
    pub fn new(root: impl Into<PathBuf>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            root: root.into(),
            provisioner,
            slots: Mutex::new(HashMap::new()),
            lock_timeout: DEFAULT_SETUP_LOCK_TIMEOUT,
        }
    }

    /// How long setup waits for another process holding the identity lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, identity: &RepoIdentity) -> PathBuf {
        self.root.join(identity.dir_name())
    }

    fn lock_path(&self, identity: &RepoIdentity) -> PathBuf {
        self.root.join(format!("{}.lock", identity.dir_name()))
    }

    fn lease_path(&self, identity: &RepoIdentity) -> PathBuf {
        self.root.join(format!("{}.lease", identity.dir_name()))
    }

    fn slot(&self, identity: &RepoIdentity) -> Arc<CacheSlot> {
        lock(&self.slots)
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(CacheSlot::new()))
            .clone()
    }

    /// Current in-process state for `identity`.
    pub fn state(&self, identity: &RepoIdentity) -> SetupState {
        match lock(&self.slots).get(identity) {
            Some(slot) => lock(&slot.inner).state,
            None => SetupState::Uninitialized,
        }
    }

    /// Number of live leases on `identity`.
    pub fn lease_count(&self, identity: &RepoIdentity) -> usize {
        lock(&self.slots)
            .get(identity)
            .map(|slot| slot.leases.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Return a lease on the Ready entry for `req.identity`, running first-time
    /// setup if nobody has yet. Concurrent callers for the same identity share
    /// one setup and observe the same entry or the same failure.
    pub async fn acquire(self: &Arc<Self>, req: &SetupRequest) -> Result<CacheLease, SetupFailure> {
        loop {
            let slot = self.slot(&req.identity);
            let ready = {
                let mut inner = lock(&slot.inner);
                if inner.retired {
                    continue;
                }
                match inner.state {
                    SetupState::Ready => inner.entry.clone(),
                    SetupState::Failed => match inner.failure.clone() {
                        Some(failure) => return Err(failure),
                        None => None,
                    },
                    SetupState::Uninitialized => {
                        slot.set_state(&mut inner, SetupState::Cloning);
                        let cache = Arc::clone(self);
                        let setup_slot = slot.clone();
                        let setup_req = req.clone();
                        tokio::spawn(async move {
                            cache.run_setup(setup_slot, setup_req).await;
                        });
                        None
                    }
                    SetupState::Cloning | SetupState::InstallingDeps => None,
                }
            };

            if let Some(entry) = ready {
                match self.share(&entry) {
                    Ok(Some(shared)) => return Ok(CacheLease::new(entry, slot, Arc::new(shared))),
                    Ok(None) => {
                        // Purged by another process since it became Ready.
                        tracing::info!(repo = %req.identity, "cache entry vanished; setting up again");
                        self.retire(&req.identity, &slot);
                        continue;
                    }
                    Err(err) => {
                        return Err(SetupFailure::from_chain(&req.identity, SetupStage::Lock, &err))
                    }
                }
            }

            let mut state_rx = slot.state_tx.subscribe();
            tracing::debug!(repo = %req.identity, "waiting for repository setup");
            if state_rx.wait_for(SetupState::is_settled).await.is_err() {
                return Err(SetupFailure::new(
                    &req.identity,
                    SetupStage::Lock,
                    "cache slot closed while waiting for setup",
                ));
            }
        }
    }

    /// Take the shared lease lock for `entry`, then confirm it is still on disk.
    ///
    /// `Ok(None)` means a purge is running or already removed the entry.
    fn share(&self, entry: &CacheEntry) -> anyhow::Result<Option<CacheLock>> {
        let file = self.open_lock_file(&self.lease_path(&entry.identity))?;
        match FileExt::try_lock_shared(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let shared = CacheLock { file };
        let intact = crate::git::is_repository(&entry.clone_path())
            && entry.environment.python.exists();
        Ok(intact.then_some(shared))
    }

    /// Detach `slot` so the next `acquire` for `identity` starts from scratch.
    fn retire(&self, identity: &RepoIdentity, slot: &Arc<CacheSlot>) {
        let mut slots = lock(&self.slots);
        let mut inner = lock(&slot.inner);
        if inner.retired {
            return;
        }
        inner.retired = true;
        inner.entry = None;
        drop(inner);
        if slots.get(identity).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(identity);
        }
    }

    async fn run_setup(self: Arc<Self>, slot: Arc<CacheSlot>, req: SetupRequest) {
        let mut guard = SetupGuard {
            slot: slot.clone(),
            identity: req.identity.clone(),
            armed: true,
        };
        let started = Instant::now();
        let result = self.setup(&slot, &req).await;
        match &result {
            Ok(entry) => tracing::info!(
                repo = %req.identity,
                strategy = %entry.environment.strategy,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "repository ready"
            ),
            Err(failure) => {
                tracing::error!(repo = %req.identity, error = %failure, "repository setup failed");
                self.persist_failure(&req.identity, failure);
            }
        }
        slot.finish(result);
        guard.armed = false;
    }

    async fn setup(&self, slot: &CacheSlot, req: &SetupRequest) -> Result<Arc<CacheEntry>, SetupFailure> {
        let identity = &req.identity;
        let fail = |stage: SetupStage, err: anyhow::Error| SetupFailure::from_chain(identity, stage, &err);

        let dir = self.entry_dir(identity);
        fs::create_dir_all(dir.join(META_DIR))
            .map_err(|e| fail(SetupStage::Lock, e.into()))?;
        let _lock = self
            .lock_identity(identity)
            .await
            .map_err(|e| fail(SetupStage::Lock, e))?;

        if let Some(failure) = read_json::<SetupFailure>(&dir.join(META_DIR).join(FAILURE_FILE)) {
            tracing::warn!(repo = %identity, "previous setup failure recorded; reset to retry");
            return Err(failure);
        }
        if let Some(entry) = self.load_ready(identity) {
            if entry.setup_commit != req.setup_commit {
                tracing::debug!(
                    repo = %identity,
                    cached = %entry.setup_commit,
                    requested = %req.setup_commit,
                    "reusing environment built at a different setup commit"
                );
            }
            tracing::info!(repo = %identity, "using cached repo");
            return Ok(Arc::new(entry));
        }

        let clone_path = dir.join(CLONE_DIR);
        let env_dir = dir.join(ENV_DIR);
        remove_if_exists(&clone_path).map_err(|e| fail(SetupStage::Clone, e))?;
        remove_if_exists(&env_dir).map_err(|e| fail(SetupStage::Install, e))?;

        tracing::info!(repo = %identity, commit = %req.setup_commit, "cloning repository");
        self.provisioner
            .fetch_clone(identity, &clone_path)
            .await
            .map_err(|e| fail(SetupStage::Clone, e))?;
        self.provisioner
            .checkout(&clone_path, &req.setup_commit)
            .await
            .map_err(|e| fail(SetupStage::Checkout, e))?;

        slot.advance(SetupState::InstallingDeps);
        let environment = self
            .provisioner
            .install(&clone_path, &env_dir, req.interpreter)
            .await
            .map_err(|e| fail(SetupStage::Install, e))?;

        let persisted = PersistedEntry {
            identity: identity.clone(),
            setup_commit: req.setup_commit.clone(),
            environment: environment.clone(),
            ready_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&persisted)
            .map_err(|e| fail(SetupStage::Install, e.into()))?;
        write_atomic(&dir.join(META_DIR).join(ENTRY_FILE), &content)
            .map_err(|e| fail(SetupStage::Install, e))?;

        Ok(Arc::new(CacheEntry {
            identity: identity.clone(),
            dir,
            setup_commit: req.setup_commit.clone(),
            environment,
            admin: tokio::sync::Mutex::new(()),
        }))
    }

    /// A Ready entry persisted by an earlier run, if its clone and environment survive.
    fn load_ready(&self, identity: &RepoIdentity) -> Option<CacheEntry> {
        let dir = self.entry_dir(identity);
        let persisted: PersistedEntry = read_json(&dir.join(META_DIR).join(ENTRY_FILE))?;
        if &persisted.identity != identity
            || !crate::git::is_repository(&dir.join(CLONE_DIR))
            || !persisted.environment.python.exists()
        {
            return None;
        }
        Some(CacheEntry {
            identity: persisted.identity,
            dir,
            setup_commit: persisted.setup_commit,
            environment: persisted.environment,
            admin: tokio::sync::Mutex::new(()),
        })
    }

    fn persist_failure(&self, identity: &RepoIdentity, failure: &SetupFailure) {
        // Lock failures are about contention, not the repository itself.
        if failure.stage == SetupStage::Lock {
            return;
        }
        let path = self.entry_dir(identity).join(META_DIR).join(FAILURE_FILE);
        if path.exists() {
            return;
        }
        let written = serde_json::to_string_pretty(failure)
            .map_err(anyhow::Error::from)
            .and_then(|content| write_atomic(&path, &content));
        if let Err(err) = written {
            tracing::warn!(repo = %identity, error = %err, "failed to persist setup failure");
        }
    }

    async fn lock_identity(&self, identity: &RepoIdentity) -> anyhow::Result<CacheLock> {
        let file = self.open_lock_file(&self.lock_path(identity))?;
        let start = Instant::now();
        let mut announced = false;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(CacheLock { file }),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= self.lock_timeout {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for cache lock ({}s)",
                            self.lock_timeout.as_secs()
                        ));
                    }
                    if !announced {
                        tracing::info!(repo = %identity, "another process is setting up this repository; waiting");
                        announced = true;
                    }
                    tokio::time::sleep(Duration::from_millis(SETUP_LOCK_RETRY_MS)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn try_lock_exclusive(&self, path: &Path) -> anyhow::Result<Option<CacheLock>> {
        let file = self.open_lock_file(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(CacheLock { file })),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn open_lock_file(&self, path: &Path) -> anyhow::Result<std::fs::File> {
        fs::create_dir_all(&self.root)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(file)
    }

    /// Clear a cached setup failure so the next `acquire` retries.
    ///
    /// Returns `false` when there was nothing to reset.
    pub fn reset(&self, identity: &RepoIdentity) -> anyhow::Result<bool> {
        let mut cleared = false;
        if let Some(slot) = lock(&self.slots).get(identity).cloned() {
            let mut inner = lock(&slot.inner);
            if inner.state == SetupState::Failed {
                inner.failure = None;
                slot.set_state(&mut inner, SetupState::Uninitialized);
                cleared = true;
            }
        }
        let failure_path = self.entry_dir(identity).join(META_DIR).join(FAILURE_FILE);
        match fs::remove_file(&failure_path) {
            Ok(()) => cleared = true,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if cleared {
            tracing::info!(repo = %identity, "cleared cached setup failure");
        }
        Ok(cleared)
    }

    /// Delete the cache directory for `identity` unless it is leased or being
    /// set up, here or in another process.
    ///
    /// Returns the number of bytes reclaimed, or `None` when skipped.
    pub fn try_purge(&self, identity: &RepoIdentity) -> anyhow::Result<Option<u64>> {
        {
            let mut slots = lock(&self.slots);
            if let Some(slot) = slots.get(identity).cloned() {
                let mut inner = lock(&slot.inner);
                if slot.in_use(&inner) {
                    return Ok(None);
                }
                inner.retired = true;
                inner.entry = None;
                drop(inner);
                slots.remove(identity);
            }
        }

        let Some(_setup) = self.try_lock_exclusive(&self.lock_path(identity))? else {
            return Ok(None);
        };
        let Some(_leases) = self.try_lock_exclusive(&self.lease_path(identity))? else {
            tracing::debug!(repo = %identity, "cache entry leased by another process; not purging");
            return Ok(None);
        };
        let dir = self.entry_dir(identity);
        let bytes = crate::sweeper::dir_size(&dir);
        remove_if_exists(&dir)?;
        tracing::info!(repo = %identity, bytes, "purged cache entry");
        Ok(Some(bytes))
    }

    /// Every identity directory under the cache root.
    pub fn list_on_disk(&self) -> Vec<CachedRepo> {
        let Ok(read_dir) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut repos: Vec<CachedRepo> = read_dir
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let identity: RepoIdentity = e.file_name().to_str()?.parse().ok()?;
                Some(self.describe(identity))
            })
            .collect();
        repos.sort_by(|a, b| a.identity.cmp(&b.identity));
        repos
    }

    fn describe(&self, identity: RepoIdentity) -> CachedRepo {
        let dir = self.entry_dir(&identity);
        let meta = dir.join(META_DIR);
        let live = self.state(&identity);
        let failure = read_json::<SetupFailure>(&meta.join(FAILURE_FILE));
        let entry = read_json::<PersistedEntry>(&meta.join(ENTRY_FILE));
        let state = if live != SetupState::Uninitialized {
            live
        } else if failure.is_some() {
            SetupState::Failed
        } else if entry.is_some() {
            SetupState::Ready
        } else {
            SetupState::Uninitialized
        };
        CachedRepo {
            identity,
            dir,
            state,
            setup_commit: entry.as_ref().map(|e| e.setup_commit.clone()),
            strategy: entry.map(|e| e.environment.strategy),
            failure: failure.map(|f| f.to_string()),
        }
    }
}

/// Marks the slot failed if the setup task is dropped before finishing.
struct SetupGuard {
    slot: Arc<CacheSlot>,
    identity: RepoIdentity,
    armed: bool,
}

impl Drop for SetupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.slot.finish(Err(SetupFailure::new(
                &self.identity,
                SetupStage::Lock,
                "setup task aborted before completion",
            )));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(anyhow::Error::from(err).context(format!("Failed to remove '{}'", path.display()))),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{request, FakeProvisioner};
    use super::*;
    use std::sync::atomic::Ordering::SeqCst;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    fn cache_with(root: &Path, provisioner: Arc<FakeProvisioner>) -> Arc<RepositoryCache> {
        Arc::new(RepositoryCache::new(root, provisioner).with_lock_timeout(Duration::from_secs(5)))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_share_one_setup() {
        let dir = tempdir().unwrap();
        let provisioner = Arc::new(FakeProvisioner {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let cache = cache_with(dir.path(), provisioner.clone());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.acquire(&request("psf/requests")).await
            }));
        }
        let mut leases = Vec::new();
        for handle in handles {
            leases.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(provisioner.clones.load(SeqCst), 1);
        assert_eq!(provisioner.installs.load(SeqCst), 1);
        for lease in &leases {
            assert!(Arc::ptr_eq(lease.entry(), leases[0].entry()));
            assert_eq!(lease.environment(), leases[0].environment());
        }
        let identity: RepoIdentity = "psf/requests".parse().unwrap();
        assert_eq!(cache.state(&identity), SetupState::Ready);
        assert_eq!(cache.lease_count(&identity), 16);
        drop(leases);
        assert_eq!(cache.lease_count(&identity), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_is_cached_until_reset() {
        let dir = tempdir().unwrap();
        let provisioner = Arc::new(FakeProvisioner::default());
        provisioner.fail_install.store(true, SeqCst);
        let cache = cache_with(dir.path(), provisioner.clone());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.acquire(&request("pallets/flask")).await
            }));
        }
        let mut failures = Vec::new();
        for handle in handles {
            failures.push(handle.await.unwrap().unwrap_err());
        }
        assert!(failures.iter().all(|f| f == &failures[0]));
        assert_eq!(failures[0].stage, SetupStage::Install);
        assert!(failures[0].detail.contains("resolver exploded"));

        // No silent retry.
        assert!(cache.acquire(&request("pallets/flask")).await.is_err());
        assert_eq!(provisioner.installs.load(SeqCst), 1);

        let identity: RepoIdentity = "pallets/flask".parse().unwrap();
        provisioner.fail_install.store(false, SeqCst);
        assert!(cache.reset(&identity).unwrap());
        assert_eq!(cache.state(&identity), SetupState::Uninitialized);

        let lease = cache.acquire(&request("pallets/flask")).await.unwrap();
        assert_eq!(lease.environment().strategy, "fake");
        assert_eq!(provisioner.installs.load(SeqCst), 2);
        assert!(!cache.reset(&identity).unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unrelated_identities_do_not_block() {
        let dir = tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let provisioner = Arc::new(FakeProvisioner {
            gate: Some(("slow".to_string(), gate.clone())),
            ..Default::default()
        });
        let cache = cache_with(dir.path(), provisioner.clone());

        let slow_cache = cache.clone();
        let slow = tokio::spawn(async move { slow_cache.acquire(&request("slow/repo")).await });
        let slow_identity: RepoIdentity = "slow/repo".parse().unwrap();
        while provisioner.clones.load(SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let fast = tokio::time::timeout(
            Duration::from_secs(10),
            cache.acquire(&request("fast/repo")),
        )
        .await
        .expect("fast identity blocked behind slow one")
        .unwrap();
        assert_eq!(fast.identity().owner(), "fast");
        assert_eq!(cache.state(&slow_identity), SetupState::Cloning);

        gate.notify_one();
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn setup_survives_cancelled_caller() {
        let dir = tempdir().unwrap();
        let provisioner = Arc::new(FakeProvisioner {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let cache = cache_with(dir.path(), provisioner.clone());

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), cache.acquire(&request("a/b"))).await;
        assert!(abandoned.is_err());

        let lease = cache.acquire(&request("a/b")).await.unwrap();
        assert_eq!(provisioner.clones.load(SeqCst), 1);
        assert!(lease.clone_path().join(".git").exists());
    }

    #[tokio::test]
    async fn ready_entry_is_reused_across_instances() {
        let dir = tempdir().unwrap();
        let first = Arc::new(FakeProvisioner::default());
        let lease = cache_with(dir.path(), first.clone())
            .acquire(&request("a/b"))
            .await
            .unwrap();
        let env = lease.environment().clone();
        drop(lease);

        let second = Arc::new(FakeProvisioner::default());
        let cache = cache_with(dir.path(), second.clone());
        let lease = cache.acquire(&request("a/b")).await.unwrap();
        assert_eq!(lease.environment(), &env);
        assert_eq!(second.clones.load(SeqCst), 0);
        assert_eq!(second.installs.load(SeqCst), 0);

        let listed = cache.list_on_disk();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, SetupState::Ready);
        assert_eq!(listed[0].strategy.as_deref(), Some("fake"));
    }

    #[tokio::test]
    async fn persisted_failure_blocks_new_instances_until_reset() {
        let dir = tempdir().unwrap();
        let failing = Arc::new(FakeProvisioner::default());
        failing.fail_install.store(true, SeqCst);
        assert!(cache_with(dir.path(), failing).acquire(&request("a/b")).await.is_err());

        let fresh = Arc::new(FakeProvisioner::default());
        let cache = cache_with(dir.path(), fresh.clone());
        let err = cache.acquire(&request("a/b")).await.unwrap_err();
        assert!(err.detail.contains("resolver exploded"));
        assert_eq!(fresh.clones.load(SeqCst), 0);
        assert_eq!(cache.list_on_disk()[0].state, SetupState::Failed);

        let identity: RepoIdentity = "a/b".parse().unwrap();
        assert!(cache.reset(&identity).unwrap());
        cache.acquire(&request("a/b")).await.unwrap();
        assert_eq!(fresh.clones.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn purge_skips_leased_entries() {
        let dir = tempdir().unwrap();
        let cache = cache_with(dir.path(), Arc::new(FakeProvisioner::default()));
        let identity: RepoIdentity = "a/b".parse().unwrap();
        let lease = cache.acquire(&request("a/b")).await.unwrap();
        let entry_dir = cache.entry_dir(&identity);

        let copy = lease.clone();
        drop(lease);
        assert_eq!(cache.try_purge(&identity).unwrap(), None);
        assert!(entry_dir.exists());

        drop(copy);
        let reclaimed = cache.try_purge(&identity).unwrap();
        assert!(reclaimed.unwrap() > 0);
        assert!(!entry_dir.exists());
        assert_eq!(cache.state(&identity), SetupState::Uninitialized);
    }

    #[tokio::test]
    async fn purge_respects_leases_held_by_another_instance() {
        let dir = tempdir().unwrap();
        let identity: RepoIdentity = "a/b".parse().unwrap();
        let running = cache_with(dir.path(), Arc::new(FakeProvisioner::default()));
        let lease = running.acquire(&request("a/b")).await.unwrap();

        // A separate instance on the same root shares no in-memory state.
        let sweeping = cache_with(dir.path(), Arc::new(FakeProvisioner::default()));
        assert_eq!(sweeping.try_purge(&identity).unwrap(), None);
        assert!(lease.clone_path().join(".git").exists());
        assert!(lease.environment().python.exists());

        drop(lease);
        assert!(sweeping.try_purge(&identity).unwrap().unwrap() > 0);
        assert!(!running.entry_dir(&identity).exists());
    }

    #[tokio::test]
    async fn acquire_sets_up_again_after_foreign_purge() {
        let dir = tempdir().unwrap();
        let identity: RepoIdentity = "a/b".parse().unwrap();
        let provisioner = Arc::new(FakeProvisioner::default());
        let running = cache_with(dir.path(), provisioner.clone());
        drop(running.acquire(&request("a/b")).await.unwrap());

        let sweeping = cache_with(dir.path(), Arc::new(FakeProvisioner::default()));
        assert!(sweeping.try_purge(&identity).unwrap().is_some());

        let lease = running.acquire(&request("a/b")).await.unwrap();
        assert_eq!(provisioner.clones.load(SeqCst), 2);
        assert!(lease.clone_path().join(".git").exists());
    }
}
