//! Per-attempt working copies
//!
//! Every attempt gets a detached `git worktree` of the cached clone under
//! `worktree_root`, named `<owner>__<name>-<commit12>-<uuid12>`. The cache
//! entry's environment is symlinked in as `.venv`, never copied.
//!
//! A [`WorktreeHandle`] removes its directory on [`WorktreeHandle::destroy`]
//! and, if that never ran, on drop. For its whole life it also holds an
//! exclusive `fs2` lock on `<name>.lock` next to the directory, which is how a
//! sweep running in another process tells a live worktree from a leftover.

use crate::cache::CacheLease;
use crate::error::AttemptError;
use crate::git;
use crate::install::EnvironmentHandle;
use anyhow::{anyhow, Context};
use backon::{ExponentialBuilder, Retryable};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Name of the environment link inside each worktree.
pub const ENV_LINK: &str = ".venv";
pub(crate) const PROMPT_SUFFIX: &str = ".prompt.md";
pub(crate) const LOCK_SUFFIX: &str = ".lock";

type LiveSet = Arc<Mutex<HashSet<PathBuf>>>;

pub struct WorktreeManager {
    root: PathBuf,
    io_retries: usize,
    live: LiveSet,
}

impl WorktreeManager {
    pub fn new(root: impl Into<PathBuf>, io_retries: usize) -> Self {
        Self {
            root: root.into(),
            io_retries,
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths of worktrees currently held by a handle in this process.
    pub fn live_paths(&self) -> HashSet<PathBuf> {
        lock(&self.live).clone()
    }

    pub fn is_live(&self, path: &Path) -> bool {
        lock(&self.live).contains(path)
    }

    /// Check out `base_commit` from the leased entry into a fresh worktree.
    pub async fn create(
        &self,
        lease: &CacheLease,
        base_commit: &str,
    ) -> Result<WorktreeHandle, AttemptError> {
        let mut handle = self.reserve(lease, base_commit).map_err(|err| {
            AttemptError::WorktreeIoFailure {
                tries: 1,
                detail: format!("{:#}", err),
            }
        })?;

        let tries = AtomicUsize::new(0);
        let created = (|| async {
            tries.fetch_add(1, Ordering::SeqCst);
            handle.materialize().await
        })
        .retry(backoff(self.io_retries))
        .notify(|err: &anyhow::Error, dur: Duration| {
            tracing::warn!(
                path = %handle.path.display(),
                error = %format!("{:#}", err),
                "worktree creation failed, retrying after {:.2}s",
                dur.as_secs_f64()
            );
        })
        .await;

        match created {
            Ok(()) => {
                tracing::debug!(
                    repo = %lease.identity(),
                    commit = %base_commit,
                    path = %handle.path.display(),
                    "worktree created"
                );
                Ok(handle)
            }
            Err(err) => {
                let _ = handle.destroy().await;
                Err(AttemptError::WorktreeIoFailure {
                    tries: tries.load(Ordering::SeqCst),
                    detail: format!("{:#}", err),
                })
            }
        }
    }

    /// Pick an unused name and register it as live before anything touches disk.
    fn reserve(&self, lease: &CacheLease, base_commit: &str) -> anyhow::Result<WorktreeHandle> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("Failed to create worktree root '{}'", self.root.display())
        })?;
        let commit_prefix: String = base_commit.chars().take(12).collect();
        for _ in 0..8 {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            let name = format!(
                "{}-{}-{}",
                lease.identity().dir_name(),
                commit_prefix,
                &suffix[..12]
            );
            let path = self.root.join(&name);
            if path.exists() {
                continue;
            }
            if !lock(&self.live).insert(path.clone()) {
                continue;
            }
            let hold = match HoldLock::create(&self.root.join(format!("{}{}", name, LOCK_SUFFIX))) {
                Ok(Some(hold)) => hold,
                Ok(None) => {
                    lock(&self.live).remove(&path);
                    continue;
                }
                Err(err) => {
                    lock(&self.live).remove(&path);
                    return Err(err);
                }
            };
            return Ok(WorktreeHandle {
                path,
                name,
                base_commit: base_commit.to_string(),
                lease: lease.clone(),
                live: self.live.clone(),
                io_retries: self.io_retries,
                destroyed: false,
                hold: Some(hold),
            });
        }
        Err(anyhow!("could not find an unused worktree name"))
    }
}

/// Exclusive ownership of one working copy.
pub struct WorktreeHandle {
    path: PathBuf,
    name: String,
    base_commit: String,
    lease: CacheLease,
    live: LiveSet,
    io_retries: usize,
    destroyed: bool,
    hold: Option<HoldLock>,
}

impl WorktreeHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_commit(&self) -> &str {
        &self.base_commit
    }

    pub fn environment(&self) -> &EnvironmentHandle {
        self.lease.environment()
    }

    /// Linked environment as seen from inside the worktree.
    pub fn env_link(&self) -> PathBuf {
        self.path.join(ENV_LINK)
    }

    /// Sidecar file next to (not inside) the worktree, removed with it.
    pub fn prompt_path(&self) -> PathBuf {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        parent.join(format!("{}{}", self.name, PROMPT_SUFFIX))
    }

    /// Stage everything the agent changed, minus the environment link, and
    /// diff it against the base commit.
    pub async fn capture_diff(&self) -> anyhow::Result<String> {
        git::stage_and_diff(&self.path, &self.base_commit, &[ENV_LINK]).await
    }

    async fn materialize(&self) -> anyhow::Result<()> {
        let entry = self.lease.entry();
        let clone = entry.clone_path();
        {
            let _admin = entry.admin_lock().await;
            git::ensure_commit(&clone, &self.base_commit).await?;
            if let Err(err) = git::worktree_add(&clone, &self.path, &self.base_commit).await {
                self.remove_locked(&clone).await;
                return Err(err);
            }
        }
        if let Err(err) = link_environment(&self.path, &entry.environment().root) {
            let _admin = entry.admin_lock().await;
            self.remove_locked(&clone).await;
            return Err(err);
        }
        Ok(())
    }

    /// Remove whatever exists at the path. Caller holds the admin lock.
    async fn remove_locked(&self, clone: &Path) {
        let _ = tokio::fs::remove_file(self.env_link()).await;
        if self.path.exists() && git::worktree_remove(clone, &self.path).await.is_err() {
            let _ = tokio::fs::remove_dir_all(&self.path).await;
        }
        let _ = git::worktree_prune(clone).await;
    }

    async fn remove_once(&self) -> anyhow::Result<()> {
        let entry = self.lease.entry();
        let clone = entry.clone_path();
        {
            let _admin = entry.admin_lock().await;
            self.remove_locked(&clone).await;
        }
        match tokio::fs::remove_file(self.prompt_path()).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if self.path.exists() {
            return Err(anyhow!("worktree '{}' still exists", self.path.display()));
        }
        Ok(())
    }

    /// Remove the working copy. Safe to call more than once.
    pub async fn destroy(&mut self) -> Result<(), AttemptError> {
        if self.destroyed {
            return Ok(());
        }
        let tries = AtomicUsize::new(0);
        let removed = (|| async {
            tries.fetch_add(1, Ordering::SeqCst);
            self.remove_once().await
        })
        .retry(backoff(self.io_retries))
        .notify(|err: &anyhow::Error, dur: Duration| {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "worktree removal failed, retrying after {:.2}s",
                dur.as_secs_f64()
            );
        })
        .await;

        match removed {
            Ok(()) => {
                self.destroyed = true;
                self.hold = None;
                lock(&self.live).remove(&self.path);
                tracing::debug!(path = %self.path.display(), "worktree destroyed");
                Ok(())
            }
            Err(err) => Err(AttemptError::WorktreeIoFailure {
                tries: tries.load(Ordering::SeqCst),
                detail: format!("{:#}", err),
            }),
        }
    }

    /// Blocking best-effort removal for when `destroy` never ran.
    fn destroy_blocking(&mut self) {
        let entry = self.lease.entry();
        let clone = entry.clone_path();
        let _ = std::fs::remove_file(self.env_link());
        // git metadata is only touched when nobody else is mid add/remove.
        let admin = entry.try_admin_lock();
        if self.path.exists() {
            let removed_by_git = admin.is_some() && git::worktree_remove_blocking(&clone, &self.path);
            if !removed_by_git {
                let _ = std::fs::remove_dir_all(&self.path);
            }
        }
        if admin.is_some() {
            git::worktree_prune_blocking(&clone);
        }
        drop(admin);
        let _ = std::fs::remove_file(self.prompt_path());
        self.destroyed = !self.path.exists();
    }
}

impl Drop for WorktreeHandle {
    fn drop(&mut self) {
        if !self.destroyed {
            tracing::warn!(path = %self.path.display(), "worktree dropped without destroy; cleaning up");
            self.destroy_blocking();
        }
        lock(&self.live).remove(&self.path);
    }
}

impl std::fmt::Debug for WorktreeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorktreeHandle")
            .field("path", &self.path)
            .field("base_commit", &self.base_commit)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Exclusive lock on a worktree's `.lock` sidecar. Dropping it deletes the
/// sidecar first, so the file never outlives the lock.
pub(crate) struct HoldLock {
    path: PathBuf,
    file: File,
}

impl HoldLock {
    /// Create and lock a fresh sidecar; `None` if someone else holds it.
    fn create(path: &Path) -> anyhow::Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to create '{}'", path.display()))?;
        Self::lock(path, file).map_err(anyhow::Error::from)
    }

    fn lock(path: &Path, file: File) -> std::io::Result<Option<Self>> {
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self {
                path: path.to_path_buf(),
                file,
            })),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for HoldLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
    }
}

/// Whether a sweep may remove `entry` (a worktree directory or one of its
/// sidecars) from the worktree root.
pub(crate) enum Claim {
    /// Nobody holds it; keep the lock, if there was one, until removal is done.
    Free(Option<HoldLock>),
    /// A handle in some process still owns it.
    Held,
}

pub(crate) fn claim_for_removal(entry: &Path) -> Claim {
    let name = entry
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(PROMPT_SUFFIX)
        .or_else(|| name.strip_suffix(LOCK_SUFFIX))
        .unwrap_or(name.as_str());
    let lock_path = entry.with_file_name(format!("{}{}", stem, LOCK_SUFFIX));
    let file = match OpenOptions::new().read(true).write(true).open(&lock_path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Claim::Free(None),
        Err(_) => return Claim::Held,
    };
    match HoldLock::lock(&lock_path, file) {
        Ok(Some(hold)) => Claim::Free(Some(hold)),
        Ok(None) | Err(_) => Claim::Held,
    }
}

fn backoff(io_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(io_retries)
}

fn link_environment(worktree: &Path, env_root: &Path) -> anyhow::Result<()> {
    let link = worktree.join(ENV_LINK);
    if link.symlink_metadata().is_ok() {
        return Err(anyhow!(
            "'{}' already exists in the checkout; refusing to shadow it",
            link.display()
        ));
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(env_root, &link)
        .with_context(|| format!("Failed to link environment into '{}'", worktree.display()))?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_dir(env_root, &link)
        .with_context(|| format!("Failed to link environment into '{}'", worktree.display()))?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
