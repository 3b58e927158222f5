//! Cleanup sweeper
//!
//! Removes leftover worktrees (and, on request, whole cache entries) either by
//! age or from an explicit list. Anything held by a running attempt, in this
//! process or another, is skipped: worktrees are checked against the manager's
//! live set and their `.lock` sidecar, and cache entries are only purged when
//! nobody holds a lease on them or their setup lock.

use crate::cache::{RepositoryCache, SetupState};
use crate::git;
use crate::task::RepoIdentity;
use crate::worktree::{claim_for_removal, Claim, WorktreeManager, LOCK_SUFFIX, PROMPT_SUFFIX};
use futures::future::join_all;
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepTarget {
    /// Everything last modified longer ago than this.
    OlderThan(Duration),
    /// Exactly these paths; each must be a worktree or cache entry directory.
    Paths(Vec<PathBuf>),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub worktrees_removed: Vec<PathBuf>,
    pub cache_entries_removed: Vec<String>,
    pub skipped_live: Vec<PathBuf>,
    pub rejected: Vec<(PathBuf, String)>,
    pub bytes_reclaimed: u64,
}

/// Total size in bytes of the regular files under `path`.
pub fn dir_size(path: &Path) -> u64 {
    let files: Vec<PathBuf> = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files
        .par_iter()
        .filter_map(|p| fs::symlink_metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

pub struct Sweeper {
    worktrees: Arc<WorktreeManager>,
    cache: Arc<RepositoryCache>,
}

impl Sweeper {
    pub fn new(worktrees: Arc<WorktreeManager>, cache: Arc<RepositoryCache>) -> Self {
        Self { worktrees, cache }
    }

    /// Remove what `target` selects. Cache entries are only considered when
    /// `include_cache` is set.
    pub async fn sweep(&self, target: &SweepTarget, include_cache: bool) -> SweepReport {
        let mut report = SweepReport::default();
        let (worktrees, entries) = match target {
            SweepTarget::OlderThan(max_age) => {
                let entries = if include_cache {
                    self.stale_cache_entries(*max_age)
                } else {
                    Vec::new()
                };
                (self.stale_worktrees(*max_age), entries)
            }
            SweepTarget::Paths(paths) => self.classify(paths, include_cache, &mut report),
        };

        self.remove_worktrees(worktrees, &mut report).await;
        self.prune_clones().await;

        for identity in entries {
            match self.cache.try_purge(&identity) {
                Ok(Some(bytes)) => {
                    report.bytes_reclaimed += bytes;
                    report.cache_entries_removed.push(identity.to_string());
                }
                Ok(None) => report.skipped_live.push(self.cache.entry_dir(&identity)),
                Err(err) => report
                    .rejected
                    .push((self.cache.entry_dir(&identity), format!("{:#}", err))),
            }
        }

        tracing::info!(
            worktrees = report.worktrees_removed.len(),
            cache_entries = report.cache_entries_removed.len(),
            skipped_live = report.skipped_live.len(),
            bytes = report.bytes_reclaimed,
            "sweep finished"
        );
        report
    }

    /// Worktree directories, and orphaned sidecar files, older than `max_age`.
    fn stale_worktrees(&self, max_age: Duration) -> Vec<PathBuf> {
        let root = self.worktrees.root();
        let Ok(read_dir) = fs::read_dir(root) else {
            return Vec::new();
        };
        read_dir
            .filter_map(|e| e.ok())
            .filter(|e| older_than(&e.path(), max_age))
            .filter_map(|e| {
                let path = e.path();
                let name = e.file_name().to_string_lossy().to_string();
                let sidecar_stem = name
                    .strip_suffix(PROMPT_SUFFIX)
                    .or_else(|| name.strip_suffix(LOCK_SUFFIX));
                if let Some(stem) = sidecar_stem {
                    // Removed together with its worktree when that still exists.
                    return (!root.join(stem).exists()).then_some(path);
                }
                path.is_dir().then_some(path)
            })
            .collect()
    }

    fn stale_cache_entries(&self, max_age: Duration) -> Vec<RepoIdentity> {
        self.cache
            .list_on_disk()
            .into_iter()
            .filter(|repo| repo.state != SetupState::Cloning && repo.state != SetupState::InstallingDeps)
            .filter(|repo| older_than(&repo.dir, max_age))
            .map(|repo| repo.identity)
            .collect()
    }

    /// Sort explicit paths into worktrees and cache entries, rejecting
    /// anything outside the managed roots.
    fn classify(
        &self,
        paths: &[PathBuf],
        include_cache: bool,
        report: &mut SweepReport,
    ) -> (Vec<PathBuf>, Vec<RepoIdentity>) {
        let worktree_root = fs::canonicalize(self.worktrees.root()).ok();
        let cache_root = fs::canonicalize(self.cache.root()).ok();
        let mut worktrees = Vec::new();
        let mut entries = Vec::new();

        for path in paths {
            let resolved = match fs::canonicalize(path) {
                Ok(resolved) => resolved,
                Err(err) => {
                    report.rejected.push((path.clone(), err.to_string()));
                    continue;
                }
            };
            let parent = resolved.parent();
            let Some(name) = resolved.file_name() else {
                report.rejected.push((path.clone(), "not a managed path".to_string()));
                continue;
            };
            if parent.is_some() && parent == worktree_root.as_deref() {
                worktrees.push(self.worktrees.root().join(name));
            } else if parent.is_some() && parent == cache_root.as_deref() {
                let identity = name.to_str().and_then(|n| n.parse::<RepoIdentity>().ok());
                match identity {
                    Some(identity) if include_cache && resolved.is_dir() => entries.push(identity),
                    Some(_) if !include_cache => report
                        .rejected
                        .push((path.clone(), "cache entry given without --cache".to_string())),
                    _ => report
                        .rejected
                        .push((path.clone(), "not a cache entry directory".to_string())),
                }
            } else {
                report.rejected.push((
                    path.clone(),
                    "outside the worktree and cache roots".to_string(),
                ));
            }
        }
        (worktrees, entries)
    }

    async fn remove_worktrees(&self, paths: Vec<PathBuf>, report: &mut SweepReport) {
        let mut candidates = Vec::new();
        for path in paths {
            if self.worktrees.is_live(&path) {
                report.skipped_live.push(path);
                continue;
            }
            match claim_for_removal(&path) {
                Claim::Free(hold) => candidates.push((path, hold)),
                Claim::Held => {
                    tracing::debug!(path = %path.display(), "worktree held by another process");
                    report.skipped_live.push(path);
                }
            }
        }

        let removals = candidates.into_iter().map(|(path, hold)| async move {
            let measured = path.clone();
            let bytes = tokio::task::spawn_blocking(move || dir_size(&measured))
                .await
                .unwrap_or(0);
            let result = remove_path(&path).await;
            if result.is_ok() {
                let sidecar = sidecar_of(&path);
                let _ = tokio::fs::remove_file(sidecar).await;
            }
            drop(hold);
            (path, bytes, result)
        });

        for (path, bytes, result) in join_all(removals).await {
            match result {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), bytes, "removed worktree");
                    report.bytes_reclaimed += bytes;
                    report.worktrees_removed.push(path);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "could not remove worktree");
                    report.rejected.push((path, err.to_string()));
                }
            }
        }
    }

    /// Drop git's bookkeeping for worktrees that no longer exist.
    async fn prune_clones(&self) {
        for repo in self.cache.list_on_disk() {
            if repo.state != SetupState::Ready {
                continue;
            }
            let clone = repo.clone_path();
            if !git::is_repository(&clone) {
                continue;
            }
            if let Err(err) = git::worktree_prune(&clone).await {
                tracing::warn!(repo = %repo.identity, error = %format!("{:#}", err), "git worktree prune failed");
            }
        }
    }
}

fn older_than(path: &Path, max_age: Duration) -> bool {
    fs::symlink_metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age >= max_age)
        .unwrap_or(false)
}

fn sidecar_of(worktree: &Path) -> PathBuf {
    let name = worktree
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    worktree.with_file_name(format!("{}{}", name, PROMPT_SUFFIX))
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::{request, FakeProvisioner};
    use tempfile::tempdir;

    struct Fixture {
        dir: tempfile::TempDir,
        cache: Arc<RepositoryCache>,
        worktrees: Arc<WorktreeManager>,
        sweeper: Sweeper,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let cache = Arc::new(RepositoryCache::new(
            dir.path().join("cache"),
            Arc::new(FakeProvisioner::default()),
        ));
        let worktrees = Arc::new(WorktreeManager::new(dir.path().join("worktrees"), 1));
        let sweeper = Sweeper::new(worktrees.clone(), cache.clone());
        Fixture {
            dir,
            cache,
            worktrees,
            sweeper,
        }
    }

    #[test]
    fn sizes_nested_files() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("a/b/two"), vec![0u8; 28]).unwrap();
        assert_eq!(dir_size(dir.path()), 128);
        assert_eq!(dir_size(&dir.path().join("missing")), 0);
    }

    #[tokio::test]
    async fn removes_orphans_but_not_live_worktrees() {
        let fx = fixture();
        let lease = fx.cache.acquire(&request("acme/widgets")).await.unwrap();
        let mut live = fx.worktrees.create(&lease, "HEAD").await.unwrap();

        let orphan = fx.worktrees.root().join("acme__widgets-dead-beef");
        fs::create_dir_all(orphan.join("pkg")).unwrap();
        fs::write(orphan.join("pkg/mod.py"), "x = 1\n").unwrap();
        fs::write(sidecar_of(&orphan), "prompt").unwrap();

        let report = fx
            .sweeper
            .sweep(&SweepTarget::OlderThan(Duration::ZERO), false)
            .await;

        assert_eq!(report.worktrees_removed, vec![orphan.clone()]);
        assert_eq!(report.skipped_live, vec![live.path().to_path_buf()]);
        assert!(report.bytes_reclaimed >= 6);
        assert!(!orphan.exists());
        assert!(!sidecar_of(&orphan).exists());
        assert!(live.path().join("README.md").exists());

        live.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn worktrees_held_by_another_process_survive() {
        let fx = fixture();
        let lease = fx.cache.acquire(&request("acme/widgets")).await.unwrap();
        let mut held = fx.worktrees.create(&lease, "HEAD").await.unwrap();

        // Fresh manager and cache: nothing about `held` is known in memory.
        let other_worktrees = Arc::new(WorktreeManager::new(fx.worktrees.root(), 1));
        let other_cache = Arc::new(RepositoryCache::new(
            fx.cache.root(),
            Arc::new(FakeProvisioner::default()),
        ));
        let other = Sweeper::new(other_worktrees, other_cache);

        let report = other
            .sweep(&SweepTarget::OlderThan(Duration::ZERO), true)
            .await;
        assert!(report.worktrees_removed.is_empty());
        assert!(report.cache_entries_removed.is_empty());
        assert!(report.skipped_live.contains(&held.path().to_path_buf()));
        assert!(held.path().join("README.md").exists());
        assert!(lease.environment().python.exists());

        let report = other
            .sweep(&SweepTarget::Paths(vec![held.path().to_path_buf()]), false)
            .await;
        assert!(report.worktrees_removed.is_empty());
        assert_eq!(report.skipped_live, vec![held.path().to_path_buf()]);
        assert!(held.path().exists());

        held.destroy().await.unwrap();
        drop(held);
        drop(lease);
        let report = other
            .sweep(&SweepTarget::OlderThan(Duration::ZERO), true)
            .await;
        assert_eq!(report.cache_entries_removed, vec!["acme/widgets".to_string()]);
    }

    #[tokio::test]
    async fn orphaned_lock_sidecar_is_swept() {
        let fx = fixture();
        let orphan = fx.worktrees.root().join(format!("acme__widgets-gone-0002{}", LOCK_SUFFIX));
        fs::create_dir_all(fx.worktrees.root()).unwrap();
        fs::write(&orphan, "").unwrap();
        let report = fx
            .sweeper
            .sweep(&SweepTarget::OlderThan(Duration::ZERO), false)
            .await;
        assert_eq!(report.worktrees_removed, vec![orphan.clone()]);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn young_worktrees_survive_age_sweep() {
        let fx = fixture();
        let recent = fx.worktrees.root().join("acme__widgets-new-0001");
        fs::create_dir_all(&recent).unwrap();
        let report = fx
            .sweeper
            .sweep(&SweepTarget::OlderThan(Duration::from_secs(3600)), false)
            .await;
        assert!(report.worktrees_removed.is_empty());
        assert!(report.cache_entries_removed.is_empty());
        assert!(recent.exists());
    }

    #[tokio::test]
    async fn explicit_paths_must_be_managed() {
        let fx = fixture();
        let inside = fx.worktrees.root().join("acme__widgets-x-1");
        fs::create_dir_all(&inside).unwrap();
        let outside = fx.dir.path().join("precious");
        fs::create_dir_all(&outside).unwrap();

        let report = fx
            .sweeper
            .sweep(
                &SweepTarget::Paths(vec![inside.clone(), outside.clone(), fx.dir.path().join("nope")]),
                false,
            )
            .await;

        assert_eq!(report.worktrees_removed, vec![inside.clone()]);
        assert_eq!(report.rejected.len(), 2);
        assert!(outside.exists());
        assert!(!inside.exists());
    }

    #[tokio::test]
    async fn cache_entries_need_opt_in_and_no_leases() {
        let fx = fixture();
        let identity: RepoIdentity = "acme/widgets".parse().unwrap();
        let lease = fx.cache.acquire(&request("acme/widgets")).await.unwrap();
        let entry_dir = fx.cache.entry_dir(&identity);

        let report = fx
            .sweeper
            .sweep(&SweepTarget::OlderThan(Duration::ZERO), false)
            .await;
        assert!(report.cache_entries_removed.is_empty());

        let report = fx
            .sweeper
            .sweep(&SweepTarget::OlderThan(Duration::ZERO), true)
            .await;
        assert!(report.cache_entries_removed.is_empty());
        assert_eq!(report.skipped_live, vec![entry_dir.clone()]);
        assert!(entry_dir.exists());

        drop(lease);
        let report = fx
            .sweeper
            .sweep(&SweepTarget::Paths(vec![entry_dir.clone()]), true)
            .await;
        assert_eq!(report.cache_entries_removed, vec!["acme/widgets".to_string()]);
        assert!(report.bytes_reclaimed > 0);
        assert!(!entry_dir.exists());
    }
}
