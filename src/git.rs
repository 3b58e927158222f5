//! Git plumbing shared by the cache and the worktree manager.
//!
//! Mutating operations shell out to the `git` CLI (clone, fetch, worktree);
//! read-only queries go through `git2`.

use crate::util::{run_blocking_status, truncate};
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

pub const GIT_WORKTREE_TIMEOUT: Duration = Duration::from_secs(60);
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(120);
const DIFF_TIMEOUT: Duration = Duration::from_secs(120);

/// Environment applied to every git invocation so nothing ever prompts.
pub fn env_overrides() -> [(&'static str, &'static str); 3] {
    [
        ("GIT_TERMINAL_PROMPT", "0"),
        ("GIT_ASKPASS", "/bin/true"),
        ("GIT_LFS_SKIP_SMUDGE", "1"),
    ]
}

#[derive(Debug)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run git to completion and keep its whole output. Agent runs go through the
/// tail-bounded runner instead; git output is data (diffs) and must stay intact.
async fn run_git_raw(dir: &Path, args: &[&str], timeout: Duration) -> Result<Output> {
    let mut cmd = Command::new("git");
    cmd.current_dir(dir)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    for (k, v) in env_overrides() {
        cmd.env(k, v);
    }
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(output) => output.with_context(|| format!("Failed to start git {}", args.join(" "))),
        Err(_) => Err(anyhow!(
            "git command timed out after {}s: git {}",
            timeout.as_secs(),
            args.join(" ")
        )),
    }
}

pub async fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<GitOutput> {
    let output = run_git_raw(dir, args, timeout).await?;
    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Like [`run_git`] but a non-zero exit is an error carrying stderr.
pub async fn run_git_checked(dir: &Path, args: &[&str], timeout: Duration) -> Result<String> {
    let output = run_git(dir, args, timeout).await?;
    if output.success {
        return Ok(output.stdout);
    }
    Err(anyhow!(
        "git {} failed in {}: {}",
        args.join(" "),
        dir.display(),
        truncate(output.stderr.trim(), 400)
    ))
}

/// Clone `url` into `dest` without checking out a working tree.
pub async fn clone_repo(url: &str, dest: &Path, timeout: Duration) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("clone destination '{}' has no parent", dest.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create clone parent '{}'", parent.display()))?;
    let dest_str = dest.to_string_lossy().to_string();

    // Older git builds reject some flags; fall through to a plain clone.
    let variants: [Vec<&str>; 2] = [
        vec!["clone", "--quiet", "--no-checkout", url, &dest_str],
        vec!["clone", url, &dest_str],
    ];
    for (idx, args) in variants.iter().enumerate() {
        let output = run_git(parent, args, timeout).await?;
        if output.success {
            return Ok(());
        }
        let stderr_lower = output.stderr.to_ascii_lowercase();
        let unsupported = stderr_lower.contains("unknown option")
            || stderr_lower.contains("unrecognized option")
            || stderr_lower.contains("invalid option");
        if unsupported && idx + 1 < variants.len() {
            let _ = tokio::fs::remove_dir_all(dest).await;
            continue;
        }
        return Err(anyhow!(
            "git clone failed for {}: {}",
            url,
            truncate(output.stderr.trim(), 400)
        ));
    }
    Err(anyhow!("git clone failed for {}", url))
}

/// Make sure `commit` is present locally, fetching it from origin if needed.
pub async fn ensure_commit(repo: &Path, commit: &str) -> Result<()> {
    if commit_exists(repo, commit) {
        return Ok(());
    }
    run_git_checked(repo, &["fetch", "--quiet", "origin", commit], FETCH_TIMEOUT)
        .await
        .with_context(|| format!("commit {} is not reachable from origin", commit))?;
    if !commit_exists(repo, commit) {
        return Err(anyhow!("commit {} missing after fetch", commit));
    }
    Ok(())
}

pub async fn checkout_detached(repo: &Path, commit: &str) -> Result<()> {
    ensure_commit(repo, commit).await?;
    run_git_checked(
        repo,
        &["checkout", "--quiet", "--force", "--detach", commit],
        CHECKOUT_TIMEOUT,
    )
    .await?;
    Ok(())
}

pub async fn reset_clean(repo: &Path) -> Result<()> {
    run_git_checked(repo, &["reset", "--quiet", "--hard"], CHECKOUT_TIMEOUT).await?;
    run_git_checked(repo, &["clean", "-fdq"], CHECKOUT_TIMEOUT).await?;
    Ok(())
}

pub fn commit_exists(repo: &Path, rev: &str) -> bool {
    git2::Repository::open(repo)
        .and_then(|r| r.revparse_single(&format!("{}^{{commit}}", rev)).map(|_| ()))
        .is_ok()
}

pub fn rev_parse_head(repo: &Path) -> Result<String> {
    let repository = git2::Repository::open(repo)
        .with_context(|| format!("Failed to open repository '{}'", repo.display()))?;
    let head = repository
        .head()
        .and_then(|h| h.peel_to_commit())
        .with_context(|| format!("Failed to resolve HEAD in '{}'", repo.display()))?;
    Ok(head.id().to_string())
}

pub fn is_repository(path: &Path) -> bool {
    git2::Repository::open(path).is_ok()
}

pub async fn worktree_add(repo: &Path, path: &Path, commit: &str) -> Result<()> {
    run_git_checked(
        repo,
        &[
            "worktree",
            "add",
            "--detach",
            "--force",
            &path.to_string_lossy(),
            commit,
        ],
        GIT_WORKTREE_TIMEOUT,
    )
    .await
    .with_context(|| {
        format!(
            "Failed to create detached worktree '{}' from '{}'",
            path.display(),
            repo.display()
        )
    })?;
    Ok(())
}

pub async fn worktree_remove(repo: &Path, path: &Path) -> Result<()> {
    run_git_checked(
        repo,
        &["worktree", "remove", "--force", &path.to_string_lossy()],
        GIT_WORKTREE_TIMEOUT,
    )
    .await
    .with_context(|| format!("Failed to remove worktree '{}'", path.display()))?;
    Ok(())
}

pub async fn worktree_prune(repo: &Path) -> Result<()> {
    run_git_checked(repo, &["worktree", "prune"], GIT_WORKTREE_TIMEOUT).await?;
    Ok(())
}

/// Blocking removal for `Drop` paths; returns whether git reported success.
pub fn worktree_remove_blocking(repo: &Path, path: &Path) -> bool {
    let mut cmd = std::process::Command::new("git");
    cmd.current_dir(repo)
        .args(["worktree", "remove", "--force"])
        .arg(path);
    for (k, v) in env_overrides() {
        cmd.env(k, v);
    }
    matches!(
        run_blocking_status(&mut cmd, GIT_WORKTREE_TIMEOUT),
        Ok(Some(status)) if status.success()
    )
}

pub fn worktree_prune_blocking(repo: &Path) {
    let mut cmd = std::process::Command::new("git");
    cmd.current_dir(repo).args(["worktree", "prune"]);
    let _ = run_blocking_status(&mut cmd, GIT_WORKTREE_TIMEOUT);
}

/// Stage everything except `exclude` paths and return the diff against `base`.
pub async fn stage_and_diff(worktree: &Path, base: &str, exclude: &[&str]) -> Result<String> {
    let excludes: Vec<String> = exclude
        .iter()
        .map(|path| format!(":(exclude){}", path))
        .collect();
    let mut add_args = vec!["add", "-A", "--", "."];
    add_args.extend(excludes.iter().map(String::as_str));
    run_git_checked(worktree, &add_args, DIFF_TIMEOUT)
        .await
        .context("Failed to stage agent changes")?;

    let mut diff_args = vec!["diff", "--cached", "--no-color", "--no-ext-diff", base, "--", "."];
    diff_args.extend(excludes.iter().map(String::as_str));
    let output = run_git_raw(worktree, &diff_args, DIFF_TIMEOUT)
        .await
        .context("Failed to diff against base commit")?;
    if !output.status.success() {
        return Err(anyhow!(
            "git diff against {} failed: {}",
            base,
            truncate(String::from_utf8_lossy(&output.stderr).trim(), 400)
        ));
    }
    // Records hold the patch as text; a lossy conversion would corrupt it.
    String::from_utf8(output.stdout)
        .map_err(|err| anyhow!("diff is not valid UTF-8 (first bad byte at offset {})", err.utf8_error().valid_up_to()))
}
