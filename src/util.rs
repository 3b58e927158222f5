use command_group::{AsyncCommandGroup, AsyncGroupChild};
use std::fs;
use std::io;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Upper bound on captured output per stream; older bytes are dropped.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;
/// How long to wait for pipe readers after the process group is gone.
const READER_GRACE: Duration = Duration::from_secs(2);
const BLOCKING_POLL: Duration = Duration::from_millis(25);

pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Last `max` characters of `s`, char-boundary safe.
pub fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}

/// Reduce `input` to a safe single path component (`[A-Za-z0-9._-]`, no leading dots).
pub fn sanitize_component(input: &str) -> String {
    let cleaned = input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect::<String>();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "item".to_string()
    } else {
        cleaned
    }
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

/// Run `command` to completion on the current thread, discarding output.
///
/// For `Drop` paths where no runtime is guaranteed. Returns `Ok(None)` when
/// the command was killed at `timeout`.
pub fn run_blocking_status(command: &mut Command, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        thread::sleep(BLOCKING_POLL);
    }
    let _ = child.kill();
    let _ = child.wait();
    Ok(None)
}

/// How an async command run ended.
#[derive(Debug)]
pub struct CommandOutcome {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.map(|s| s.success()).unwrap_or(false)
    }

    pub fn describe_exit(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        if self.cancelled {
            return "cancelled".to_string();
        }
        match self.status {
            Some(status) => match status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            },
            None => "unknown exit status".to_string(),
        }
    }
}

/// Kills the whole process group if the owning future is dropped mid-run.
struct GroupGuard {
    child: AsyncGroupChild,
    reaped: bool,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.start_kill();
        }
    }
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run `command` in its own process group until it exits, `deadline` passes or
/// `cancel` fires. On timeout or cancellation every process in the group is
/// killed and reaped before returning.
pub async fn run_command_until(
    mut command: tokio::process::Command,
    deadline: tokio::time::Instant,
    cancel: &CancellationToken,
) -> std::io::Result<CommandOutcome> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = tokio::time::Instant::now();
    let mut child = command.group_spawn()?;
    let mut stdout_task = tokio::spawn(drain_tail(child.inner().stdout.take()));
    let mut stderr_task = tokio::spawn(drain_tail(child.inner().stderr.take()));
    let mut guard = GroupGuard {
        child,
        reaped: false,
    };

    let exit = tokio::select! {
        status = guard.child.wait() => Exit::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Exit::TimedOut,
        _ = cancel.cancelled() => Exit::Cancelled,
    };

    let timed_out = matches!(exit, Exit::TimedOut);
    let cancelled = matches!(exit, Exit::Cancelled);
    let status = match exit {
        Exit::Exited(status) => {
            let status = status?;
            guard.reaped = true;
            // Stragglers the agent left behind in its group.
            let _ = guard.child.start_kill();
            Some(status)
        }
        Exit::TimedOut | Exit::Cancelled => {
            let _ = guard.child.start_kill();
            let status = guard.child.wait().await.ok();
            guard.reaped = true;
            status
        }
    };

    let stdout = join_reader(&mut stdout_task).await;
    let stderr = join_reader(&mut stderr_task).await;

    Ok(CommandOutcome {
        status,
        stdout,
        stderr,
        timed_out,
        cancelled,
        elapsed: started.elapsed(),
    })
}

async fn drain_tail<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > MAX_CAPTURE_BYTES {
                    let excess = kept.len() - MAX_CAPTURE_BYTES;
                    kept.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

async fn join_reader(handle: &mut tokio::task::JoinHandle<String>) -> String {
    match tokio::time::timeout(READER_GRACE, &mut *handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_truncate_unicode_safe() {
        assert_eq!(truncate("ééééé", 4), "é...");
        assert_eq!(truncate("こんにちは", 3), "こんに");
        assert_eq!(truncate("abc", 0), "");
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("hello world", 5), "world");
        assert_eq!(tail_chars("hi", 5), "hi");
        assert_eq!(tail_chars("ééé", 2), "éé");
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("psf/requests"), "psfrequests");
        assert_eq!(sanitize_component("a b-c_d"), "ab-c_d");
        assert_eq!(sanitize_component("../.."), "item");
        assert_eq!(sanitize_component(""), "item");
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");
        write_atomic(&path, "{\"a\":1}").unwrap();
        write_atomic(&path, "{\"a\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_blocking_runner_kills_at_timeout() {
        let mut slow = Command::new("sh");
        slow.args(["-c", "sleep 5"]);
        let started = Instant::now();
        assert!(run_blocking_status(&mut slow, Duration::from_millis(100))
            .unwrap()
            .is_none());
        assert!(started.elapsed() < Duration::from_secs(4));

        let mut quick = Command::new("sh");
        quick.args(["-c", "exit 3"]);
        let status = run_blocking_status(&mut quick, Duration::from_secs(5)).unwrap();
        assert_eq!(status.and_then(|s| s.code()), Some(3));
    }

    #[tokio::test]
    async fn test_async_runner_captures_output() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "echo out; echo err 1>&2"]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let outcome = run_command_until(cmd, deadline, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_async_runner_kills_on_deadline() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(150);
        let outcome = run_command_until(cmd, deadline, &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(outcome.elapsed < Duration::from_secs(10));
        assert_eq!(outcome.describe_exit(), "timed out");
    }

    #[tokio::test]
    async fn test_async_runner_honours_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "sleep 30"]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        let outcome = run_command_until(cmd, deadline, &cancel).await.unwrap();
        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_async_runner_reports_exit_code() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", "exit 3"]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let outcome = run_command_until(cmd, deadline, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.describe_exit(), "exit code 3");
    }
}
