//! External agent invocation
//!
//! The agent is an opaque subprocess: it gets a working directory and a
//! prompt file, and whatever it leaves behind in the working copy is the
//! attempt's result.

use crate::config::AgentSettings;
use crate::error::AttemptError;
use crate::git;
use crate::util::{run_command_until, tail_chars, truncate};
use crate::worktree::{WorktreeHandle, ENV_LINK};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OUTPUT_TAIL_MAX_CHARS: usize = 8_000;

/// A fully resolved agent command line for one attempt.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, OsString)>,
    pub env_remove: Vec<String>,
}

impl AgentCommand {
    /// Substitute placeholders and activate the worktree's linked environment.
    pub fn for_worktree(
        settings: &AgentSettings,
        worktree: &Path,
        prompt_file: &Path,
        task_id: &str,
    ) -> Self {
        let workdir = worktree.to_string_lossy();
        let prompt = prompt_file.to_string_lossy();
        let args = settings
            .args
            .iter()
            .map(|arg| {
                arg.replace("{workdir}", &workdir)
                    .replace("{prompt_file}", &prompt)
                    .replace("{task_id}", task_id)
            })
            .collect();

        let venv = worktree.join(ENV_LINK);
        let mut path_entries = vec![venv.join("bin")];
        if let Some(existing) = std::env::var_os("PATH") {
            path_entries.extend(std::env::split_paths(&existing));
        }
        let path = std::env::join_paths(path_entries).unwrap_or_default();

        // Imports resolve to the worktree, not to the cache clone an editable
        // install points at.
        let mut python_path = vec![worktree.to_path_buf()];
        if worktree.join("src").is_dir() {
            python_path.push(worktree.join("src"));
        }
        let python_path = std::env::join_paths(python_path).unwrap_or_default();

        let mut env: Vec<(String, OsString)> = vec![
            ("VIRTUAL_ENV".to_string(), venv.into_os_string()),
            ("PATH".to_string(), path),
            ("PYTHONPATH".to_string(), python_path),
            ("PATCHBAY_TASK_ID".to_string(), task_id.into()),
            ("PATCHBAY_WORKDIR".to_string(), worktree.as_os_str().to_owned()),
        ];
        env.extend(
            git::env_overrides()
                .iter()
                .map(|(k, v)| (k.to_string(), OsString::from(v))),
        );
        env.extend(
            settings
                .env
                .iter()
                .map(|(k, v)| (k.clone(), OsString::from(v))),
        );

        Self {
            program: settings.program.clone(),
            args,
            cwd: worktree.to_path_buf(),
            env,
            env_remove: vec!["PYTHONHOME".to_string()],
        }
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
            .trim()
            .to_string()
    }

    fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.cwd);
        for key in &self.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Diagnostics captured from a finished agent run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

/// Write the task description beside the worktree so the agent cannot
/// accidentally commit it.
pub async fn write_prompt(worktree: &WorktreeHandle, problem_statement: &str) -> Result<PathBuf, AttemptError> {
    let path = worktree.prompt_path();
    tokio::fs::write(&path, problem_statement)
        .await
        .map_err(|err| AttemptError::WorktreeIoFailure {
            tries: 1,
            detail: format!("Failed to write prompt '{}': {}", path.display(), err),
        })?;
    Ok(path)
}

/// Run the agent until it exits, `deadline` passes or `cancel` fires.
///
/// A clean exit yields the captured output; everything else maps onto the
/// attempt error taxonomy. The whole process group is gone when this returns.
pub async fn run_agent(
    command: &AgentCommand,
    deadline: tokio::time::Instant,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<AgentOutput, AttemptError> {
    let label = command.label();
    tracing::debug!(command = %label, cwd = %command.cwd.display(), "starting agent");
    let outcome = run_command_until(command.to_tokio(), deadline, cancel)
        .await
        .map_err(|err| AttemptError::process(format!("failed to start `{}`: {}", label, err)))?;

    if outcome.cancelled {
        return Err(AttemptError::cancelled("stop requested while agent was running"));
    }
    if outcome.timed_out {
        return Err(AttemptError::AttemptTimeout {
            limit_secs: limit.as_secs(),
        });
    }

    let output = AgentOutput {
        command: label,
        exit_code: outcome.status.and_then(|s| s.code()),
        duration_ms: outcome.elapsed.as_millis() as u64,
        stdout_tail: tail_chars(&outcome.stdout, OUTPUT_TAIL_MAX_CHARS),
        stderr_tail: tail_chars(&outcome.stderr, OUTPUT_TAIL_MAX_CHARS),
    };
    if !outcome.success() {
        return Err(AttemptError::process(format!(
            "{} ({}): {}",
            output.command,
            outcome.describe_exit(),
            truncate(output.stderr_tail.trim(), 500)
        )));
    }
    Ok(output)
}
