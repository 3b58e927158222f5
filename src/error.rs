//! Error taxonomy for the orchestrator.
//!
//! Failures are scoped: a [`SetupFailure`] belongs to one repository identity
//! and is cached until reset, every other variant belongs to one attempt.
//! Nothing here aborts a whole run.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which part of first-time setup failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    Lock,
    Clone,
    Checkout,
    Install,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SetupStage::Lock => "lock",
            SetupStage::Clone => "clone",
            SetupStage::Checkout => "checkout",
            SetupStage::Install => "install",
        };
        f.write_str(label)
    }
}

/// Clone or dependency installation failed for a repository.
///
/// Cached on the cache slot and handed to every waiter, hence `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("setup failed for {repo} ({stage}): {detail}")]
pub struct SetupFailure {
    pub repo: String,
    pub stage: SetupStage,
    pub detail: String,
}

impl SetupFailure {
    pub fn new(repo: impl fmt::Display, stage: SetupStage, err: impl fmt::Display) -> Self {
        Self {
            repo: repo.to_string(),
            stage,
            detail: err.to_string(),
        }
    }

    /// Build from an `anyhow` chain, keeping every context layer.
    pub fn from_chain(repo: impl fmt::Display, stage: SetupStage, err: &anyhow::Error) -> Self {
        Self::new(repo, stage, format!("{:#}", err))
    }
}

/// Why a single attempt did not produce a usable result.
#[derive(Debug, Clone, Error)]
pub enum AttemptError {
    #[error(transparent)]
    SetupFailure(#[from] SetupFailure),

    #[error("attempt exceeded its {limit_secs}s deadline")]
    AttemptTimeout { limit_secs: u64 },

    #[error("agent process failed: {detail}")]
    AttemptProcessFailure { detail: String },

    #[error("worktree I/O failed after {tries} tries: {detail}")]
    WorktreeIoFailure { tries: usize, detail: String },

    #[error("attempt cancelled: {reason}")]
    SchedulerCancellation { reason: String },
}

impl AttemptError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AttemptError::SetupFailure(_) => ErrorKind::SetupFailure,
            AttemptError::AttemptTimeout { .. } => ErrorKind::AttemptTimeout,
            AttemptError::AttemptProcessFailure { .. } => ErrorKind::AttemptProcessFailure,
            AttemptError::WorktreeIoFailure { .. } => ErrorKind::WorktreeIoFailure,
            AttemptError::SchedulerCancellation { .. } => ErrorKind::SchedulerCancellation,
        }
    }

    pub fn process(detail: impl Into<String>) -> Self {
        AttemptError::AttemptProcessFailure {
            detail: detail.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        AttemptError::SchedulerCancellation {
            reason: reason.into(),
        }
    }

    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            detail: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SetupFailure,
    AttemptTimeout,
    AttemptProcessFailure,
    WorktreeIoFailure,
    SchedulerCancellation,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::SetupFailure => "setup_failure",
            ErrorKind::AttemptTimeout => "attempt_timeout",
            ErrorKind::AttemptProcessFailure => "attempt_process_failure",
            ErrorKind::WorktreeIoFailure => "worktree_io_failure",
            ErrorKind::SchedulerCancellation => "scheduler_cancellation",
        }
    }
}

/// Serialized form of an attempt error as it appears in attempt records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub detail: String,
}
