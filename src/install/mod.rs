//! Dependency environment installation
//!
//! An [`EnvironmentInstaller`] owns an ordered list of [`InstallStrategy`]
//! implementations. Each one is tried in turn; a failure is logged and the
//! next strategy runs against a freshly cleared environment directory. When
//! every strategy has failed or declined, the caller gets one
//! [`InstallError::Exhausted`] listing all of them.
//!
//! A successful install drops a marker file into the environment directory.
//! Later calls find the marker and return the recorded handle without doing
//! any work.

mod legacy;
mod lockfile;
mod requirements;

pub use legacy::{pick_release, PyenvStrategy};
pub use lockfile::UvLockStrategy;
pub use requirements::RequirementsStrategy;

use crate::config::PythonSettings;
use crate::util::{run_command_until, truncate, write_atomic};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const ENV_MARKER_FILE: &str = ".patchbay-env.json";
const REQUIREMENT_FILES: [&str; 2] = ["requirements.txt", "requirements-dev.txt"];

/// A `major.minor[.patch]` interpreter version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterpreterVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl InterpreterVersion {
    /// Compare on `major.minor` only.
    pub fn cmp_minor(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }

    pub fn short(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }
}

impl FromStr for InterpreterVersion {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        let trimmed = raw.trim().trim_start_matches("python").trim_start_matches('v');
        let parts: Vec<&str> = trimmed.split('.').collect();
        let num = |s: &str| {
            s.parse::<u32>()
                .map_err(|_| anyhow!("invalid interpreter version '{}'", raw))
        };
        match parts.as_slice() {
            [major, minor] => Ok(Self {
                major: num(major)?,
                minor: num(minor)?,
                patch: None,
            }),
            [major, minor, patch] => Ok(Self {
                major: num(major)?,
                minor: num(minor)?,
                patch: Some(num(patch)?),
            }),
            _ => Err(anyhow!("invalid interpreter version '{}'", raw)),
        }
    }
}

impl fmt::Display for InterpreterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.patch {
            Some(patch) => write!(f, "{}.{}.{}", self.major, self.minor, patch),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

/// Dependency declarations found at the root of a checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyFiles {
    pub lock_file: Option<PathBuf>,
    pub pyproject: bool,
    pub setup_py: bool,
    /// Requirement files relative to the checkout root, in install order.
    pub requirements: Vec<String>,
}

impl DependencyFiles {
    pub fn detect(root: &Path) -> Self {
        let lock = root.join("uv.lock");
        Self {
            lock_file: lock.is_file().then_some(lock),
            pyproject: root.join("pyproject.toml").is_file(),
            setup_py: root.join("setup.py").is_file(),
            requirements: REQUIREMENT_FILES
                .iter()
                .filter(|name| root.join(name).is_file())
                .map(|name| name.to_string())
                .collect(),
        }
    }

    pub fn is_package(&self) -> bool {
        self.pyproject || self.setup_py
    }

    /// `pip install` argument lists for the plain recipe.
    pub fn recipe_steps(&self) -> Vec<Vec<String>> {
        let mut steps = vec![
            vec!["--upgrade".to_string(), "pip".to_string()],
            vec![
                "--upgrade".to_string(),
                "setuptools".to_string(),
                "wheel".to_string(),
            ],
        ];
        if self.pyproject {
            steps.push(vec![".".to_string()]);
        }
        for file in &self.requirements {
            steps.push(vec!["-r".to_string(), file.clone()]);
        }
        if self.is_package() {
            steps.push(vec!["-e".to_string(), ".".to_string()]);
        }
        steps
    }
}

/// Everything a strategy needs to build one environment.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// Checkout the dependencies are read from.
    pub source: PathBuf,
    /// Where the environment is materialised.
    pub env_dir: PathBuf,
    pub files: DependencyFiles,
    pub interpreter: InterpreterVersion,
    pub timeout: Duration,
}

impl InstallRequest {
    pub fn python_path(&self) -> PathBuf {
        venv_python(&self.env_dir)
    }
}

pub fn venv_python(env_dir: &Path) -> PathBuf {
    env_dir.join("bin").join("python")
}

/// Result of a successful install, persisted beside the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub root: PathBuf,
    pub python: PathBuf,
    pub interpreter: String,
    pub strategy: String,
    pub installed_at: DateTime<Utc>,
}

impl EnvironmentHandle {
    pub fn new(req: &InstallRequest, strategy: &str, interpreter: impl fmt::Display) -> Self {
        Self {
            root: req.env_dir.clone(),
            python: req.python_path(),
            interpreter: interpreter.to_string(),
            strategy: strategy.to_string(),
            installed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait InstallStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err(reason)` when this strategy cannot serve the request at all.
    fn applies(&self, req: &InstallRequest) -> Result<(), String>;

    async fn install(&self, req: &InstallRequest) -> anyhow::Result<EnvironmentHandle>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: String,
    pub skipped: bool,
    pub detail: String,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.skipped { "skipped" } else { "failed" };
        write!(f, "{} {}: {}", self.strategy, verb, self.detail)
    }
}

fn render_failures(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("no install strategy succeeded ({})", render_failures(.failures))]
    Exhausted { failures: Vec<StrategyFailure> },

    #[error("failed to prepare environment directory: {0}")]
    Io(String),
}

pub struct EnvironmentInstaller {
    strategies: Vec<Box<dyn InstallStrategy>>,
}

impl EnvironmentInstaller {
    pub fn new(strategies: Vec<Box<dyn InstallStrategy>>) -> Self {
        Self { strategies }
    }

    /// Lock-file install, then the plain recipe, then pyenv.
    pub fn standard(settings: &PythonSettings) -> Self {
        let uv_min = settings
            .uv_min_version
            .parse::<InterpreterVersion>()
            .unwrap_or(InterpreterVersion {
                major: 3,
                minor: 8,
                patch: None,
            });
        Self::new(vec![
            Box::new(UvLockStrategy::new(uv_min)),
            Box::new(RequirementsStrategy::new(uv_min)),
            Box::new(PyenvStrategy::new(settings.legacy_build_env.clone())),
        ])
    }

    /// Handle recorded by an earlier successful install, if still usable.
    pub fn existing(env_dir: &Path) -> Option<EnvironmentHandle> {
        let content = std::fs::read_to_string(env_dir.join(ENV_MARKER_FILE)).ok()?;
        let handle: EnvironmentHandle = serde_json::from_str(&content).ok()?;
        handle.python.exists().then_some(handle)
    }

    pub async fn install(&self, req: &InstallRequest) -> Result<EnvironmentHandle, InstallError> {
        if let Some(handle) = Self::existing(&req.env_dir) {
            tracing::debug!(
                env = %req.env_dir.display(),
                strategy = %handle.strategy,
                "environment already installed"
            );
            return Ok(handle);
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            let name = strategy.name();
            if let Err(reason) = strategy.applies(req) {
                tracing::debug!(strategy = name, %reason, "install strategy not applicable");
                failures.push(StrategyFailure {
                    strategy: name.to_string(),
                    skipped: true,
                    detail: reason,
                });
                continue;
            }

            clear_dir(&req.env_dir).await?;
            tracing::info!(
                strategy = name,
                python = %req.interpreter,
                source = %req.source.display(),
                "installing environment"
            );
            match strategy.install(req).await {
                Ok(handle) => {
                    let marker = serde_json::to_string_pretty(&handle)
                        .map_err(|e| InstallError::Io(e.to_string()))?;
                    write_atomic(&req.env_dir.join(ENV_MARKER_FILE), &marker)
                        .map_err(|e| InstallError::Io(format!("{:#}", e)))?;
                    return Ok(handle);
                }
                Err(err) => {
                    let detail = truncate(&format!("{:#}", err), 600);
                    tracing::warn!(strategy = name, error = %detail, "install strategy failed");
                    failures.push(StrategyFailure {
                        strategy: name.to_string(),
                        skipped: false,
                        detail,
                    });
                }
            }
        }

        let _ = tokio::fs::remove_dir_all(&req.env_dir).await;
        Err(InstallError::Exhausted { failures })
    }
}

async fn clear_dir(dir: &Path) -> Result<(), InstallError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(InstallError::Io(format!("{}: {}", dir.display(), err))),
    }
    if let Some(parent) = dir.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| InstallError::Io(format!("{}: {}", parent.display(), e)))?;
    }
    Ok(())
}

/// One external installer command sharing the request's overall deadline.
pub(crate) struct Step<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
}

pub(crate) async fn run_step(step: Step<'_>, deadline: tokio::time::Instant) -> anyhow::Result<String> {
    let mut cmd = Command::new(step.program);
    cmd.args(&step.args)
        .current_dir(step.cwd)
        .env("PIP_DISABLE_PIP_VERSION_CHECK", "1")
        .env_remove("VIRTUAL_ENV")
        .env_remove("PYTHONHOME");
    for (k, v) in step.env {
        cmd.env(k, v);
    }
    let rendered = format!("{} {}", step.program, step.args.join(" "));
    tracing::debug!(command = %rendered, "install step");
    let outcome = run_command_until(cmd, deadline, &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to start `{}`", rendered))?;
    if outcome.timed_out {
        return Err(anyhow!("`{}` exceeded the install deadline", rendered));
    }
    if !outcome.success() {
        return Err(anyhow!(
            "`{}` failed ({}): {}",
            rendered,
            outcome.describe_exit(),
            truncate(outcome.stderr.trim(), 400)
        ));
    }
    Ok(outcome.stdout)
}
