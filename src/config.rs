//! Configuration for patchbay
//!
//! Read from `patchbay.toml` (or the path given with `--config`). Every field
//! has a default so an empty file, or no file at all, is a valid config.

use crate::task::RepoIdentity;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "patchbay.toml";

/// Placeholders substituted into agent arguments.
pub const AGENT_PLACEHOLDERS: [&str; 3] = ["{workdir}", "{prompt_file}", "{task_id}"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// One subdirectory per repository identity lives here.
    pub cache_root: PathBuf,
    /// Ephemeral per-attempt worktrees.
    pub worktree_root: PathBuf,
    /// Attempt records and the run summary.
    pub output_dir: PathBuf,
    pub concurrency: usize,
    pub attempt_timeout_secs: u64,
    pub max_attempts: u32,
    /// Stop scheduling further attempts for a task once one produced a patch.
    pub stop_on_first_patch: bool,
    pub worktree_io_retries: usize,
    pub install_timeout_secs: u64,
    pub clone_timeout_secs: u64,
    /// Clone URLs are `<upstream_base_url>/<owner>/<name>.git`.
    pub upstream_base_url: String,
    pub agent: AgentSettings,
    pub python: PythonSettings,
}

impl Default for Config {
    fn default() -> Self {
        let cache_root = default_cache_root();
        Self {
            worktree_root: cache_root.join("worktrees"),
            cache_root: cache_root.join("repos"),
            output_dir: PathBuf::from("predictions"),
            concurrency: 4,
            attempt_timeout_secs: 30 * 60,
            max_attempts: 3,
            stop_on_first_patch: true,
            worktree_io_retries: 3,
            install_timeout_secs: 30 * 60,
            clone_timeout_secs: 10 * 60,
            upstream_base_url: "https://github.com".to_string(),
            agent: AgentSettings::default(),
            python: PythonSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            program: "ra-aid".to_string(),
            args: vec![
                "--cowboy-mode".to_string(),
                "--message-file".to_string(),
                "{prompt_file}".to_string(),
            ],
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PythonSettings {
    pub default_version: String,
    /// Per-repository interpreter version, keyed by `owner/name`.
    pub versions: BTreeMap<String, String>,
    /// Versions older than this go straight to the pyenv strategy.
    pub uv_min_version: String,
    /// Extra environment for pyenv source builds of old interpreters.
    pub legacy_build_env: BTreeMap<String, String>,
}

impl Default for PythonSettings {
    fn default() -> Self {
        let mut legacy_build_env = BTreeMap::new();
        legacy_build_env.insert(
            "PYTHON_CONFIGURE_OPTS".to_string(),
            "--with-openssl-rpath=auto --enable-shared".to_string(),
        );
        legacy_build_env.insert("CFLAGS".to_string(), "-O2 -pipe -fPIC".to_string());
        Self {
            default_version: "3.11".to_string(),
            versions: BTreeMap::new(),
            uv_min_version: "3.8".to_string(),
            legacy_build_env,
        }
    }
}

impl PythonSettings {
    /// Task hint first, then the per-repository map, then the default.
    pub fn resolve_version(&self, repo: &RepoIdentity, hint: Option<&str>) -> String {
        hint.map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .or_else(|| self.versions.get(&repo.to_string()).cloned())
            .unwrap_or_else(|| self.default_version.clone())
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("patchbay")
}

impl Config {
    /// Load and validate `path`. A missing file yields the defaults only when
    /// `required` is false.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let config = match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content)
                .with_context(|| format!("Invalid config file '{}'", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => {
                Self::default()
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read config '{}'", path.display()))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.attempt_timeout_secs == 0 {
            bail!("attempt_timeout_secs must be at least 1");
        }
        if self.agent.program.trim().is_empty() {
            bail!("agent.program must not be empty");
        }
        for arg in &self.agent.args {
            if let Some(placeholder) = unknown_placeholders(arg).first() {
                bail!("agent.args contains unknown placeholder '{}'", placeholder);
            }
        }
        for repo in self.python.versions.keys() {
            repo.parse::<RepoIdentity>()
                .with_context(|| format!("python.versions key '{}'", repo))?;
        }
        if self.cache_root == self.worktree_root {
            bail!("cache_root and worktree_root must differ");
        }
        Ok(())
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }
}

fn unknown_placeholders(arg: &str) -> Vec<String> {
    let mut unknown = Vec::new();
    let mut rest = arg;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let token = &rest[start..start + len + 1];
        if !AGENT_PLACEHOLDERS.contains(&token) {
            unknown.push(token.to_string());
        }
        rest = &rest[start + len + 1..];
    }
    unknown
}
