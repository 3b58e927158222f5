//! Task records and repository identities.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// `(owner, name)` key of an upstream repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoIdentity {
    owner: String,
    name: String,
}

impl RepoIdentity {
    pub fn new(owner: &str, name: &str) -> Result<Self> {
        let owner = owner.trim();
        let name = name.trim().trim_end_matches(".git");
        if !is_valid_segment(owner) || !is_valid_segment(name) {
            bail!("invalid repository identity '{}/{}'", owner, name);
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cache directory name: `owner__name`.
    pub fn dir_name(&self) -> String {
        format!("{}__{}", self.owner, self.name)
    }

    pub fn clone_url(&self, base_url: &str) -> String {
        format!(
            "{}/{}/{}.git",
            base_url.trim_end_matches('/'),
            self.owner,
            self.name
        )
    }
}

/// Segments may not contain `__` or start or end with `_`, so `owner__name`
/// splits back into exactly one identity.
fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains("__")
        && !segment.starts_with('_')
        && !segment.ends_with('_')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl fmt::Display for RepoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl FromStr for RepoIdentity {
    type Err = anyhow::Error;

    /// Accepts `owner/name`, `owner__name`, or an http(s) URL such as
    /// `https://github.com/owner/name.git`.
    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.contains("://") {
            let parsed = url::Url::parse(raw)
                .with_context(|| format!("invalid repository URL '{}'", raw))?;
            let segments: Vec<&str> = parsed
                .path_segments()
                .map(|s| s.filter(|seg| !seg.is_empty()).collect())
                .unwrap_or_default();
            return match segments.as_slice() {
                [owner, name] => Self::new(owner, name),
                _ => Err(anyhow!("repository URL '{}' is not <host>/<owner>/<name>", raw)),
            };
        }
        if let Some((owner, name)) = raw.split_once('/') {
            return Self::new(owner, name);
        }
        if let Some((owner, name)) = raw.split_once("__") {
            return Self::new(owner, name);
        }
        Err(anyhow!("cannot parse repository identity '{}'", raw))
    }
}

impl TryFrom<String> for RepoIdentity {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RepoIdentity> for String {
    fn from(value: RepoIdentity) -> Self {
        value.to_string()
    }
}

/// One unit of work from the task source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(alias = "instance_id")]
    pub task_id: String,
    pub repo: RepoIdentity,
    pub base_commit: String,
    /// Commit the shared environment is built from; falls back to `base_commit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_setup_commit: Option<String>,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
}

impl TaskRecord {
    pub fn setup_commit(&self) -> &str {
        self.environment_setup_commit
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.base_commit)
    }

    fn validate(&self) -> Result<()> {
        if self.task_id.trim().is_empty() {
            bail!("task_id is empty");
        }
        // Used verbatim in record file names.
        if !is_valid_task_id(&self.task_id) {
            bail!(
                "task_id '{}' may only contain ASCII letters, digits, '-', '_' and '.', and may not start or end with '.'",
                self.task_id
            );
        }
        if !is_commit_like(&self.base_commit) {
            bail!("base_commit '{}' is not a commit id", self.base_commit);
        }
        if let Some(setup) = &self.environment_setup_commit {
            if !setup.trim().is_empty() && !is_commit_like(setup) {
                bail!("environment_setup_commit '{}' is not a commit id", setup);
            }
        }
        Ok(())
    }
}

fn is_valid_task_id(value: &str) -> bool {
    !value.starts_with('.')
        && !value.ends_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_commit_like(value: &str) -> bool {
    (4..=64).contains(&value.len()) && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a JSONL task file. Blank lines are skipped; errors name the line.
pub fn parse_tasks(content: &str) -> Result<Vec<TaskRecord>> {
    let mut tasks = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let task: TaskRecord = serde_json::from_str(line)
            .with_context(|| format!("task line {} is not a valid task record", idx + 1))?;
        task.validate()
            .with_context(|| format!("task line {} is invalid", idx + 1))?;
        if !seen.insert(task.task_id.clone()) {
            bail!("task line {}: duplicate task_id '{}'", idx + 1, task.task_id);
        }
        tasks.push(task);
    }
    Ok(tasks)
}

pub fn load_tasks(path: &Path) -> Result<Vec<TaskRecord>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tasks from '{}'", path.display()))?;
    parse_tasks(&content).with_context(|| format!("in '{}'", path.display()))
}
