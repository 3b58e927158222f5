//! Per-attempt result records
//!
//! One JSON file per `(task_id, attempt_index)` under the output directory,
//! replaced atomically. Only the `is_winner` flag of an existing record is
//! ever rewritten.

use crate::agent::AgentOutput;
use crate::error::{AttemptError, ErrorKind, ErrorRecord};
use crate::patch::PatchStats;
use crate::util::{sanitize_component, write_atomic};
use crate::winner::{Candidate, WinnerChange};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

const SUMMARY_FILE: &str = "run-summary.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: String,
    pub repository: String,
    pub attempt_index: u32,
    pub base_commit: String,
    pub diff_text: String,
    pub files_modified: Vec<String>,
    pub diff_len: usize,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(default)]
    pub is_winner: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentOutput>,
}

/// Everything known about an attempt when it concludes.
#[derive(Debug)]
pub struct AttemptResult<'a> {
    pub task_id: &'a str,
    pub repository: String,
    pub attempt_index: u32,
    pub base_commit: &'a str,
    pub diff: String,
    pub agent: Option<AgentOutput>,
    pub error: Option<&'a AttemptError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn from_result(result: AttemptResult<'_>) -> Self {
        let stats = PatchStats::from_patch(&result.diff);
        let duration_seconds = (result.finished_at - result.started_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        Self {
            task_id: result.task_id.to_string(),
            repository: result.repository,
            attempt_index: result.attempt_index,
            base_commit: result.base_commit.to_string(),
            diff_text: result.diff,
            files_modified: stats.files,
            diff_len: stats.diff_len,
            duration_seconds,
            started_at: result.started_at,
            finished_at: result.finished_at,
            succeeded: result.error.is_none(),
            error: result.error.map(AttemptError::to_record),
            is_winner: false,
            agent: result.agent,
        }
    }

    pub fn candidate(&self) -> Candidate {
        Candidate {
            attempt_index: self.attempt_index,
            files_modified: self.files_modified.len(),
            diff_len: self.diff_len,
        }
    }

    /// Produced something worth keeping: a non-empty diff touching files.
    pub fn has_patch(&self) -> bool {
        !self.diff_text.trim().is_empty() && !self.files_modified.is_empty()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Aggregate of one `run` invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks_total: usize,
    pub tasks_resumed: usize,
    pub attempts_run: usize,
    pub attempts_succeeded: usize,
    pub failures_by_kind: BTreeMap<String, usize>,
    /// Winning attempt index per task that has one.
    pub winners: BTreeMap<String, u32>,
    pub tasks_without_patch: Vec<String>,
    /// Queued attempts dropped because their task already had a patch.
    pub attempts_skipped: usize,
    /// Queued attempts dropped by a stop request.
    pub units_not_started: usize,
    pub peak_in_flight: usize,
    pub cancelled: bool,
}

pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Task ids are validated to `[A-Za-z0-9._-]` on load, so this is the id
    /// itself; the sanitizing only guards hand-built records.
    fn file_stem(task_id: &str) -> String {
        sanitize_component(task_id)
    }

    pub fn record_path(&self, task_id: &str, attempt_index: u32) -> PathBuf {
        self.dir.join(format!(
            "{}-attempt{}.json",
            Self::file_stem(task_id),
            attempt_index
        ))
    }

    pub fn write(&self, record: &AttemptRecord) -> Result<PathBuf> {
        let path = self.record_path(&record.task_id, record.attempt_index);
        let content = serde_json::to_string_pretty(record)?;
        write_atomic(&path, &content)
            .with_context(|| format!("Failed to write attempt record '{}'", path.display()))?;
        Ok(path)
    }

    pub fn load(&self, task_id: &str, attempt_index: u32) -> Option<AttemptRecord> {
        let content = fs::read_to_string(self.record_path(task_id, attempt_index)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Flip `is_winner` on the records touched by `change`.
    pub fn apply_winner_change(&self, change: &WinnerChange) -> Result<()> {
        if let Some(previous) = change.previous {
            self.set_winner_flag(&change.task_id, previous.attempt_index, false)?;
        }
        self.set_winner_flag(&change.task_id, change.winner.attempt_index, true)
    }

    fn set_winner_flag(&self, task_id: &str, attempt_index: u32, is_winner: bool) -> Result<()> {
        let Some(mut record) = self.load(task_id, attempt_index) else {
            return Ok(());
        };
        if record.is_winner == is_winner {
            return Ok(());
        }
        record.is_winner = is_winner;
        self.write(&record)?;
        Ok(())
    }

    /// Every readable attempt record, grouped by task and ordered by attempt.
    pub fn load_all(&self) -> HashMap<String, Vec<AttemptRecord>> {
        let mut by_task: HashMap<String, Vec<AttemptRecord>> = HashMap::new();
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return by_task;
        };
        for entry in read_dir.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || !name.contains("-attempt") {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            match serde_json::from_str::<AttemptRecord>(&content) {
                Ok(record) => by_task.entry(record.task_id.clone()).or_default().push(record),
                Err(err) => {
                    tracing::warn!(file = %name, error = %err, "skipping unreadable attempt record")
                }
            }
        }
        for records in by_task.values_mut() {
            records.sort_by_key(|r| r.attempt_index);
        }
        by_task
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.dir.join(SUMMARY_FILE);
        write_atomic(&path, &serde_json::to_string_pretty(summary)?)
            .with_context(|| format!("Failed to write run summary '{}'", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::winner::WinnerBoard;
    use tempfile::tempdir;

    const PATCH: &str = "--- a/x.py\n+++ b/x.py\n@@ -1 +1 @@\n-a\n+b\n";

    fn record(task: &str, attempt: u32, diff: &str, error: Option<&AttemptError>) -> AttemptRecord {
        let started_at = Utc::now();
        AttemptRecord::from_result(AttemptResult {
            task_id: task,
            repository: "acme/widgets".to_string(),
            attempt_index: attempt,
            base_commit: "abc123",
            diff: diff.to_string(),
            agent: None,
            error,
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(1500),
        })
    }

    #[test]
    fn derives_metrics_from_diff() {
        let rec = record("t", 1, PATCH, None);
        assert_eq!(rec.files_modified, vec!["x.py"]);
        assert_eq!(rec.diff_len, PATCH.len());
        assert!((rec.duration_seconds - 1.5).abs() < f64::EPSILON);
        assert!(rec.succeeded);
        assert!(rec.has_patch());

        let err = AttemptError::AttemptTimeout { limit_secs: 3 };
        let failed = record("t", 2, "", Some(&err));
        assert!(!failed.succeeded);
        assert_eq!(failed.error_kind(), Some(ErrorKind::AttemptTimeout));
        assert!(!failed.has_patch());
    }

    #[test]
    fn writes_and_reloads_records() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.write(&record("psf__requests-1", 1, PATCH, None)).unwrap();
        store.write(&record("psf__requests-1", 2, "", None)).unwrap();
        store.write(&record("other", 1, "", None)).unwrap();

        assert!(dir.path().join("psf__requests-1-attempt2.json").exists());
        let all = store.load_all();
        assert_eq!(all["psf__requests-1"].len(), 2);
        assert_eq!(all["psf__requests-1"][1].attempt_index, 2);
        assert!(all["psf__requests-1"].iter().any(AttemptRecord::has_patch));
        assert!(!all["other"].iter().any(AttemptRecord::has_patch));
    }

    #[test]
    fn loadable_task_ids_get_distinct_files() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let ids = ["xy", "x.y", "x-y", "x_y"];
        let tasks = crate::task::parse_tasks(
            &ids.iter()
                .map(|id| format!("{{\"task_id\":\"{}\",\"repo\":\"o/n\",\"base_commit\":\"abcd\"}}\n", id))
                .collect::<String>(),
        )
        .unwrap();
        for task in &tasks {
            store.write(&record(&task.task_id, 1, PATCH, None)).unwrap();
            assert_eq!(
                store.record_path(&task.task_id, 1),
                dir.path().join(format!("{}-attempt1.json", task.task_id))
            );
        }
        assert_eq!(store.load_all().len(), ids.len());
        assert!(crate::task::parse_tasks("{\"task_id\":\"x/y\",\"repo\":\"o/n\",\"base_commit\":\"abcd\"}").is_err());
    }

    #[test]
    fn winner_changes_rewrite_flags() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let board = WinnerBoard::new();

        let first = record("t", 1, PATCH, None);
        store.write(&first).unwrap();
        let change = board.consider_change("t", first.candidate()).unwrap();
        store.apply_winner_change(&change).unwrap();
        assert!(store.load("t", 1).unwrap().is_winner);

        let bigger = format!("{}--- a/y.py\n+++ b/y.py\n@@ -1 +1 @@\n-c\n+d\n", PATCH);
        let second = record("t", 2, &bigger, None);
        store.write(&second).unwrap();
        let change = board.consider_change("t", second.candidate()).unwrap();
        store.apply_winner_change(&change).unwrap();

        assert!(!store.load("t", 1).unwrap().is_winner);
        assert!(store.load("t", 2).unwrap().is_winner);
    }

    #[test]
    fn summary_is_written_beside_records() {
        let dir = tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("out"));
        let summary = RunSummary {
            tasks_total: 3,
            cancelled: true,
            ..RunSummary::default()
        };
        let path = store.write_summary(&summary).unwrap();
        let loaded: RunSummary = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(loaded, summary);
    }
}
