//! Unified diff inspection
//!
//! Derives the metrics the winner ranking relies on from a raw git patch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Metrics derived from one patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchStats {
    /// Distinct repository-relative paths touched, sorted.
    pub files: Vec<String>,
    /// Length of the raw patch text in characters.
    pub diff_len: usize,
    pub additions: usize,
    pub deletions: usize,
}

impl PatchStats {
    pub fn from_patch(patch: &str) -> Self {
        let mut additions = 0;
        let mut deletions = 0;
        for line in patch.lines() {
            if line.starts_with("+++ ") || line.starts_with("--- ") {
                continue;
            }
            if line.starts_with('+') {
                additions += 1;
            } else if line.starts_with('-') {
                deletions += 1;
            }
        }
        Self {
            files: files_in_patch(patch),
            diff_len: patch.chars().count(),
            additions,
            deletions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.diff_len == 0
    }
}

/// Paths named in `--- a/` and `+++ b/` headers, deduplicated and sorted.
/// `/dev/null` sides of additions and deletions are skipped.
pub fn files_in_patch(patch: &str) -> Vec<String> {
    let mut files = BTreeSet::new();
    for line in patch.lines() {
        let path = line
            .strip_prefix("--- a/")
            .or_else(|| line.strip_prefix("+++ b/"));
        if let Some(path) = path {
            // git appends a tab before timestamps in some diff modes
            let path = path.split('\t').next().unwrap_or(path).trim_end();
            if !path.is_empty() {
                files.insert(path.to_string());
            }
        }
    }
    files.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "\
diff --git a/src/lib.py b/src/lib.py
index 1111111..2222222 100644
--- a/src/lib.py
+++ b/src/lib.py
@@ -1,2 +1,2 @@
-old = 1
+new = 2
 keep
diff --git a/docs/new.md b/docs/new.md
new file mode 100644
--- /dev/null
+++ b/docs/new.md
@@ -0,0 +1 @@
+hello
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
";

    #[test]
    fn collects_distinct_files() {
        assert_eq!(
            files_in_patch(PATCH),
            vec!["docs/new.md", "gone.txt", "src/lib.py"]
        );
    }

    #[test]
    fn stats_count_lines_and_length() {
        let stats = PatchStats::from_patch(PATCH);
        assert_eq!(stats.files.len(), 3);
        assert_eq!(stats.additions, 2);
        assert_eq!(stats.deletions, 2);
        assert_eq!(stats.diff_len, PATCH.chars().count());
        assert!(!stats.is_empty());
    }

    #[test]
    fn empty_patch_has_no_files() {
        let stats = PatchStats::from_patch("");
        assert!(stats.is_empty());
        assert!(stats.files.is_empty());
    }
}
