//! Winner selection across attempts of one task.
//!
//! Ranking, highest precedence first:
//! 1. an empty diff is never eligible;
//! 2. more distinct files modified wins;
//! 3. a longer raw diff wins;
//! 4. otherwise the incumbent keeps the win.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// The ranking inputs of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub attempt_index: u32,
    pub files_modified: usize,
    pub diff_len: usize,
}

impl Candidate {
    pub fn eligible(&self) -> bool {
        self.diff_len > 0
    }

    fn outranks(&self, incumbent: &Candidate) -> bool {
        (self.files_modified, self.diff_len) > (incumbent.files_modified, incumbent.diff_len)
    }
}

/// A replacement of one task's winner, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinnerChange {
    pub task_id: String,
    pub winner: Candidate,
    pub previous: Option<Candidate>,
}

/// Current winner per task.
pub struct WinnerBoard {
    winners: Mutex<HashMap<String, Candidate>>,
    changes: broadcast::Sender<WinnerChange>,
}

impl Default for WinnerBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl WinnerBoard {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            winners: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Score `candidate` for `task_id`. Returns whether the winner changed.
    pub fn consider(&self, task_id: &str, candidate: Candidate) -> bool {
        self.consider_change(task_id, candidate).is_some()
    }

    /// Like [`consider`](Self::consider) but returns the change itself.
    pub fn consider_change(&self, task_id: &str, candidate: Candidate) -> Option<WinnerChange> {
        if !candidate.eligible() {
            return None;
        }
        let change = {
            let mut winners = self.lock();
            let incumbent = winners.get(task_id).copied();
            match incumbent {
                Some(current) if current.attempt_index == candidate.attempt_index => return None,
                Some(current) if !candidate.outranks(&current) => return None,
                _ => {}
            }
            winners.insert(task_id.to_string(), candidate);
            WinnerChange {
                task_id: task_id.to_string(),
                winner: candidate,
                previous: incumbent,
            }
        };
        // No subscribers is fine.
        let _ = self.changes.send(change.clone());
        Some(change)
    }

    pub fn winner(&self, task_id: &str) -> Option<Candidate> {
        self.lock().get(task_id).copied()
    }

    pub fn is_winner(&self, task_id: &str, attempt_index: u32) -> bool {
        self.winner(task_id)
            .map(|w| w.attempt_index == attempt_index)
            .unwrap_or(false)
    }

    pub fn has_winner(&self, task_id: &str) -> bool {
        self.lock().contains_key(task_id)
    }

    /// Snapshot of every task's winning attempt index.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.lock()
            .iter()
            .map(|(task, c)| (task.clone(), c.attempt_index))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WinnerChange> {
        self.changes.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Candidate>> {
        self.winners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
