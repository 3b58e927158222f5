//! Execution scheduler
//!
//! Runs `(task, attempt)` units under a global concurrency cap. Every unit
//! gets its own deadline and a child of the run's stop token; a unit that
//! fails, times out or panics only ever produces a failed record for itself.
//!
//! With `stop_on_first_patch` the attempts of one task run one after another
//! and stop at the first usable patch. Without it, all attempts are queued
//! up front, attempt-major, and compete for the winner.

use crate::agent::AgentOutput;
use crate::config::Config;
use crate::error::AttemptError;
use crate::records::{AttemptRecord, AttemptResult, RecordStore, RunSummary};
use crate::task::TaskRecord;
use crate::winner::WinnerBoard;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
mod tests;

/// Everything a runner gets for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub task: Arc<TaskRecord>,
    pub attempt_index: u32,
    /// The attempt must be finished, cleanup included, by this instant.
    pub deadline: Instant,
    pub limit: Duration,
    pub cancel: CancellationToken,
}

/// What an attempt produced. A diff may accompany an error when cleanup
/// failed after the agent already succeeded.
#[derive(Debug, Default)]
pub struct AttemptReport {
    pub diff: String,
    pub agent: Option<AgentOutput>,
    pub error: Option<AttemptError>,
}

impl AttemptReport {
    pub fn failed(error: AttemptError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn finished(diff: String, agent: Option<AgentOutput>) -> Self {
        Self {
            diff,
            agent,
            error: None,
        }
    }
}

#[async_trait]
pub trait AttemptRunner: Send + Sync + 'static {
    /// Run one attempt to completion. Must honour `ctx.cancel` and
    /// `ctx.deadline` and release everything it created before returning.
    async fn run(&self, ctx: AttemptContext) -> AttemptReport;
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub concurrency: usize,
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub stop_on_first_patch: bool,
    /// Continue from the records already in the output directory: tasks with
    /// a winner are skipped and attempt numbering continues. Otherwise earlier
    /// records are ignored and overwritten.
    pub resume: bool,
    /// How long past its deadline a runner may take to clean up before the
    /// scheduler drops it.
    pub cleanup_grace: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            attempt_timeout: config.attempt_timeout(),
            max_attempts: config.max_attempts,
            stop_on_first_patch: config.stop_on_first_patch,
            resume: true,
            cleanup_grace: Duration::from_secs(30),
        }
    }
}

/// Number of attempts currently executing, with the high-water mark.
#[derive(Debug, Default)]
pub struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Unit {
    task: Arc<TaskRecord>,
    attempt_index: u32,
    /// Highest attempt index this run may schedule for the task.
    last_index: u32,
}

/// What earlier runs left in the output directory.
#[derive(Default)]
struct Prior {
    /// Highest attempt index per task, so new records never overwrite old ones.
    highest: HashMap<String, u32>,
    /// Tasks with a usable patch.
    completed: HashSet<String>,
}

struct Finished {
    unit: Unit,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    report: AttemptReport,
}

pub struct Scheduler {
    settings: SchedulerSettings,
    runner: Arc<dyn AttemptRunner>,
    winners: Arc<WinnerBoard>,
    records: Option<RecordStore>,
    in_flight: Arc<InFlight>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, runner: Arc<dyn AttemptRunner>) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            settings,
            runner,
            winners: Arc::new(WinnerBoard::new()),
            records: None,
            in_flight: Arc::new(InFlight::default()),
            permits,
        }
    }

    /// Persist every attempt record, and the run summary, under `store`.
    pub fn with_records(mut self, store: RecordStore) -> Self {
        self.records = Some(store);
        self
    }

    pub fn winners(&self) -> Arc<WinnerBoard> {
        self.winners.clone()
    }

    pub fn in_flight(&self) -> Arc<InFlight> {
        self.in_flight.clone()
    }

    /// Run every task until its attempts are exhausted or it has a patch.
    ///
    /// Returns once nothing is running. After `stop` fires no new attempt
    /// starts and running ones are cancelled and awaited.
    pub async fn run(&self, tasks: Vec<TaskRecord>, stop: CancellationToken) -> RunSummary {
        let mut summary = RunSummary {
            started_at: Some(Utc::now()),
            tasks_total: tasks.len(),
            ..RunSummary::default()
        };

        let prior = if self.settings.resume {
            self.seed_from_records()
        } else {
            Prior::default()
        };
        let mut scheduled: Vec<Arc<TaskRecord>> = Vec::with_capacity(tasks.len());
        for task in tasks {
            if prior.completed.contains(&task.task_id) {
                tracing::info!(task = %task.task_id, "already has a patch, skipping");
                summary.tasks_resumed += 1;
                continue;
            }
            scheduled.push(Arc::new(task));
        }
        let mut pending = self.initial_units(&scheduled, &prior.highest);
        tracing::info!(
            tasks = scheduled.len(),
            units = pending.len(),
            concurrency = self.settings.concurrency,
            "scheduling attempts"
        );

        let mut join_set: JoinSet<Finished> = JoinSet::new();
        let mut stopping = false;
        loop {
            if !stopping && stop.is_cancelled() {
                stopping = true;
                summary.units_not_started += pending.len();
                pending.clear();
                tracing::warn!(
                    running = join_set.len(),
                    "stop requested, waiting for running attempts to clean up"
                );
            }
            if !stopping {
                self.spawn_ready(&mut pending, &mut join_set, &stop, &mut summary);
            }
            if join_set.is_empty() {
                break;
            }
            tokio::select! {
                _ = stop.cancelled(), if !stopping => {}
                Some(joined) = join_set.join_next() => match joined {
                    Ok(finished) => self.conclude(finished, &mut pending, &mut summary, stopping),
                    Err(err) => tracing::error!(error = %err, "attempt task failed to join"),
                },
                else => break,
            }
        }

        let winners = self.winners.snapshot();
        for task in &scheduled {
            match winners.get(&task.task_id) {
                Some(index) => {
                    summary.winners.insert(task.task_id.clone(), *index);
                }
                None => summary.tasks_without_patch.push(task.task_id.clone()),
            }
        }
        summary.peak_in_flight = self.in_flight.peak();
        summary.cancelled = stop.is_cancelled();
        summary.finished_at = Some(Utc::now());

        if let Some(store) = &self.records {
            if let Err(err) = store.write_summary(&summary) {
                tracing::error!(error = %format!("{:#}", err), "failed to write run summary");
            }
        }
        summary
    }

    /// Load earlier records into the winner board.
    fn seed_from_records(&self) -> Prior {
        let mut prior = Prior::default();
        let Some(store) = &self.records else {
            return prior;
        };
        for (task_id, records) in store.load_all() {
            for record in &records {
                self.winners.consider(&task_id, record.candidate());
            }
            if records.iter().any(AttemptRecord::has_patch) {
                prior.completed.insert(task_id.clone());
            }
            if let Some(last) = records.last() {
                prior.highest.insert(task_id, last.attempt_index);
            }
        }
        prior
    }

    fn initial_units(&self, tasks: &[Arc<TaskRecord>], prior: &HashMap<String, u32>) -> VecDeque<Unit> {
        let max_attempts = self.settings.max_attempts.max(1);
        let first_index = |task_id: &str| prior.get(task_id).copied().unwrap_or(0) + 1;
        let mut units = VecDeque::new();
        if self.settings.stop_on_first_patch {
            for task in tasks {
                let first = first_index(&task.task_id);
                units.push_back(Unit {
                    task: task.clone(),
                    attempt_index: first,
                    last_index: first + max_attempts - 1,
                });
            }
        } else {
            for round in 0..max_attempts {
                for task in tasks {
                    let first = first_index(&task.task_id);
                    units.push_back(Unit {
                        task: task.clone(),
                        attempt_index: first + round,
                        last_index: first + max_attempts - 1,
                    });
                }
            }
        }
        units
    }

    fn spawn_ready(
        &self,
        pending: &mut VecDeque<Unit>,
        join_set: &mut JoinSet<Finished>,
        stop: &CancellationToken,
        summary: &mut RunSummary,
    ) {
        while let Some(next) = pending.front() {
            if self.settings.stop_on_first_patch && self.winners.has_winner(&next.task.task_id) {
                summary.attempts_skipped += 1;
                pending.pop_front();
                continue;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(unit) = pending.pop_front() else {
                break;
            };
            self.spawn_unit(unit, permit, join_set, stop);
        }
    }

    fn spawn_unit(
        &self,
        unit: Unit,
        permit: OwnedSemaphorePermit,
        join_set: &mut JoinSet<Finished>,
        stop: &CancellationToken,
    ) {
        let runner = self.runner.clone();
        let in_flight = self.in_flight.clone();
        let limit = self.settings.attempt_timeout;
        let grace = self.settings.cleanup_grace;
        let cancel = stop.child_token();
        tracing::debug!(
            task = %unit.task.task_id,
            attempt = unit.attempt_index,
            "starting attempt"
        );

        join_set.spawn(async move {
            let _permit = permit;
            let _running = in_flight.enter();
            let started_at = Utc::now();
            let deadline = Instant::now() + limit;
            let ctx = AttemptContext {
                task: unit.task.clone(),
                attempt_index: unit.attempt_index,
                deadline,
                limit,
                cancel,
            };

            let guarded = AssertUnwindSafe(runner.run(ctx)).catch_unwind();
            let report = match tokio::time::timeout_at(deadline + grace, guarded).await {
                Ok(Ok(report)) => report,
                Ok(Err(panic)) => AttemptReport::failed(AttemptError::process(format!(
                    "attempt panicked: {}",
                    panic_detail(panic.as_ref())
                ))),
                // The runner overran its deadline and grace; dropping it runs
                // its guards.
                Err(_) => AttemptReport::failed(AttemptError::AttemptTimeout {
                    limit_secs: limit.as_secs(),
                }),
            };
            Finished {
                unit,
                started_at,
                finished_at: Utc::now(),
                report,
            }
        });
    }

    fn conclude(
        &self,
        finished: Finished,
        pending: &mut VecDeque<Unit>,
        summary: &mut RunSummary,
        stopping: bool,
    ) {
        let Finished {
            unit,
            started_at,
            finished_at,
            report,
        } = finished;
        let task = &unit.task;
        summary.attempts_run += 1;

        let mut record = AttemptRecord::from_result(AttemptResult {
            task_id: &task.task_id,
            repository: task.repo.to_string(),
            attempt_index: unit.attempt_index,
            base_commit: &task.base_commit,
            diff: report.diff,
            agent: report.agent,
            error: report.error.as_ref(),
            started_at,
            finished_at,
        });

        match &report.error {
            None => {
                summary.attempts_succeeded += 1;
                tracing::info!(
                    task = %task.task_id,
                    attempt = unit.attempt_index,
                    files = record.files_modified.len(),
                    diff_len = record.diff_len,
                    secs = record.duration_seconds,
                    "attempt finished"
                );
            }
            Some(err) => {
                *summary
                    .failures_by_kind
                    .entry(err.kind().label().to_string())
                    .or_default() += 1;
                tracing::warn!(
                    task = %task.task_id,
                    attempt = unit.attempt_index,
                    kind = err.kind().label(),
                    error = %err,
                    "attempt failed"
                );
            }
        }

        let change = self
            .winners
            .consider_change(&task.task_id, record.candidate());
        record.is_winner = self.winners.is_winner(&task.task_id, unit.attempt_index);
        if let Some(change) = &change {
            tracing::info!(
                task = %task.task_id,
                attempt = change.winner.attempt_index,
                files = change.winner.files_modified,
                diff_len = change.winner.diff_len,
                previous = ?change.previous.map(|p| p.attempt_index),
                "new winner"
            );
        }

        if let Some(store) = &self.records {
            match store.write(&record) {
                Ok(_) => {
                    if let Some(change) = &change {
                        if let Err(err) = store.apply_winner_change(change) {
                            tracing::error!(
                                task = %task.task_id,
                                error = %format!("{:#}", err),
                                "failed to update winner flags"
                            );
                        }
                    }
                }
                Err(err) => tracing::error!(
                    task = %task.task_id,
                    attempt = unit.attempt_index,
                    error = %format!("{:#}", err),
                    "failed to write attempt record"
                ),
            }
        }

        if self.settings.stop_on_first_patch
            && !stopping
            && !self.winners.has_winner(&task.task_id)
            && unit.attempt_index < unit.last_index
        {
            pending.push_back(Unit {
                task: unit.task.clone(),
                attempt_index: unit.attempt_index + 1,
                last_index: unit.last_index,
            });
        }
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
