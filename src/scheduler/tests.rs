use super::*;
use crate::error::ErrorKind;
use crate::records::RecordStore;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use tempfile::tempdir;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Act {
    /// Produce a diff touching this many files.
    Patch(usize),
    Empty,
    Fail,
    /// Wait for cancellation or the deadline, like a well-behaved agent.
    Hang,
    /// Ignore deadline and cancellation entirely.
    Stuck,
    Panic,
}

fn patch(files: usize) -> String {
    (0..files)
        .map(|i| format!("--- a/f{i}.py\n+++ b/f{i}.py\n@@ -1 +1 @@\n-a\n+b\n"))
        .collect()
}

struct ScriptedRunner {
    script: fn(&TaskRecord, u32) -> Act,
    delay: Duration,
    calls: Mutex<Vec<(String, u32)>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    stuck_cleaned: Arc<AtomicBool>,
}

impl ScriptedRunner {
    fn new(script: fn(&TaskRecord, u32) -> Act) -> Self {
        Self {
            script,
            delay: Duration::from_millis(20),
            calls: Mutex::new(Vec::new()),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            stuck_cleaned: Arc::new(AtomicBool::new(false)),
        }
    }

    fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AttemptRunner for ScriptedRunner {
    async fn run(&self, ctx: AttemptContext) -> AttemptReport {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.task.task_id.clone(), ctx.attempt_index));
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _leave = leave_on_drop(&self.current);

        let act = (self.script)(&ctx.task, ctx.attempt_index);
        tokio::time::sleep(self.delay).await;
        match act {
            Act::Patch(files) => AttemptReport::finished(patch(files), None),
            Act::Empty => AttemptReport::finished(String::new(), None),
            Act::Fail => AttemptReport::failed(AttemptError::process("exit code 1")),
            Act::Hang => tokio::select! {
                _ = ctx.cancel.cancelled() => AttemptReport::failed(AttemptError::cancelled("stop")),
                _ = tokio::time::sleep_until(ctx.deadline) => AttemptReport::failed(
                    AttemptError::AttemptTimeout { limit_secs: ctx.limit.as_secs() },
                ),
            },
            Act::Stuck => {
                let _cleanup = SetOnDrop(self.stuck_cleaned.clone());
                tokio::time::sleep(Duration::from_secs(3600)).await;
                AttemptReport::default()
            }
            Act::Panic => panic!("runner blew up"),
        }
    }
}

struct Leave<'a>(&'a AtomicUsize);

impl Drop for Leave<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn leave_on_drop(counter: &AtomicUsize) -> Leave<'_> {
    Leave(counter)
}

fn tasks(n: usize) -> Vec<TaskRecord> {
    (0..n)
        .map(|i| TaskRecord {
            task_id: format!("acme__widgets-{i}"),
            repo: "acme/widgets".parse().unwrap(),
            base_commit: "abc123".to_string(),
            environment_setup_commit: None,
            problem_statement: "fix it".to_string(),
            python_version: None,
        })
        .collect()
}

fn settings(concurrency: usize, max_attempts: u32) -> SchedulerSettings {
    SchedulerSettings {
        concurrency,
        attempt_timeout: Duration::from_secs(30),
        max_attempts,
        stop_on_first_patch: true,
        resume: true,
        cleanup_grace: Duration::from_millis(200),
    }
}

fn scheduler(settings: SchedulerSettings, runner: Arc<ScriptedRunner>) -> Scheduler {
    Scheduler::new(settings, runner)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_exceeds_concurrency_cap() {
    let runner = Arc::new(ScriptedRunner::new(|_, _| Act::Patch(1)));
    let sched = scheduler(settings(2, 1), runner.clone());
    let summary = sched.run(tasks(10), CancellationToken::new()).await;

    assert_eq!(summary.attempts_run, 10);
    assert_eq!(summary.winners.len(), 10);
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(summary.peak_in_flight, 2);
    assert_eq!(sched.in_flight().current(), 0);
}

#[tokio::test]
async fn failures_stay_with_their_attempt() {
    let runner = Arc::new(ScriptedRunner::new(|task, _| {
        match task.task_id.as_str() {
            "acme__widgets-1" => Act::Fail,
            "acme__widgets-2" => Act::Panic,
            _ => Act::Patch(2),
        }
    }));
    let sched = scheduler(settings(3, 1), runner);
    let summary = sched.run(tasks(4), CancellationToken::new()).await;

    assert_eq!(summary.attempts_run, 4);
    assert_eq!(summary.attempts_succeeded, 2);
    assert_eq!(summary.failures_by_kind.get("attempt_process_failure"), Some(&2));
    assert!(summary.winners.contains_key("acme__widgets-0"));
    assert!(summary.winners.contains_key("acme__widgets-3"));
    assert_eq!(
        summary.tasks_without_patch,
        vec!["acme__widgets-1".to_string(), "acme__widgets-2".to_string()]
    );
}

#[tokio::test]
async fn retries_until_first_patch() {
    let runner = Arc::new(ScriptedRunner::new(|_, attempt| {
        if attempt < 2 {
            Act::Empty
        } else {
            Act::Patch(1)
        }
    }));
    let sched = scheduler(settings(2, 3), runner.clone());
    let summary = sched.run(tasks(1), CancellationToken::new()).await;

    assert_eq!(
        runner.calls(),
        vec![
            ("acme__widgets-0".to_string(), 1),
            ("acme__widgets-0".to_string(), 2)
        ]
    );
    assert_eq!(summary.winners.get("acme__widgets-0"), Some(&2));
}

#[tokio::test]
async fn exhausted_attempts_leave_task_without_patch() {
    let runner = Arc::new(ScriptedRunner::new(|_, _| Act::Empty));
    let sched = scheduler(settings(1, 3), runner.clone());
    let summary = sched.run(tasks(1), CancellationToken::new()).await;

    assert_eq!(runner.calls().len(), 3);
    assert!(summary.winners.is_empty());
    assert_eq!(summary.tasks_without_patch, vec!["acme__widgets-0".to_string()]);
}

#[tokio::test]
async fn all_attempts_compete_without_early_stop() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(|_, attempt| match attempt {
        1 => Act::Patch(1),
        2 => Act::Patch(3),
        _ => Act::Patch(2),
    }));
    let mut s = settings(2, 3);
    s.stop_on_first_patch = false;
    let sched = scheduler(s, runner.clone()).with_records(RecordStore::new(dir.path()));
    let summary = sched.run(tasks(1), CancellationToken::new()).await;

    assert_eq!(runner.calls().len(), 3);
    assert_eq!(summary.winners.get("acme__widgets-0"), Some(&2));

    let store = RecordStore::new(dir.path());
    let all = store.load_all();
    let records = &all["acme__widgets-0"];
    let flagged: Vec<u32> = records
        .iter()
        .filter(|r| r.is_winner)
        .map(|r| r.attempt_index)
        .collect();
    assert_eq!(flagged, vec![2]);
    assert!(dir.path().join("run-summary.json").exists());
}

#[tokio::test]
async fn overrunning_attempt_is_dropped_and_cleaned() {
    let runner = Arc::new(ScriptedRunner::new(|_, _| Act::Stuck));
    let mut s = settings(1, 1);
    s.attempt_timeout = Duration::from_millis(100);
    s.cleanup_grace = Duration::from_millis(100);
    let sched = scheduler(s, runner.clone());

    let started = std::time::Instant::now();
    let summary = sched.run(tasks(1), CancellationToken::new()).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.failures_by_kind.get("attempt_timeout"), Some(&1));
    assert!(runner.stuck_cleaned.load(Ordering::SeqCst));
}

#[tokio::test]
async fn deadline_reported_as_timeout() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(|_, _| Act::Hang));
    let mut s = settings(2, 1);
    s.attempt_timeout = Duration::from_millis(150);
    let sched = scheduler(s, runner).with_records(RecordStore::new(dir.path()));
    sched.run(tasks(2), CancellationToken::new()).await;

    let all = RecordStore::new(dir.path()).load_all();
    for records in all.values() {
        assert_eq!(records[0].error_kind(), Some(ErrorKind::AttemptTimeout));
        assert!(!records[0].is_winner);
    }
    assert_eq!(all.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_cancels_running_and_drops_queued() {
    let dir = tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new(|_, _| Act::Hang));
    let sched = scheduler(settings(2, 1), runner.clone()).with_records(RecordStore::new(dir.path()));
    let stop = CancellationToken::new();

    let trigger = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });
    let started = std::time::Instant::now();
    let summary = sched.run(tasks(6), stop).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(summary.cancelled);
    assert_eq!(summary.attempts_run, 2);
    assert_eq!(summary.units_not_started, 4);
    assert_eq!(summary.failures_by_kind.get("scheduler_cancellation"), Some(&2));
    assert_eq!(runner.calls().len(), 2);
    assert_eq!(sched.in_flight().current(), 0);
}

#[tokio::test]
async fn resume_skips_tasks_with_patches() {
    let dir = tempdir().unwrap();
    let first = Arc::new(ScriptedRunner::new(|task, _| {
        if task.task_id == "acme__widgets-0" {
            Act::Patch(1)
        } else {
            Act::Fail
        }
    }));
    scheduler(settings(2, 1), first)
        .with_records(RecordStore::new(dir.path()))
        .run(tasks(2), CancellationToken::new())
        .await;

    let second = Arc::new(ScriptedRunner::new(|_, _| Act::Patch(1)));
    let summary = scheduler(settings(2, 1), second.clone())
        .with_records(RecordStore::new(dir.path()))
        .run(tasks(2), CancellationToken::new())
        .await;

    assert_eq!(summary.tasks_resumed, 1);
    // Numbering continues after the failed first attempt.
    assert_eq!(second.calls(), vec![("acme__widgets-1".to_string(), 2)]);
    assert!(dir.path().join("acme__widgets-1-attempt1.json").exists());
    assert!(dir.path().join("acme__widgets-1-attempt2.json").exists());
    assert_eq!(summary.winners.get("acme__widgets-1"), Some(&2));
}
