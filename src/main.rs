use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use patchbay::attempt::WorktreeAttemptRunner;
use patchbay::cache::{GitProvisioner, RepositoryCache};
use patchbay::config::{Config, DEFAULT_CONFIG_FILE};
use patchbay::install::EnvironmentInstaller;
use patchbay::records::{RecordStore, RunSummary};
use patchbay::scheduler::{Scheduler, SchedulerSettings};
use patchbay::sweeper::{SweepTarget, Sweeper};
use patchbay::task::{load_tasks, RepoIdentity};
use patchbay::worktree::WorktreeManager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(
    name = "patchbay",
    about = "Run a coding agent against many repository tasks in parallel worktrees",
    version
)]
struct Cli {
    /// Config file (defaults to ./patchbay.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run attempts for every task in a JSONL file
    Run(RunArgs),
    /// Remove leftover worktrees and, optionally, cache entries
    Sweep(SweepArgs),
    /// Clear cached setup failures so the next run retries them
    Reset(ResetArgs),
    /// Show cache entries and worktrees on disk
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSONL task file
    #[arg(long)]
    tasks: PathBuf,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Per-attempt timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Keep running attempts after one produced a patch
    #[arg(long)]
    all_attempts: bool,
    /// Ignore records from earlier runs
    #[arg(long)]
    fresh: bool,
    /// Only run these task ids
    #[arg(long = "only")]
    only: Vec<String>,
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Remove entries older than this (e.g. 90s, 30m, 6h, 2d)
    #[arg(long, value_parser = parse_age, conflicts_with = "paths")]
    max_age: Option<Duration>,
    /// Also evict whole cache entries
    #[arg(long)]
    cache: bool,
    /// Explicit worktree or cache entry directories
    paths: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct ResetArgs {
    /// Repositories as owner/name
    #[arg(required = true)]
    repos: Vec<String>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("patchbay={},warn", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path, true)?,
        None => Config::load(&PathBuf::from(DEFAULT_CONFIG_FILE), false)?,
    };

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Sweep(args) => sweep(config, args).await,
        Commands::Reset(args) => reset(config, args),
        Commands::Status(args) => status(config, args),
    }
}

fn build_cache(config: &Config) -> Arc<RepositoryCache> {
    let provisioner = GitProvisioner::new(
        config.upstream_base_url.clone(),
        config.clone_timeout(),
        config.install_timeout(),
        EnvironmentInstaller::standard(&config.python),
    );
    Arc::new(RepositoryCache::new(
        config.cache_root.clone(),
        Arc::new(provisioner),
    ))
}

async fn run(mut config: Config, args: RunArgs) -> Result<()> {
    if let Some(output) = args.output {
        config.output_dir = output;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(timeout) = args.timeout {
        config.attempt_timeout_secs = timeout;
    }
    if args.all_attempts {
        config.stop_on_first_patch = false;
    }
    config.validate()?;

    let mut tasks = load_tasks(&args.tasks)?;
    if !args.only.is_empty() {
        tasks.retain(|t| args.only.contains(&t.task_id));
        if tasks.is_empty() {
            bail!("none of the requested task ids are in {}", args.tasks.display());
        }
    }

    let cache = build_cache(&config);
    let worktrees = Arc::new(WorktreeManager::new(
        config.worktree_root.clone(),
        config.worktree_io_retries,
    ));
    let runner = WorktreeAttemptRunner::new(
        cache,
        worktrees,
        config.agent.clone(),
        config.python.clone(),
    );
    let mut settings = SchedulerSettings::from_config(&config);
    settings.resume = !args.fresh;
    let scheduler = Scheduler::new(settings, Arc::new(runner))
        .with_records(RecordStore::new(config.output_dir.clone()));

    let stop = CancellationToken::new();
    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling running attempts");
            on_signal.cancel();
        }
    });

    let summary = scheduler.run(tasks, stop).await;
    print_summary(&summary, &config);
    if summary.cancelled {
        bail!("run cancelled");
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, config: &Config) {
    println!();
    println!(
        "Tasks: {} ({} already done)  Attempts: {} ({} clean)  Peak concurrency: {}",
        summary.tasks_total,
        summary.tasks_resumed,
        summary.attempts_run,
        summary.attempts_succeeded,
        summary.peak_in_flight
    );
    for (kind, count) in &summary.failures_by_kind {
        println!("  {:<26} {}", kind, count);
    }
    println!(
        "Patched: {}  Without patch: {}",
        summary.winners.len(),
        summary.tasks_without_patch.len()
    );
    if summary.units_not_started > 0 {
        println!("Not started: {}", summary.units_not_started);
    }
    println!("Records: {}", config.output_dir.display());
}

async fn sweep(config: Config, args: SweepArgs) -> Result<()> {
    let target = match (args.max_age, args.paths.is_empty()) {
        (Some(age), true) => SweepTarget::OlderThan(age),
        (None, false) => SweepTarget::Paths(args.paths),
        _ => bail!("pass either --max-age or explicit paths"),
    };
    let cache = build_cache(&config);
    let worktrees = Arc::new(WorktreeManager::new(
        config.worktree_root.clone(),
        config.worktree_io_retries,
    ));
    let report = Sweeper::new(worktrees, cache).sweep(&target, args.cache).await;

    println!(
        "Removed {} worktree(s) and {} cache entr{}, reclaimed {}",
        report.worktrees_removed.len(),
        report.cache_entries_removed.len(),
        if report.cache_entries_removed.len() == 1 { "y" } else { "ies" },
        human_bytes(report.bytes_reclaimed)
    );
    for path in &report.skipped_live {
        println!("  in use, skipped: {}", path.display());
    }
    for (path, reason) in &report.rejected {
        println!("  not removed: {} ({})", path.display(), reason);
    }
    Ok(())
}

fn reset(config: Config, args: ResetArgs) -> Result<()> {
    let cache = build_cache(&config);
    for raw in &args.repos {
        let identity: RepoIdentity = raw.parse()?;
        if cache.reset(&identity)? {
            println!("{}: failure cleared", identity);
        } else {
            println!("{}: nothing to reset", identity);
        }
    }
    Ok(())
}

fn status(config: Config, args: StatusArgs) -> Result<()> {
    let cache = build_cache(&config);
    let repos = cache.list_on_disk();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&repos)?);
        return Ok(());
    }
    if repos.is_empty() {
        println!("No cached repositories under {}", config.cache_root.display());
    }
    for repo in &repos {
        let state = serde_json::to_value(repo.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "{:<40} {:<14} {}",
            repo.identity.to_string(),
            state,
            repo.strategy.as_deref().unwrap_or("-")
        );
        if let Some(failure) = &repo.failure {
            println!("    {}", failure);
        }
    }
    let worktrees = std::fs::read_dir(&config.worktree_root)
        .map(|rd| rd.filter_map(|e| e.ok()).filter(|e| e.path().is_dir()).count())
        .unwrap_or(0);
    println!("Worktrees on disk: {}", worktrees);
    Ok(())
}

fn parse_age(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid age '{}'", raw))?;
    let secs = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => return Err(anyhow!("unknown age unit '{}' (use s, m, h or d)", other)),
    };
    Ok(Duration::from_secs(secs))
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ages() {
        assert_eq!(parse_age("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_age("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_age("2d").unwrap(), Duration::from_secs(172_800));
        assert!(parse_age("3w").is_err());
        assert!(parse_age("h").is_err());
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from(["patchbay", "-v", "run", "--tasks", "t.jsonl", "-j", "8", "--only", "a", "--only", "b"]);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.concurrency, Some(8));
                assert_eq!(args.only, vec!["a", "b"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(cli.verbose);
        assert!(Cli::try_parse_from(["patchbay", "sweep", "--max-age", "1h", "/tmp/x"]).is_err());
    }
}
