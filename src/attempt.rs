//! One attempt, end to end: lease the cached repository, check out a fresh
//! worktree, run the agent in it, capture the diff, and remove the worktree
//! whatever happened.

use crate::agent::{self, AgentCommand, AgentOutput};
use crate::cache::{RepositoryCache, SetupRequest};
use crate::config::{AgentSettings, PythonSettings};
use crate::error::{AttemptError, SetupFailure, SetupStage};
use crate::install::InterpreterVersion;
use crate::scheduler::{AttemptContext, AttemptReport, AttemptRunner};
use crate::task::TaskRecord;
use crate::worktree::{WorktreeHandle, WorktreeManager};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

pub struct WorktreeAttemptRunner {
    cache: Arc<RepositoryCache>,
    worktrees: Arc<WorktreeManager>,
    agent: AgentSettings,
    python: PythonSettings,
}

impl WorktreeAttemptRunner {
    pub fn new(
        cache: Arc<RepositoryCache>,
        worktrees: Arc<WorktreeManager>,
        agent: AgentSettings,
        python: PythonSettings,
    ) -> Self {
        Self {
            cache,
            worktrees,
            agent,
            python,
        }
    }

    fn setup_request(&self, task: &TaskRecord) -> Result<SetupRequest, AttemptError> {
        let version = self
            .python
            .resolve_version(&task.repo, task.python_version.as_deref());
        let interpreter: InterpreterVersion = version
            .parse()
            .map_err(|err| SetupFailure::new(&task.repo, SetupStage::Install, err))?;
        Ok(SetupRequest {
            identity: task.repo.clone(),
            setup_commit: task.setup_commit().to_string(),
            interpreter,
        })
    }

    /// Everything between worktree creation and removal.
    async fn drive(
        &self,
        worktree: &WorktreeHandle,
        ctx: &AttemptContext,
    ) -> Result<(String, AgentOutput), AttemptError> {
        let prompt = agent::write_prompt(worktree, &ctx.task.problem_statement).await?;
        let command =
            AgentCommand::for_worktree(&self.agent, worktree.path(), &prompt, &ctx.task.task_id);
        let output = agent::run_agent(&command, ctx.deadline, ctx.limit, &ctx.cancel).await?;

        let diff = bounded(ctx, async {
            worktree
                .capture_diff()
                .await
                .map_err(|err| AttemptError::process(format!("could not capture diff: {:#}", err)))
        })
        .await?;
        Ok((diff, output))
    }
}

#[async_trait]
impl AttemptRunner for WorktreeAttemptRunner {
    async fn run(&self, ctx: AttemptContext) -> AttemptReport {
        let task = ctx.task.clone();
        let request = match self.setup_request(&task) {
            Ok(request) => request,
            Err(err) => return AttemptReport::failed(err),
        };
        let lease = match bounded(&ctx, async {
            self.cache.acquire(&request).await.map_err(AttemptError::from)
        })
        .await
        {
            Ok(lease) => lease,
            Err(err) => return AttemptReport::failed(err),
        };

        let mut worktree =
            match bounded(&ctx, self.worktrees.create(&lease, &task.base_commit)).await {
                Ok(worktree) => worktree,
                Err(err) => return AttemptReport::failed(err),
            };
        tracing::debug!(
            task = %task.task_id,
            attempt = ctx.attempt_index,
            worktree = %worktree.path().display(),
            "running agent"
        );

        let outcome = self.drive(&worktree, &ctx).await;
        let cleanup = worktree.destroy().await;
        match (outcome, cleanup) {
            (Ok((diff, output)), Ok(())) => AttemptReport::finished(diff, Some(output)),
            // The patch is still worth recording.
            (Ok((diff, output)), Err(err)) => AttemptReport {
                diff,
                agent: Some(output),
                error: Some(err),
            },
            (Err(err), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    tracing::warn!(
                        task = %task.task_id,
                        attempt = ctx.attempt_index,
                        error = %cleanup_err,
                        "worktree cleanup also failed"
                    );
                }
                AttemptReport::failed(err)
            }
        }
    }
}

/// Race `fut` against the attempt's stop signal and deadline.
async fn bounded<T>(
    ctx: &AttemptContext,
    fut: impl Future<Output = Result<T, AttemptError>>,
) -> Result<T, AttemptError> {
    tokio::select! {
        result = fut => result,
        _ = ctx.cancel.cancelled() => Err(AttemptError::cancelled("stop requested")),
        _ = tokio::time::sleep_until(ctx.deadline) => Err(AttemptError::AttemptTimeout {
            limit_secs: ctx.limit.as_secs(),
        }),
    }
}
