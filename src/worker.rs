//! Per-unit lifecycle: worktree setup, task loop, review polling, merge,
//! and cleanup. `crate::worker_pool::WorkerPool` spawns one [`Worker::run`]
//! per ready unit; `crate::orchestrator::Orchestrator` owns the pieces a
//! worker borrows but never owns outright (the serialized merge lock, the
//! run-level pending-branch-delete list, the `EventBus`/`Scheduler`/
//! `HistoryStore`).
//!
//! Grounded on the sequential phase structure of the teacher's own test
//! runner (`cip999-limmat/src/test.rs`'s `Job::run`), generalized from
//! "run one test command" to "drive one unit through provider, review and
//! merge".

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use log::warn;
use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryConfig};
use crate::escalation::Escalation;
use crate::events::{Event, EventBus};
use crate::git::{CleanOptions, CommitOptions, GitOps, PushOptions, RebaseOutcome};
use crate::pr_client::{derive_review_status, PrClient, ReviewStatus};
use crate::provider::{CollectSink, ProviderRunner};
use crate::scheduler::Scheduler;
use crate::unit::{Task, TaskStatus, Unit};
use crate::util::has_marker;

/// Outcome of running a unit to completion, reported back to
/// `crate::worker_pool` so it can feed `Scheduler::mark_finished`/
/// `mark_failed`.
#[derive(Debug)]
pub enum WorkerOutcome {
    Finished,
    Failed(anyhow::Error),
}

/// Bootstrap commands run once per worktree, keyed by the marker file whose
/// presence at the worktree root selects them. First match wins, per
/// spec_full.md §4.5's "Setup" step.
const BOOTSTRAP_COMMANDS: &[(&str, &[&str])] = &[
    ("package.json", &["npm", "install"]),
    ("go.mod", &["go", "mod", "download"]),
    ("Cargo.toml", &["cargo", "fetch"]),
];

/// Shared, cloneable handles every worker in a run needs. Constructed once
/// by `crate::orchestrator::Orchestrator` and cloned per unit.
#[derive(Clone)]
pub struct WorkerContext {
    pub run_id: String,
    pub repo_path: PathBuf,
    pub worktree_base: PathBuf,
    pub target_branch: String,
    pub branch_prefix: String,
    pub config: Arc<Config>,
    pub scheduler: Arc<Scheduler>,
    pub events: Arc<EventBus>,
    pub pr_client: Arc<PrClient>,
    pub provider: Arc<ProviderRunner>,
    /// Acquired for the whole duration of phase 4 (Merge); serializes
    /// merges across every worker in the run.
    pub merge_lock: Arc<tokio::sync::Mutex<()>>,
    /// Branches from completed/failed units, deleted only once the whole
    /// run finishes (`crate::orchestrator` drains this at the end).
    pub pending_branch_deletes: Arc<SyncMutex<Vec<String>>>,
    pub cancel: CancellationToken,
    /// Set by `--skip-review`: go straight from the task loop to merge.
    pub skip_review: bool,
    /// Set by `--no-pr`: never open a pull request for this unit. The
    /// branch is still pushed so there is something to merge manually.
    pub no_pr: bool,
    /// Set by `-n`/`--dry-run`: never touch the remote at all. Tasks still
    /// run and commit locally; nothing is pushed, no PR opens, no merge
    /// happens.
    pub dry_run: bool,
}

impl WorkerContext {
    fn publish(&self, event_type: &str, unit: &str, payload: serde_json::Value) {
        self.events
            .publish(Event::new(&self.run_id, event_type, payload).with_unit(unit));
    }
}

/// Drives one [`Unit`] through setup, its task loop, review, merge, and
/// cleanup. Holds the unit's own `GitOps`/worktree for its entire
/// lifetime; nothing else touches that worktree concurrently.
pub struct Worker {
    ctx: WorkerContext,
    unit: Unit,
    branch: String,
    pr_number: Option<u64>,
}

impl Worker {
    pub fn new(ctx: WorkerContext, unit: Unit) -> Self {
        let suffix = short_suffix(&unit.id);
        let branch = format!("{}{}-{}", ctx.branch_prefix, unit.id, suffix);
        Self {
            ctx,
            unit,
            branch,
            pr_number: None,
        }
    }

    pub async fn run(mut self) -> WorkerOutcome {
        let unit_id = self.unit.id.clone();
        match self.run_inner().await {
            Ok(()) => {
                self.ctx.publish("unit.completed", &unit_id, json!({"branch": self.branch}));
                WorkerOutcome::Finished
            }
            Err(e) => {
                self.ctx
                    .publish("unit.failed", &unit_id, json!({"branch": self.branch, "error": e.to_string()}));
                WorkerOutcome::Failed(e)
            }
        }
    }

    async fn run_inner(&mut self) -> anyhow::Result<()> {
        let git = self.setup().await?;
        let result = self.task_loop(&git).await;
        if result.is_ok() {
            if !self.ctx.skip_review {
                if let Err(e) = self.review(&git).await {
                    self.cleanup(&git).await;
                    return Err(e);
                }
            }
            if let Err(e) = self.merge(&git).await {
                self.cleanup(&git).await;
                return Err(e);
            }
        }
        self.cleanup(&git).await;
        result
    }

    /// Phase 1: worktree creation, branch checkout, bootstrap commands.
    async fn setup(&mut self) -> anyhow::Result<GitOps> {
        tokio::fs::create_dir_all(&self.ctx.worktree_base)
            .await
            .context("creating worktree base directory")?;

        self.ctx
            .publish("unit.setup.started", &self.unit.id, json!({"branch": self.branch}));

        let worktree_path = self.ctx.worktree_base.join(format!("{}-{}", self.unit.id, short_suffix(&self.branch)));
        // Must outlive `setup` through to phase 5's explicit removal, so
        // this is created as a bare path, not an owned, drop-cleaned type.
        //
        // The branch name is a deterministic hash of the unit id (see
        // `short_suffix`), not a fresh one per run, so a resumed run finds
        // the same branch a stopped run left behind and checks it out
        // instead of branching fresh off the target branch.
        let resuming = tokio::process::Command::new("git")
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("refs/heads/{}", self.branch))
            .current_dir(&self.ctx.repo_path)
            .status()
            .await
            .context("checking for a pre-existing branch")?
            .success();

        let mut worktree_add = tokio::process::Command::new("git");
        worktree_add.arg("worktree").arg("add");
        if resuming {
            worktree_add.arg(&worktree_path).arg(&self.branch);
        } else {
            worktree_add.arg("-b").arg(&self.branch).arg(&worktree_path).arg(&self.ctx.target_branch);
        }
        let status = worktree_add
            .current_dir(&self.ctx.repo_path)
            .status()
            .await
            .context("spawning 'git worktree add'")?;
        if !status.success() {
            return Err(anyhow!("'git worktree add' failed with {status:?} for unit {}", self.unit.id));
        }

        let git = GitOps::new_worktree(
            &worktree_path,
            self.ctx.worktree_base.clone(),
            Arc::new(crate::git::NullAuditLogger),
        )
        .await
        .context("opening worktree GitOps")?;

        if resuming {
            self.reconcile_completed_tasks(&git).await?;
        }

        for (marker, command) in BOOTSTRAP_COMMANDS {
            if has_marker(&worktree_path, marker) {
                self.ctx.publish(
                    "unit.bootstrap.running",
                    &self.unit.id,
                    json!({"marker": marker, "command": command}),
                );
                let status = tokio::process::Command::new(command[0])
                    .args(&command[1..])
                    .current_dir(&worktree_path)
                    .status()
                    .await
                    .with_context(|| format!("running bootstrap command {command:?}"))?;
                if !status.success() {
                    warn!("bootstrap command {command:?} exited with {status:?} for unit {}", self.unit.id);
                }
                break;
            }
        }

        self.unit.worktree_path = Some(worktree_path);
        self.unit.branch = Some(self.branch.clone());
        self.ctx
            .publish("unit.setup.completed", &self.unit.id, json!({"branch": self.branch}));
        Ok(git)
    }

    /// Marks every task this unit's branch already has a "mark task N
    /// complete" commit for, so a resumed run picks up where a stopped one
    /// left off instead of redoing finished work and emitting a duplicate
    /// `task.completed`.
    async fn reconcile_completed_tasks(&mut self, git: &GitOps) -> anyhow::Result<()> {
        let range = format!("{}..{}", self.ctx.target_branch, self.branch);
        let log = git.log(&range, "%s").await.context("reading branch history to resume")?;
        let done = completed_task_indices(&log, &self.unit.id);
        if done.is_empty() {
            return Ok(());
        }
        for task in &mut self.unit.tasks {
            if done.contains(&task.index) {
                task.status = TaskStatus::Complete;
            }
        }
        self.ctx.publish(
            "unit.resumed",
            &self.unit.id,
            json!({"branch": self.branch, "completed_tasks": done.len()}),
        );
        Ok(())
    }

    /// Phase 2: run every incomplete task in order, committing and pushing
    /// after each.
    async fn task_loop(&mut self, git: &GitOps) -> anyhow::Result<()> {
        let mut pushed_upstream = false;
        while let Some(task) = self.unit.next_pending_task().cloned() {
            self.run_task(git, &task).await?;
            self.mark_task_complete(git, task.index).await?;

            if self.ctx.dry_run {
                continue;
            }

            let push_opts = PushOptions {
                set_upstream: !pushed_upstream,
                ..Default::default()
            };
            self.push_with_retry(git, &push_opts).await?;
            let just_set_upstream = !pushed_upstream;
            pushed_upstream = true;

            if just_set_upstream && self.pr_number.is_none() && !self.ctx.no_pr {
                let pr = self
                    .ctx
                    .pr_client
                    .create_pr(
                        &format!("choo: {}", self.unit.id),
                        &format!("Automated unit {} driven by choo.", self.unit.id),
                        &self.branch,
                        &self.ctx.target_branch,
                    )
                    .await
                    .context("creating pull request")?;
                self.pr_number = Some(pr);
                self.ctx.publish("pr.created", &self.unit.id, json!({"pr": pr}));
            }
        }
        Ok(())
    }

    async fn run_task(&mut self, git: &GitOps, task: &Task) -> anyhow::Result<()> {
        let head_before = git.rev_parse("HEAD").await?.map(|c| c.hash.to_string());
        self.ctx.publish(
            "task.started",
            &self.unit.id,
            json!({"task": task.index, "title": task.title, "head_before": head_before}),
        );

        let prompt = format!(
            "You are working on unit {unit}. Complete task {idx}: {title}.\n\
             Apply your changes directly in this worktree.",
            unit = self.unit.id,
            idx = task.index,
            title = task.title,
        );
        self.invoke_provider(git, &prompt, &format!("task-{}", task.index)).await?;

        let status = git.status().await?;
        if status.is_clean() {
            self.ctx
                .publish("task.no_changes", &self.unit.id, json!({"task": task.index}));
        } else {
            git.add_all().await?;
            git.commit(
                &format!("{}: task {}", self.unit.id, task.index),
                &CommitOptions { no_verify: true, ..Default::default() },
            )
            .await
            .context("committing task output")?;
        }

        self.ctx
            .publish("task.completed", &self.unit.id, json!({"task": task.index}));
        Ok(())
    }

    async fn mark_task_complete(&mut self, git: &GitOps, index: usize) -> anyhow::Result<()> {
        let task = self
            .unit
            .tasks
            .iter_mut()
            .find(|t| t.index == index)
            .ok_or_else(|| anyhow!("task {index} vanished from unit {}", self.unit.id))?;
        task.status = TaskStatus::Complete;
        // The on-disk task list lives under the worktree; persisting it is
        // the provider's and the orchestrator's concern elsewhere, but the
        // status change itself must land in the same commit sequence so a
        // resumed run sees it.
        git.add_all().await.ok();
        let _ = git
            .commit(
                &format!("{}: mark task {index} complete", self.unit.id),
                &CommitOptions { no_verify: true, allow_empty: true, ..Default::default() },
            )
            .await;
        Ok(())
    }

    async fn push_with_retry(&self, git: &GitOps, opts: &PushOptions) -> anyhow::Result<()> {
        match git.push("origin", &self.branch, opts).await {
            Ok(()) => Ok(()),
            Err(first_err) => {
                warn!("push failed for unit {} ({first_err}), retrying once", self.unit.id);
                git.push("origin", &self.branch, opts)
                    .await
                    .map_err(|e| anyhow!("push failed twice for unit {}: {e}", self.unit.id))
            }
        }
    }

    /// Phase 3: poll the PR for review outcome, driving feedback rounds
    /// through the provider until approved, timed out, or exhausted.
    async fn review(&mut self, git: &GitOps) -> anyhow::Result<()> {
        let Some(pr_number) = self.pr_number else {
            // No changes were ever pushed (every task was a no-op); nothing
            // to review.
            return Ok(());
        };
        let review_cfg = &self.ctx.config.review;
        let retry_cfg = &self.ctx.config.retry;
        let deadline = Instant::now() + review_cfg.timeout();
        let mut attempts = 0u32;

        loop {
            if Instant::now() >= deadline {
                self.escalate_and_fail(git, "review timed out", None).await?;
                return Err(anyhow!("review timed out for unit {}", self.unit.id));
            }
            if self.ctx.cancel.is_cancelled() {
                return Err(anyhow!("run cancelled during review of unit {}", self.unit.id));
            }

            let reactions = self.ctx.pr_client.get_reactions(pr_number).await?;
            let comments = self.ctx.pr_client.get_review_comments(pr_number).await?;
            let status = derive_review_status(&reactions, !comments.is_empty());

            match status {
                ReviewStatus::Approved => {
                    self.ctx
                        .publish("unit.review_approved", &self.unit.id, json!({"pr": pr_number}));
                    return Ok(());
                }
                ReviewStatus::ChangesRequested => {
                    attempts += 1;
                    if attempts > review_cfg.max_attempts {
                        self.escalate_and_fail(git, "review feedback exhausted retry budget", None)
                            .await?;
                        return Err(anyhow!(
                            "unit {} exceeded {} review feedback attempts",
                            self.unit.id,
                            review_cfg.max_attempts
                        ));
                    }
                    self.apply_review_feedback(git, &comments, retry_cfg).await?;
                }
                ReviewStatus::InReview | ReviewStatus::Pending => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(review_cfg.poll_interval()) => {}
                _ = self.ctx.cancel.cancelled() => {
                    return Err(anyhow!("run cancelled during review of unit {}", self.unit.id));
                }
            }
        }
    }

    async fn apply_review_feedback(
        &mut self,
        git: &GitOps,
        comments: &[crate::pr_client::ReviewComment],
        _retry_cfg: &RetryConfig,
    ) -> anyhow::Result<()> {
        let mut prompt = format!(
            "Address the following review feedback on unit {}:\n",
            self.unit.id
        );
        for comment in comments {
            match (&comment.path, comment.line) {
                (Some(path), Some(line)) => prompt.push_str(&format!("- {path}:{line}: {}\n", comment.body)),
                (Some(path), None) => prompt.push_str(&format!("- {path}: {}\n", comment.body)),
                _ => prompt.push_str(&format!("- {}\n", comment.body)),
            }
        }

        let head_before = git.rev_parse("HEAD").await?.map(|c| c.hash.to_string());
        self.invoke_provider(git, &prompt, "review-feedback").await?;
        let head_after = git.rev_parse("HEAD").await?.map(|c| c.hash.to_string());

        let status = git.status().await?;
        if !status.is_clean() {
            git.add_all().await?;
            git.commit(
                &format!("{}: address review feedback", self.unit.id),
                &CommitOptions { no_verify: true, ..Default::default() },
            )
            .await?;
        } else if head_before == head_after {
            warn!("review feedback round produced no new commits for unit {}", self.unit.id);
        }

        self.push_with_retry(git, &PushOptions::default()).await?;
        Ok(())
    }

    /// Phase 4: serialized rebase onto the target branch, with
    /// conflict-resolution retries, then force-push and host-side merge.
    async fn merge(&mut self, git: &GitOps) -> anyhow::Result<()> {
        if self.ctx.dry_run {
            self.ctx
                .publish("unit.dry_run_completed", &self.unit.id, json!({}));
            return Ok(());
        }
        let _merge_guard = self.ctx.merge_lock.lock().await;

        git.fetch("origin", Some(&self.ctx.target_branch))
            .await
            .context("fetching target branch before rebase")?;

        let target_ref = format!("origin/{}", self.ctx.target_branch);
        let mut outcome = git.rebase_onto(&target_ref).await.context("starting rebase")?;

        let max_attempts = 3u32;
        let mut attempt = 0u32;
        let mut conflicts_announced = false;
        loop {
            match outcome {
                RebaseOutcome::Succeeded => break,
                RebaseOutcome::Conflicted(ref files) => {
                    attempt += 1;
                    if !conflicts_announced {
                        conflicts_announced = true;
                        self.ctx
                            .publish("pr.conflicts_detected", &self.unit.id, json!({"files": files}));
                    }
                    if attempt > max_attempts {
                        git.rebase_abort().await.ok();
                        self.escalate_and_fail(
                            git,
                            "rebase conflicts unresolved after retry budget",
                            Some(files.join(", ")),
                        )
                        .await?;
                        return Err(anyhow!(
                            "unit {} rebase conflicts unresolved after {attempt} attempts",
                            self.unit.id
                        ));
                    }
                    let prompt = format!(
                        "Resolve the following rebase conflicts for unit {}: {}.\n\
                         Edit the conflicted files to resolve the conflicts, leaving no conflict markers.",
                        self.unit.id,
                        files.join(", "),
                    );
                    self.invoke_provider(git, &prompt, "rebase-conflict").await?;
                    let status = git.status().await?;
                    if !status.conflicted.is_empty() {
                        outcome = RebaseOutcome::Conflicted(status.conflicted);
                        continue;
                    }
                    self.ctx.publish("pr.conflicts_resolved", &self.unit.id, json!({}));
                    git.add_all().await?;
                    outcome = git.rebase_continue().await.context("continuing rebase")?;
                }
            }
        }

        git.push(
            "origin",
            &self.branch,
            &PushOptions { force_with_lease: true, ..Default::default() },
        )
        .await
        .context("force-pushing rebased branch")?;

        if let Some(pr_number) = self.pr_number {
            self.ctx
                .pr_client
                .merge_pr(pr_number)
                .await
                .context("merging pull request")?;
            self.ctx
                .publish("pr.merged", &self.unit.id, json!({"pr": pr_number, "branch": self.branch}));
        }
        Ok(())
    }

    /// Phase 5: make the worktree safe to remove (undo any leftover
    /// destructive state) then remove it. Branch deletion is deferred to
    /// the run-level pending list.
    async fn cleanup(&mut self, git: &GitOps) {
        let _ = git.reset_hard("HEAD").await;
        let _ = git.clean(&CleanOptions { directories: true, ..Default::default() }).await;
        if let Some(path) = &self.unit.worktree_path {
            let worktree_path = path.clone();
            let repo_path = self.ctx.repo_path.clone();
            let remove = tokio::process::Command::new("git")
                .args(["worktree", "remove", "--force", "--force"])
                .arg(&worktree_path)
                .current_dir(&repo_path)
                .status()
                .await;
            if let Err(e) = remove {
                warn!("failed to remove worktree {worktree_path:?} for unit {}: {e}", self.unit.id);
            }
        }
        self.ctx.pending_branch_deletes.lock().push(self.branch.clone());
    }

    async fn invoke_provider(&self, git: &GitOps, prompt: &str, label: &str) -> anyhow::Result<()> {
        let mut sink = CollectSink::default();
        let provider_name = self.ctx.provider.binary.to_string_lossy();
        let log_path = self.ctx.worktree_base.join("logs").join(format!(
            "{provider_name}-{}-{}.log",
            self.unit.id,
            chrono::Utc::now().timestamp()
        ));
        self.ctx
            .provider
            .invoke(prompt, git.path(), &log_path, &mut sink, &self.ctx.cancel)
            .await
            .with_context(|| format!("provider invocation ({label}) failed for unit {}", self.unit.id))?;
        Ok(())
    }

    async fn escalate_and_fail(&self, git: &GitOps, title: &str, last_error: Option<String>) -> anyhow::Result<()> {
        let branch = git.current_branch().await.ok().flatten();
        let escalation = Escalation::blocking(self.unit.id.as_str(), title, title).with_context(crate::escalation::EscalationContext {
            pr_url: self.pr_number.map(|n| format!("#{n}")),
            branch,
            last_error,
        });
        self.ctx.publish(
            "escalation.raised",
            &self.unit.id,
            serde_json::to_value(&escalation).unwrap_or(json!({})),
        );
        Ok(())
    }
}

/// Short, stable suffix for a branch name, derived from the unit ID so two
/// units with the same prefix don't collide.
fn short_suffix(unit_id: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    unit_id.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

/// Parses `mark_task_complete`'s commit subjects out of a `git log`
/// output, returning the set of task indices they mark done.
fn completed_task_indices(log: &str, unit_id: &str) -> std::collections::HashSet<usize> {
    let prefix = format!("{unit_id}: mark task ");
    log.lines()
        .filter_map(|line| line.strip_prefix(&prefix)?.strip_suffix(" complete")?.parse().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_suffix_is_deterministic_and_differs_by_id() {
        assert_eq!(short_suffix("unit-a"), short_suffix("unit-a"));
        assert_ne!(short_suffix("unit-a"), short_suffix("unit-b"));
    }

    #[test]
    fn worker_branch_name_uses_prefix_and_id() {
        let ctx = test_ctx();
        let unit = Unit::new("unit-a", vec![Task::new(0, "t")], vec![]);
        let worker = Worker::new(ctx, unit);
        assert!(worker.branch.starts_with("feature/unit-a-"));
    }

    #[test]
    fn completed_task_indices_parses_mark_complete_subjects() {
        let log = "b: unrelated work\n\
                    b: mark task 2 complete\n\
                    b: mark task 0 complete\n\
                    a: mark task 2 complete\n";
        let done = completed_task_indices(log, "b");
        assert_eq!(done, std::collections::HashSet::from([0, 2]));
    }

    #[test]
    fn completed_task_indices_empty_for_no_matches() {
        assert!(completed_task_indices("", "b").is_empty());
        assert!(completed_task_indices("b: did something else\n", "b").is_empty());
    }

    fn test_ctx() -> WorkerContext {
        WorkerContext {
            run_id: "run_1".into(),
            repo_path: PathBuf::from("/tmp/repo"),
            worktree_base: PathBuf::from("/tmp/wt"),
            target_branch: "main".into(),
            branch_prefix: "feature/".into(),
            config: Arc::new(Config::default()),
            scheduler: Arc::new(Scheduler::new(vec![]).unwrap()),
            events: Arc::new(EventBus::new()),
            pr_client: Arc::new(PrClient::new("token", "owner", "repo").unwrap()),
            provider: Arc::new(ProviderRunner::new("claude")),
            merge_lock: Arc::new(tokio::sync::Mutex::new(())),
            pending_branch_deletes: Arc::new(SyncMutex::new(Vec::new())),
            cancel: CancellationToken::new(),
            skip_review: false,
            no_pr: false,
            dry_run: false,
        }
    }
}
