//! Binds `Scheduler`, `WorkerPool`, `GitOps`, `ProviderRunner`,
//! `PrClient`, `EventBus`, and `HistoryStore` into one run: discover
//! units, build the graph, drive the scheduler through the worker pool,
//! and finalize the run row.
//!
//! Grounded on the teacher's own top-level control flow (`config.rs`'s
//! `Config` driving a single invocation end-to-end) generalized from "run
//! one set of test commands over one set of commits" to "run one set of
//! units over one repo".

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::events::{Event, EventBus, HISTORY_SINK_CAPACITY};
use crate::git::{GitOps, NullAuditLogger};
use crate::history::{GraphSnapshot, HistoryStore, Run, RunStatus};
use crate::pr_client::PrClient;
use crate::provider::ProviderRunner;
use crate::scheduler::Scheduler;
use crate::unit;
use crate::worker::WorkerContext;
use crate::worker_pool::WorkerPool;

/// Everything needed to start a run, gathered by the CLI/daemon layer
/// from flags, environment, and the config file.
pub struct RunRequest {
    pub repo_path: PathBuf,
    pub tasks_dir: PathBuf,
    pub config: Arc<Config>,
    pub github_token: String,
    pub github_owner: String,
    pub github_repo: String,
    pub dry_run: bool,
    /// Restricts the run to this unit and its transitive dependencies,
    /// per `--unit <id>`. `None` runs every discovered unit.
    pub unit_filter: Option<String>,
    /// Per `--skip-review`: every worker goes straight from its task loop
    /// to merge.
    pub skip_review: bool,
    /// Per `--no-pr`: units push their branch but never open a PR or
    /// attempt a host-side merge.
    pub no_pr: bool,
    /// Set by `resume`: the run_id of a previously stopped run to continue
    /// under, rather than starting a fresh run row. Events keep a single
    /// `run_id` across the stop/resume boundary, with `seq` continuing
    /// strictly above whatever it last reached.
    pub resume_run_id: Option<String>,
}

/// Drives a single run from discovery through finalization. Constructed
/// once per `StartJob`; dropped once the run terminates.
pub struct Orchestrator {
    run_id: String,
    repo_path: PathBuf,
    config: Arc<Config>,
    scheduler: Arc<Scheduler>,
    events: Arc<EventBus>,
    history: Arc<HistoryStore>,
    cancel: CancellationToken,
    skip_review: bool,
    no_pr: bool,
    dry_run: bool,
}

/// Restricts `units` to `target` and everything it transitively depends
/// on, preserving discovery order. Errors if `target` isn't among the
/// discovered units.
fn filter_to_unit_and_deps(units: Vec<crate::unit::Unit>, target: &str) -> anyhow::Result<Vec<crate::unit::Unit>> {
    let by_id: std::collections::HashMap<&str, &crate::unit::Unit> =
        units.iter().map(|u| (u.id.as_str(), u)).collect();
    if !by_id.contains_key(target) {
        anyhow::bail!("unit {target:?} not found among discovered units");
    }

    let mut keep = std::collections::HashSet::new();
    let mut stack = vec![target.to_string()];
    while let Some(id) = stack.pop() {
        if !keep.insert(id.clone()) {
            continue;
        }
        if let Some(unit) = by_id.get(id.as_str()) {
            stack.extend(unit.dependencies.iter().cloned());
        }
    }

    Ok(units.into_iter().filter(|u| keep.contains(&u.id)).collect())
}

impl Orchestrator {
    /// Discovers units, builds the scheduler and graph, persists the
    /// `runs`/`graphs` rows, and returns an `Orchestrator` ready to
    /// `run()`. Fails fast (before any worker is spawned) on discovery or
    /// graph-construction errors, per spec_full.md's fail-fast DAG
    /// contract.
    pub fn start(
        request: RunRequest,
        history: Arc<HistoryStore>,
        events: Arc<EventBus>,
    ) -> anyhow::Result<Self> {
        let run_id = request.resume_run_id.clone().unwrap_or_else(new_run_id);
        let units = unit::discover(&request.tasks_dir)
            .with_context(|| format!("discovering units under {:?}", request.tasks_dir))?;
        let units = match &request.unit_filter {
            Some(target) => filter_to_unit_and_deps(units, target)?,
            None => units,
        };
        let total_units = units.len() as u32;
        let scheduler = Arc::new(Scheduler::new(units).context("building unit dependency graph")?);

        if request.resume_run_id.is_some() {
            history.reopen_run(&run_id, total_units).context("reopening run for resume")?;
            let marker = history.append_resume_marker(&run_id).context("appending resume marker")?;
            events.publish(marker);
        } else {
            let run = Run {
                id: run_id.clone(),
                repo_path: request.repo_path.display().to_string(),
                started_at: chrono::Utc::now(),
                completed_at: None,
                status: RunStatus::Running,
                parallelism: request.config.parallelism as u32,
                total_units,
                completed_units: 0,
                failed_units: 0,
                blocked_units: 0,
                error: None,
                tasks_dir: request.tasks_dir.display().to_string(),
                dry_run: request.dry_run,
            };
            history.create_run(&run).context("persisting run row")?;
        }

        let unit_levels = scheduler.levels();
        let nodes: Vec<serde_json::Value> = unit_levels
            .iter()
            .map(|(id, level)| serde_json::json!({"id": id, "level": level}))
            .collect();
        let levels: Vec<serde_json::Value> = unit_levels.iter().map(|(_, l)| serde_json::json!(l)).collect();
        let edges: Vec<serde_json::Value> = scheduler
            .edges()
            .into_iter()
            .map(|(dependent, prereq)| serde_json::json!({"from": prereq, "to": dependent}))
            .collect();
        history
            .save_graph(
                &run_id,
                &GraphSnapshot {
                    nodes: serde_json::Value::Array(nodes.clone()),
                    edges: serde_json::Value::Array(edges.clone()),
                    levels: serde_json::Value::Array(levels),
                },
            )
            .context("persisting graph snapshot")?;

        if request.resume_run_id.is_none() {
            events.publish(Event::new(
                &run_id,
                "run.started",
                serde_json::json!({"nodes": nodes, "edges": edges}),
            ));
        }

        Ok(Self {
            run_id,
            repo_path: request.repo_path,
            config: request.config,
            scheduler,
            events,
            history,
            cancel: CancellationToken::new(),
            skip_review: request.skip_review,
            no_pr: request.no_pr,
            dry_run: request.dry_run,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drives the run to completion: spawns the history sink, dispatches
    /// every unit through the `WorkerPool`, and records the terminal run
    /// status. Returns the pool's first error, if any; the run row is
    /// always finalized regardless.
    pub async fn run(
        self,
        pr_client: Arc<PrClient>,
        provider_factory: impl Fn(Option<&str>) -> Arc<ProviderRunner>,
    ) -> anyhow::Result<()> {
        let sink_handle = self.spawn_history_sink();

        // A child token: user cancellation (`self.cancel`, what
        // `cancel_handle()` hands out) propagates down into it, but
        // `ErrGroup` cancelling it to fail fast on a unit error does not
        // propagate back up. That keeps `finalize`'s Stopped/Failed split
        // honest instead of a failed unit masquerading as a user stop.
        let work_cancel = self.cancel.child_token();
        let worker_pool = WorkerPool::new(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.events),
            self.config.parallelism,
            work_cancel.clone(),
        );

        let merge_lock = Arc::new(tokio::sync::Mutex::new(()));
        let pending_branch_deletes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let worktree_base = self.config.worktree_base.clone();
        let target_branch = self.config.target_branch.clone();
        let branch_prefix = self.config.feature.branch_prefix.clone();

        let scheduler_for_ctx = Arc::clone(&self.scheduler);
        let events_for_ctx = Arc::clone(&self.events);
        let config_for_ctx = Arc::clone(&self.config);
        let run_id = self.run_id.clone();
        let repo_path = self.repo_path.clone();
        let cancel = work_cancel.clone();
        let skip_review = self.skip_review;
        let no_pr = self.no_pr;
        let dry_run = self.dry_run;

        let result = worker_pool
            .run(|unit_id| {
                let unit = scheduler_for_ctx.unit(unit_id);
                let provider = provider_factory(unit.as_ref().and_then(|u| u.provider_override.as_deref()));
                WorkerContext {
                    run_id: run_id.clone(),
                    repo_path: repo_path.clone(),
                    worktree_base: worktree_base.clone(),
                    target_branch: target_branch.clone(),
                    branch_prefix: branch_prefix.clone(),
                    config: Arc::clone(&config_for_ctx),
                    scheduler: Arc::clone(&scheduler_for_ctx),
                    events: Arc::clone(&events_for_ctx),
                    pr_client: Arc::clone(&pr_client),
                    provider,
                    merge_lock: Arc::clone(&merge_lock),
                    pending_branch_deletes: Arc::clone(&pending_branch_deletes),
                    cancel: cancel.clone(),
                    skip_review,
                    no_pr,
                    dry_run,
                }
            })
            .await;

        self.finalize(&result, &pending_branch_deletes).await;
        sink_handle.abort();
        result
    }

    async fn finalize(&self, result: &anyhow::Result<()>, pending_branch_deletes: &parking_lot::Mutex<Vec<String>>) {
        let counts = self.scheduler.counts_by_status();
        let completed = *counts.get(&crate::unit::UnitStatus::Complete).unwrap_or(&0) as u32;
        let failed = *counts.get(&crate::unit::UnitStatus::Failed).unwrap_or(&0) as u32;
        let blocked = *counts.get(&crate::unit::UnitStatus::Blocked).unwrap_or(&0) as u32;
        let _ = self.history.update_progress(&self.run_id, completed, failed, blocked);

        let status = if self.cancel.is_cancelled() {
            RunStatus::Stopped
        } else if result.is_ok() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let error_message = result.as_ref().err().map(|e| e.to_string());
        let _ = self.history.complete_run(&self.run_id, status, error_message.as_deref());

        let terminal_event = if status == RunStatus::Stopped {
            Event::new(&self.run_id, "run.stopped", serde_json::json!({"reason": "user_interrupt"}))
        } else {
            Event::new(
                &self.run_id,
                "run.completed",
                serde_json::json!({"completed": completed, "failed": failed, "blocked": blocked}),
            )
        };
        self.events.publish(terminal_event);

        // A stopped run may resume later and lean on `setup()` finding the
        // interrupted unit's branch still there; only completed/failed runs
        // drain the pending-delete list.
        if status != RunStatus::Stopped {
            self.delete_pending_branches(pending_branch_deletes).await;
        }
    }

    /// Deletes every branch accumulated in the run's pending-delete list,
    /// once the whole run has finished. Failures are logged, not fatal:
    /// a leftover branch is an inspectable nuisance, not data loss.
    async fn delete_pending_branches(&self, pending_branch_deletes: &parking_lot::Mutex<Vec<String>>) {
        let branches = std::mem::take(&mut *pending_branch_deletes.lock());
        if branches.is_empty() {
            return;
        }
        // No branch guard: this GitOps only ever deletes already-merged
        // feature branches, never writes to the checked-out branch's
        // content, so the guard's protected-branch check doesn't apply.
        let Ok(git) = GitOps::new_repo_root(&self.repo_path, None, Arc::new(NullAuditLogger)).await else {
            log::warn!("could not open repo root GitOps to delete {} pending branches", branches.len());
            return;
        };
        for branch in branches {
            if let Err(e) = git.delete_branch(&branch).await {
                log::warn!("failed to delete branch {branch:?} after run {}: {e}", self.run_id);
            }
        }
    }

    /// Subscribes to the bus at history-sink capacity and appends every
    /// event to the store, assigning it its durable `seq`. Runs for the
    /// orchestrator's lifetime; aborted once `run()` returns.
    fn spawn_history_sink(&self) -> tokio::task::JoinHandle<()> {
        let mut subscriber = self.events.subscribe(HISTORY_SINK_CAPACITY, None);
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            while let Some(event) = subscriber.recv().await {
                if let Err(e) = history.insert_event(event) {
                    log::warn!("failed to persist event: {e}");
                }
            }
        })
    }
}

fn new_run_id() -> String {
    let now = chrono::Utc::now();
    let rand_suffix: u16 = rand::thread_rng().gen();
    format!("run_{}_{:04x}", now.format("%Y%m%d_%H%M%S"), rand_suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_run_id_has_expected_shape() {
        let id = new_run_id();
        assert!(id.starts_with("run_"));
        let parts: Vec<&str> = id.splitn(4, '_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 4);
    }

    #[tokio::test]
    async fn start_fails_fast_on_unknown_dependency() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("b/01.md"), "task").unwrap();
        std::fs::write(dir.path().join("b/DEPENDS_ON"), "nonexistent\n").unwrap();

        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let request = RunRequest {
            repo_path: dir.path().to_path_buf(),
            tasks_dir: dir.path().to_path_buf(),
            config: Arc::new(Config::default()),
            github_token: "token".into(),
            github_owner: "owner".into(),
            github_repo: "repo".into(),
            dry_run: true,
            unit_filter: None,
            skip_review: false,
            no_pr: false,
            resume_run_id: None,
        };
        let result = Orchestrator::start(request, history, events);
        assert!(result.is_err());
    }

    fn unit(id: &str, deps: &[&str]) -> crate::unit::Unit {
        crate::unit::Unit::new(
            id,
            vec![crate::unit::Task::new(0, "t")],
            deps.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn filter_to_unit_and_deps_keeps_target_and_transitive_deps() {
        let units = vec![
            unit("a", &[]),
            unit("b", &["a"]),
            unit("c", &["b"]),
            unit("d", &[]),
        ];
        let kept = filter_to_unit_and_deps(units, "c").unwrap();
        let ids: std::collections::HashSet<&str> = kept.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, std::collections::HashSet::from(["a", "b", "c"]));
    }

    #[test]
    fn filter_to_unit_and_deps_errors_on_unknown_target() {
        let units = vec![unit("a", &[])];
        let result = filter_to_unit_and_deps(units, "missing");
        assert!(result.is_err());
    }
}
