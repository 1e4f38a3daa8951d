//! `JobManager` owns every in-flight run plus the collaborators an
//! `Orchestrator` needs, and exposes the RPCs spec_full.md's daemon
//! section describes (StartJob, StopJob, GetJobStatus, ListJobs,
//! WatchJob, Shutdown, Health). `Daemon` wraps it in a Unix domain
//! socket listener, framing each request/response as one JSON object
//! per line, the same newline-delimited framing already used for the
//! event-to-UI socket (`crate::util::web_socket_path`).
//!
//! Grounded on the teacher's `util.rs` preference for small, narrow
//! types around I/O (`ErrGroup` wrapping a `JoinSet`) generalized here
//! to a job table wrapping one `tokio::task::JoinHandle` per run.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::RpcError;
use crate::events::{Event, EventBus, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::history::{GetEventsFilter, HistoryStore, ListRunsFilter, Run, RunStatus};
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::pr_client::PrClient;
use crate::provider::ProviderRunner;

/// One job's background task plus the handle used to cancel it.
struct Job {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// Request body for `StartJob`. Everything the CLI/daemon client layer
/// would already have resolved from flags, environment, and the config
/// file before making the call.
#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub repo_path: std::path::PathBuf,
    pub tasks_dir: std::path::PathBuf,
    /// `-p/--parallelism`: overrides the daemon's default config.
    pub parallelism: Option<usize>,
    /// `-t/--target`: overrides the daemon's default config.
    pub target_branch: Option<String>,
    pub github_token: String,
    pub github_owner: String,
    pub github_repo: String,
    pub dry_run: bool,
    /// `--force-task-provider`: overrides every unit's provider choice.
    pub force_task_provider: Option<String>,
    /// `--provider`: the run's default, below a unit's own declaration.
    pub provider: Option<String>,
    /// `--unit <id>`: restricts the run to this unit and its dependencies.
    pub unit_filter: Option<String>,
    /// `--skip-review`.
    pub skip_review: bool,
    /// `--no-pr`.
    pub no_pr: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub active_jobs: u32,
    pub version: String,
}

/// Owns every in-flight run's cancellation handle and background task,
/// plus the `HistoryStore`/`EventBus`/`Config` every `Orchestrator`
/// shares. One instance per daemon process; `Daemon` is the thin
/// socket-facing shell around it.
pub struct JobManager {
    history: Arc<HistoryStore>,
    events: Arc<EventBus>,
    default_config: Arc<Config>,
    jobs: Arc<AsyncMutex<HashMap<String, Job>>>,
    shutting_down: AtomicBool,
}

impl JobManager {
    pub fn new(history: Arc<HistoryStore>, events: Arc<EventBus>, default_config: Arc<Config>) -> Self {
        Self {
            history,
            events,
            default_config,
            jobs: Arc::new(AsyncMutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub async fn start_job(&self, request: StartJobRequest) -> Result<String, RpcError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RpcError::unavailable("daemon is shutting down"));
        }

        let mut config = (*self.default_config).clone();
        if let Some(parallelism) = request.parallelism {
            config.parallelism = parallelism;
        }
        if let Some(target_branch) = request.target_branch {
            config.target_branch = target_branch;
        }
        let config = Arc::new(config);
        let run_request = RunRequest {
            repo_path: request.repo_path,
            tasks_dir: request.tasks_dir,
            config: Arc::clone(&config),
            github_token: request.github_token.clone(),
            github_owner: request.github_owner.clone(),
            github_repo: request.github_repo.clone(),
            dry_run: request.dry_run,
            unit_filter: request.unit_filter,
            skip_review: request.skip_review,
            no_pr: request.no_pr,
            resume_run_id: None,
        };

        let orchestrator = Orchestrator::start(run_request, Arc::clone(&self.history), Arc::clone(&self.events))
            .map_err(|e| RpcError::invalid_argument(e.to_string()))?;
        let run_id = orchestrator.run_id().to_string();
        let cancel = orchestrator.cancel_handle();

        let pr_client = Arc::new(
            PrClient::new(request.github_token, request.github_owner, request.github_repo)
                .map_err(RpcError::from)?,
        );
        let forced_override = request.force_task_provider;
        let runtime_default = request.provider;
        let provider_factory = move |unit_override: Option<&str>| -> Arc<ProviderRunner> {
            Arc::new(ProviderRunner::resolve(
                &config.provider,
                forced_override.as_deref(),
                unit_override,
                runtime_default.as_deref(),
            ))
        };

        let jobs = Arc::clone(&self.jobs);
        let run_id_for_cleanup = run_id.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = orchestrator.run(pr_client, provider_factory).await {
                warn!("run failed: {e}");
            }
            jobs.lock().await.remove(&run_id_for_cleanup);
        });

        self.jobs.lock().await.insert(run_id.clone(), Job { cancel, handle });
        Ok(run_id)
    }

    pub async fn stop_job(&self, run_id: &str, force: bool) -> Result<(), RpcError> {
        let run = self
            .history
            .get_run(run_id)
            .map_err(RpcError::from)?
            .ok_or_else(|| RpcError::not_found(format!("unknown job {run_id:?}")))?;
        if matches!(run.status, RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped) {
            return Err(RpcError::failed_precondition(format!(
                "job {run_id:?} is already {:?}",
                run.status
            )));
        }
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(run_id)
            .ok_or_else(|| RpcError::not_found(format!("unknown job {run_id:?}")))?;
        job.cancel.cancel();
        if force {
            job.handle.abort();
        }
        Ok(())
    }

    pub fn get_job_status(&self, run_id: &str) -> Result<Run, RpcError> {
        self.history
            .get_run(run_id)
            .map_err(RpcError::from)?
            .ok_or_else(|| RpcError::not_found(format!("unknown job {run_id:?}")))
    }

    pub fn list_jobs(&self, status: Option<RunStatus>) -> Result<Vec<Run>, RpcError> {
        self.history
            .list_runs(ListRunsFilter {
                status,
                limit: 100,
                ..Default::default()
            })
            .map_err(RpcError::from)
    }

    pub async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: !self.shutting_down.load(Ordering::Acquire),
            active_jobs: self.jobs.lock().await.len() as u32,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Replays every stored event for `run_id` with `seq > from_seq`, then
    /// keeps polling the store for more. A bus subscription only ever acts
    /// as a wakeup: events carry `seq = 0` until the history sink has
    /// persisted them, so two watchers with different `from_seq` always
    /// converge on the same tail by re-reading the authoritative, seq'd
    /// rows rather than trusting the seq on a live bus event. Sends each
    /// row to `tx`; stops as soon as the receiver is dropped (client
    /// disconnected) or the run hits a terminal status with nothing left
    /// to drain.
    pub async fn watch_job(&self, run_id: &str, from_seq: u64, tx: tokio::sync::mpsc::Sender<Event>) -> Result<(), RpcError> {
        let mut last_seq = from_seq;
        let mut subscriber = self.events.subscribe(DEFAULT_SUBSCRIBER_CAPACITY, None);
        loop {
            loop {
                let page = self
                    .history
                    .get_run_events(
                        run_id,
                        GetEventsFilter {
                            after_seq: last_seq,
                            limit: 1000,
                            ..Default::default()
                        },
                    )
                    .map_err(RpcError::from)?;
                let got_any = !page.events.is_empty();
                for event in page.events {
                    last_seq = last_seq.max(event.seq);
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                if !page.has_more || !got_any {
                    break;
                }
            }

            match self.history.get_run(run_id) {
                Ok(Some(run)) if run.status.is_terminal() => break,
                Ok(Some(_)) => {}
                Ok(None) => return Err(RpcError::not_found(format!("unknown job {run_id:?}"))),
                Err(e) => return Err(RpcError::from(e)),
            }
            if subscriber.recv().await.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Cancels every running job; if `wait_for_jobs`, waits up to
    /// `timeout` for them to unwind before returning regardless.
    pub async fn shutdown(&self, wait_for_jobs: bool, timeout: Duration) {
        self.shutting_down.store(true, Ordering::Release);
        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut jobs = self.jobs.lock().await;
            for job in jobs.values() {
                job.cancel.cancel();
            }
            if wait_for_jobs {
                jobs.drain().map(|(_, job)| job.handle).collect()
            } else {
                Vec::new()
            }
        };
        if !handles.is_empty() {
            if tokio::time::timeout(timeout, futures::future::join_all(handles)).await.is_err() {
                warn!("shutdown timed out waiting for jobs to stop");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
enum Request {
    StartJob(StartJobRequest),
    StopJob { run_id: String, force: bool },
    GetJobStatus { run_id: String },
    ListJobs { status: Option<RunStatus> },
    WatchJob { run_id: String, from_seq: u64 },
    Shutdown { wait_for_jobs: bool, timeout_seconds: u64 },
    Health,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum Response {
    Started { run_id: String },
    Ok,
    Status(Run),
    Jobs(Vec<Run>),
    Event(Event),
    WatchDone,
    Health(HealthStatus),
    Error { code: String, message: String },
}

impl From<RpcError> for Response {
    fn from(e: RpcError) -> Self {
        Response::Error {
            code: e.kind.to_string(),
            message: e.message,
        }
    }
}

/// Unix-domain-socket front end for a [`JobManager`]. Binds the socket
/// at construction, restricting permissions to the owning user, and
/// accepts one connection per client, each handled as an independent
/// NDJSON request/response loop.
pub struct Daemon {
    manager: Arc<JobManager>,
    listener: UnixListener,
}

impl Daemon {
    pub async fn bind(socket_path: &std::path::Path, manager: Arc<JobManager>) -> anyhow::Result<Self> {
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(socket_path).await;
        let listener = UnixListener::bind(socket_path)?;
        tokio::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(Self { manager, listener })
    }

    /// Accepts connections until `shutdown` fires, handling each on its
    /// own task.
    pub async fn serve(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let manager = Arc::clone(&self.manager);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, manager).await {
                                    warn!("daemon connection error: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("failed to accept daemon connection: {e}"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("daemon listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, manager: Arc<JobManager>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                write_response(&mut write_half, &Response::from(RpcError::invalid_argument(e.to_string()))).await?;
                continue;
            }
        };

        match request {
            Request::StartJob(req) => {
                let response = match manager.start_job(req).await {
                    Ok(run_id) => Response::Started { run_id },
                    Err(e) => Response::from(e),
                };
                write_response(&mut write_half, &response).await?;
            }
            Request::StopJob { run_id, force } => {
                let response = match manager.stop_job(&run_id, force).await {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::from(e),
                };
                write_response(&mut write_half, &response).await?;
            }
            Request::GetJobStatus { run_id } => {
                let response = match manager.get_job_status(&run_id) {
                    Ok(run) => Response::Status(run),
                    Err(e) => Response::from(e),
                };
                write_response(&mut write_half, &response).await?;
            }
            Request::ListJobs { status } => {
                let response = match manager.list_jobs(status) {
                    Ok(runs) => Response::Jobs(runs),
                    Err(e) => Response::from(e),
                };
                write_response(&mut write_half, &response).await?;
            }
            Request::WatchJob { run_id, from_seq } => {
                let (tx, mut rx) = tokio::sync::mpsc::channel::<Event>(64);
                let manager_for_watch = Arc::clone(&manager);
                let watch_task = tokio::spawn(async move { manager_for_watch.watch_job(&run_id, from_seq, tx).await });
                while let Some(event) = rx.recv().await {
                    write_response(&mut write_half, &Response::Event(event)).await?;
                }
                match watch_task.await {
                    Ok(Ok(())) => write_response(&mut write_half, &Response::WatchDone).await?,
                    Ok(Err(e)) => write_response(&mut write_half, &Response::from(e)).await?,
                    Err(join_err) => warn!("watch_job task did not complete cleanly: {join_err}"),
                }
            }
            Request::Shutdown {
                wait_for_jobs,
                timeout_seconds,
            } => {
                manager.shutdown(wait_for_jobs, Duration::from_secs(timeout_seconds)).await;
                write_response(&mut write_half, &Response::Ok).await?;
            }
            Request::Health => {
                let health = manager.health().await;
                write_response(&mut write_half, &Response::Health(health)).await?;
            }
        }
    }
    Ok(())
}

async fn write_response(
    write_half: &mut (impl AsyncWriteExt + Unpin),
    response: &Response,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Arc<HistoryStore> {
        Arc::new(HistoryStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn start_job_rejects_unknown_dependency() {
        let manager = JobManager::new(history(), Arc::new(EventBus::new()), Arc::new(Config::default()));
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::write(dir.path().join("b/01.md"), "task").unwrap();
        std::fs::write(dir.path().join("b/DEPENDS_ON"), "nonexistent\n").unwrap();

        let result = manager
            .start_job(StartJobRequest {
                repo_path: dir.path().to_path_buf(),
                tasks_dir: dir.path().to_path_buf(),
                parallelism: None,
                target_branch: None,
                github_token: "token".into(),
                github_owner: "owner".into(),
                github_repo: "repo".into(),
                dry_run: true,
                force_task_provider: None,
                provider: None,
                unit_filter: None,
                skip_review: false,
                no_pr: false,
            })
            .await;
        assert!(matches!(result, Err(e) if e.kind == crate::error::RpcErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn stop_job_reports_not_found_for_unknown_run() {
        let manager = JobManager::new(history(), Arc::new(EventBus::new()), Arc::new(Config::default()));
        let result = manager.stop_job("run_ghost", false).await;
        assert!(matches!(result, Err(e) if e.kind == crate::error::RpcErrorKind::NotFound));
    }

    #[tokio::test]
    async fn get_job_status_reports_not_found_for_unknown_run() {
        let manager = JobManager::new(history(), Arc::new(EventBus::new()), Arc::new(Config::default()));
        let result = manager.get_job_status("run_ghost");
        assert!(matches!(result, Err(e) if e.kind == crate::error::RpcErrorKind::NotFound));
    }

    #[tokio::test]
    async fn health_reflects_shutting_down_state() {
        let manager = JobManager::new(history(), Arc::new(EventBus::new()), Arc::new(Config::default()));
        assert!(manager.health().await.healthy);
        manager.shutdown(false, Duration::from_millis(10)).await;
        assert!(!manager.health().await.healthy);
    }

    fn sample_run(id: &str) -> Run {
        Run {
            id: id.into(),
            repo_path: "/repo".into(),
            started_at: chrono::Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            parallelism: 1,
            total_units: 1,
            completed_units: 0,
            failed_units: 0,
            blocked_units: 0,
            error: None,
            tasks_dir: "/tasks".into(),
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn watch_job_from_different_offsets_converges_on_the_same_tail() {
        let history_store = history();
        history_store.create_run(&sample_run("run_1")).unwrap();
        history_store.insert_event(Event::new("run_1", "a", serde_json::json!({}))).unwrap();
        let b = history_store.insert_event(Event::new("run_1", "b", serde_json::json!({}))).unwrap();

        let events = Arc::new(EventBus::new());
        let manager = Arc::new(JobManager::new(history_store.clone(), Arc::clone(&events), Arc::new(Config::default())));

        let (tx_early, mut rx_early) = tokio::sync::mpsc::channel(16);
        let (tx_late, mut rx_late) = tokio::sync::mpsc::channel(16);
        let early = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.watch_job("run_1", 0, tx_early).await }
        });
        let late = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.watch_job("run_1", b.seq, tx_late).await }
        });

        // Give both watchers a chance to drain the pre-existing rows and
        // park on the live subscription before publishing the tail event.
        tokio::time::sleep(Duration::from_millis(20)).await;
        history_store.insert_event(Event::new("run_1", "c", serde_json::json!({}))).unwrap();
        events.publish(Event::new("run_1", "c", serde_json::json!({})));
        history_store.complete_run("run_1", RunStatus::Completed, None).unwrap();
        events.publish(Event::new("run_1", "wake", serde_json::json!({})));

        let deadline = Duration::from_secs(5);
        let early_types: Vec<String> = tokio::time::timeout(deadline, async {
            let mut out = Vec::new();
            while let Some(e) = rx_early.recv().await {
                out.push(e.event_type);
            }
            out
        })
        .await
        .unwrap();
        let late_types: Vec<String> = tokio::time::timeout(deadline, async {
            let mut out = Vec::new();
            while let Some(e) = rx_late.recv().await {
                out.push(e.event_type);
            }
            out
        })
        .await
        .unwrap();

        early.await.unwrap().unwrap();
        late.await.unwrap().unwrap();

        assert_eq!(early_types, vec!["a", "b", "c"]);
        assert_eq!(late_types, vec!["c"], "watcher starting after b's seq must not replay a or b");
    }

    #[tokio::test]
    async fn list_jobs_filters_by_status() {
        let history_store = history();
        history_store.create_run(&sample_run("run_1")).unwrap();
        let manager = JobManager::new(history_store, Arc::new(EventBus::new()), Arc::new(Config::default()));
        assert_eq!(manager.list_jobs(Some(RunStatus::Running)).unwrap().len(), 1);
        assert_eq!(manager.list_jobs(Some(RunStatus::Failed)).unwrap().len(), 0);
    }
}
