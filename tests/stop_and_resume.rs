//! Drives a real unit through a cancellation mid-task, then resumes the
//! same run: the stopped run's `run_id` must carry through, already
//! completed tasks must not rerun, and `seq` must keep climbing across the
//! stop/resume boundary with no gaps.

use serde_json::json;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use choo::config::Config;
use choo::events::EventBus;
use choo::history::{GetEventsFilter, HistoryStore, RunStatus};
use choo::orchestrator::{Orchestrator, RunRequest};
use choo::pr_client::PrClient;
use choo::provider::ProviderRunner;

fn init_repo(path: &std::path::Path) {
    let run = |args: &[&str]| {
        let status = Command::new("git").args(args).current_dir(path).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "choo@example.com"]);
    run(&["config", "user.name", "choo"]);
    std::fs::write(path.join("README.md"), "hello\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "initial"]);
}

fn write_unit(tasks_dir: &std::path::Path) {
    std::fs::create_dir(tasks_dir.join("a")).unwrap();
    std::fs::write(tasks_dir.join("a/01.md"), "first task").unwrap();
    std::fs::write(tasks_dir.join("a/02.md"), "second task").unwrap();
}

fn base_request(repo_dir: &std::path::Path, tasks_dir: &std::path::Path, config: Arc<Config>, resume_run_id: Option<String>) -> RunRequest {
    RunRequest {
        repo_path: repo_dir.to_path_buf(),
        tasks_dir: tasks_dir.to_path_buf(),
        config,
        github_token: String::new(),
        github_owner: String::new(),
        github_repo: String::new(),
        dry_run: true,
        unit_filter: None,
        skip_review: true,
        no_pr: true,
        resume_run_id,
    }
}

#[tokio::test]
async fn stopped_run_resumes_without_redoing_completed_tasks() {
    let repo_dir = tempfile::tempdir().unwrap();
    init_repo(repo_dir.path());

    let tasks_dir = tempfile::tempdir().unwrap();
    write_unit(tasks_dir.path());

    let worktree_base = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.parallelism = 1;
    config.target_branch = "main".to_string();
    config.worktree_base = worktree_base.path().to_path_buf();
    let config = Arc::new(config);

    let history = Arc::new(HistoryStore::open_in_memory().unwrap());
    let events = Arc::new(EventBus::new());

    // Slow enough that a cancellation fired right after task 1 finishes
    // reliably lands while task 2's provider invocation is still running.
    let slow_provider = |_: Option<&str>| {
        let mut provider = ProviderRunner::new("sleep");
        provider.extra_args = vec!["0.3".to_string()];
        Arc::new(provider)
    };

    let request = base_request(repo_dir.path(), tasks_dir.path(), Arc::clone(&config), None);
    let orchestrator = Orchestrator::start(request, Arc::clone(&history), Arc::clone(&events)).unwrap();
    let run_id = orchestrator.run_id().to_string();
    let cancel = orchestrator.cancel_handle();

    let mut task_completions = events.subscribe(16, Some("task.completed".to_string()));
    let pr_client = Arc::new(PrClient::new("", "owner", "repo").unwrap());
    let run_handle = tokio::spawn(orchestrator.run(pr_client, slow_provider));

    let first_task_done = tokio::time::timeout(Duration::from_secs(5), task_completions.recv())
        .await
        .expect("task 1 should complete before the timeout")
        .expect("bus still open");
    assert_eq!(first_task_done.payload["task"], json!(1));
    cancel.cancel();

    // The cancelled unit's provider invocation fails, which fails the
    // unit; that's expected, the run's Stopped status comes from the
    // cancellation, not from the unit's own result.
    let _ = tokio::time::timeout(Duration::from_secs(10), run_handle).await.unwrap();

    let stopped_run = history.get_run(&run_id).unwrap().expect("run row persisted");
    assert_eq!(stopped_run.status, RunStatus::Stopped);

    let stopped_events = history
        .get_run_events(&run_id, GetEventsFilter { limit: 1000, ..Default::default() })
        .unwrap();
    let types: Vec<&str> = stopped_events.events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"run.stopped"));
    let stop_event = stopped_events.events.iter().find(|e| e.event_type == "run.stopped").unwrap();
    assert_eq!(stop_event.payload["reason"], json!("user_interrupt"));

    let completed_count = stopped_events
        .events
        .iter()
        .filter(|e| e.event_type == "task.completed" && e.payload["task"] == json!(1))
        .count();
    assert_eq!(completed_count, 1, "task 1 must have completed exactly once before the stop");
    assert!(
        !stopped_events.events.iter().any(|e| e.event_type == "task.completed" && e.payload["task"] == json!(2)),
        "task 2 must not have completed before the cancellation landed"
    );

    let last_seq_before_resume = stopped_events.events.iter().map(|e| e.seq).max().unwrap();

    let fast_provider = |_: Option<&str>| Arc::new(ProviderRunner::new("true"));
    let resume_request = base_request(repo_dir.path(), tasks_dir.path(), Arc::clone(&config), Some(run_id.clone()));
    let resumed = Orchestrator::start(resume_request, Arc::clone(&history), Arc::clone(&events)).unwrap();
    assert_eq!(resumed.run_id(), run_id, "resume must keep the same run_id");

    let pr_client = Arc::new(PrClient::new("", "owner", "repo").unwrap());
    let result = resumed.run(pr_client, fast_provider).await;
    assert!(result.is_ok(), "resumed run failed: {result:?}");

    let finished_run = history.get_run(&run_id).unwrap().expect("run row still present");
    assert_eq!(finished_run.status, RunStatus::Completed);
    assert_eq!(finished_run.completed_units, 1);

    let all_events = history
        .get_run_events(&run_id, GetEventsFilter { limit: 1000, ..Default::default() })
        .unwrap();

    let resumed_marker = all_events.events.iter().find(|e| e.event_type == "run.resumed").expect("run.resumed recorded");
    assert_eq!(resumed_marker.payload["resumed_from_seq"], json!(last_seq_before_resume));

    let unit_resumed = all_events.events.iter().find(|e| e.event_type == "unit.resumed").expect("unit.resumed recorded");
    assert_eq!(unit_resumed.payload["completed_tasks"], json!(1));

    let task1_total = all_events
        .events
        .iter()
        .filter(|e| e.event_type == "task.completed" && e.payload["task"] == json!(1))
        .count();
    let task2_total = all_events
        .events
        .iter()
        .filter(|e| e.event_type == "task.completed" && e.payload["task"] == json!(2))
        .count();
    assert_eq!(task1_total, 1, "task 1 must not be redone on resume");
    assert_eq!(task2_total, 1, "task 2 must complete exactly once during resume");

    let seqs: Vec<u64> = all_events.events.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "seq must stay strictly increasing across the stop/resume boundary");
}
