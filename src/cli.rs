//! Command-line surface: `run`, `status`, `resume`, `cleanup`,
//! `next-feature`, `version`. Grounded on `cip999-limmat`'s `main.rs`
//! (`clap::Parser`, a `do_main() -> Result<...>` wrapped by `main()` so
//! error formatting stays under our control) generalized from one
//! flat `Args` struct to a `Subcommand` enum, one variant per command.
//!
//! `run`/`resume` drive an `Orchestrator` directly in this process
//! rather than only through `crate::daemon`'s RPC surface — the daemon
//! exists for long-lived multi-client scenarios (the dashboard, a
//! `status` call from another shell while a run is in flight), but a
//! bare `choo run` needs no separate process to talk to.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::events::EventBus;
use crate::history::{HistoryStore, ListRunsFilter, RunStatus};
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::pr_client::PrClient;
use crate::provider::ProviderRunner;

#[derive(Parser, Debug)]
#[command(author, version, about = "Parallel LLM-driven unit orchestrator", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the config file; defaults to the XDG-resolved location.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover units and drive them to completion.
    Run(RunArgs),
    /// Report the most recent (or in-flight) run's status.
    Status(StatusArgs),
    /// Resume the most recent run for a tasks directory.
    Resume(RunArgs),
    /// Remove worktrees and, optionally, persisted history.
    Cleanup(CleanupArgs),
    /// Rank PRDs under a directory by declared priority.
    NextFeature(NextFeatureArgs),
    /// Print the resolved version and tool paths.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory of units; defaults to the current directory.
    pub tasks_dir: Option<PathBuf>,
    #[arg(short = 'p', long)]
    pub parallelism: Option<usize>,
    #[arg(short = 't', long = "target")]
    pub target: Option<String>,
    #[arg(short = 'n', long)]
    pub dry_run: bool,
    #[arg(long)]
    pub no_pr: bool,
    #[arg(long = "unit")]
    pub unit: Option<String>,
    #[arg(long)]
    pub skip_review: bool,
    #[arg(long)]
    pub provider: Option<String>,
    #[arg(long)]
    pub force_task_provider: Option<String>,
    #[arg(long)]
    pub feature: Option<String>,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    pub tasks_dir: Option<PathBuf>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct CleanupArgs {
    pub tasks_dir: Option<PathBuf>,
    #[arg(long)]
    pub reset_state: bool,
}

#[derive(Parser, Debug)]
pub struct NextFeatureArgs {
    pub prd_dir: Option<PathBuf>,
    #[arg(long)]
    pub explain: bool,
    #[arg(long, default_value_t = 1)]
    pub top: usize,
    #[arg(long)]
    pub json: bool,
}

/// Distinguishes the exit codes spec_full.md's CLI surface documents
/// (0/1/2/130/131) from an ordinary application error, which always
/// exits 1.
pub enum CliError {
    InvalidArgs(String),
    Interrupted,
    Terminated,
    Other(anyhow::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::InvalidArgs(_) => 2,
            CliError::Interrupted => 130,
            CliError::Terminated => 131,
            CliError::Other(_) => 1,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::InvalidArgs(m) => write!(f, "{m}"),
            CliError::Interrupted => write!(f, "interrupted"),
            CliError::Terminated => write!(f, "terminated"),
            CliError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(e)
    }
}

fn load_config(explicit: Option<&PathBuf>) -> anyhow::Result<Config> {
    let path = explicit.cloned().or_else(crate::util::default_config_path);
    match path {
        Some(path) if path.exists() => Config::load(&path),
        _ => Ok(Config::default()),
    }
}

fn history_path() -> PathBuf {
    crate::util::history_db_path()
}

fn tasks_dir_or_cwd(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p),
        None => std::env::current_dir().map_err(Into::into),
    }
}

pub async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Run(args) => run_command(cli.config.as_ref(), args, false).await,
        Command::Resume(args) => run_command(cli.config.as_ref(), args, true).await,
        Command::Status(args) => status_command(args),
        Command::Cleanup(args) => cleanup_command(cli.config.as_ref(), args),
        Command::NextFeature(args) => next_feature_command(cli.config.as_ref(), args),
        Command::Version => version_command(cli.config.as_ref()),
    }
}

async fn run_command(config_path: Option<&PathBuf>, args: RunArgs, resume: bool) -> Result<(), CliError> {
    let mut config = load_config(config_path)?;
    if let Some(parallelism) = args.parallelism {
        config.parallelism = parallelism;
    }
    if let Some(target) = &args.target {
        config.target_branch = target.clone();
    }
    if let Some(feature_id) = &args.feature {
        config.target_branch = format!("{}{}", config.feature.branch_prefix, feature_id);
    }

    let tasks_dir = tasks_dir_or_cwd(args.tasks_dir)?;
    let repo_path = std::env::current_dir().map_err(anyhow::Error::from)?;

    let history = Arc::new(HistoryStore::open(&history_path())?);
    let events = Arc::new(EventBus::new());

    let resume_run_id = if resume {
        let previous = latest_run_for(&history, &tasks_dir)?
            .ok_or_else(|| CliError::InvalidArgs(format!("no previous run found for {tasks_dir:?} to resume")))?;
        Some(previous.id)
    } else {
        None
    };

    let github_token = std::env::var("GITHUB_TOKEN").unwrap_or_default();
    if github_token.is_empty() && !args.no_pr && !args.dry_run {
        return Err(CliError::InvalidArgs("GITHUB_TOKEN must be set unless --no-pr or --dry-run is given".into()));
    }

    let request = RunRequest {
        repo_path: repo_path.clone(),
        tasks_dir,
        config: Arc::new(config.clone()),
        github_token: github_token.clone(),
        github_owner: std::env::var("GITHUB_OWNER").unwrap_or_default(),
        github_repo: std::env::var("GITHUB_REPO").unwrap_or_default(),
        dry_run: args.dry_run,
        unit_filter: args.unit.clone(),
        skip_review: args.skip_review,
        no_pr: args.no_pr,
        resume_run_id,
    };

    let orchestrator = Orchestrator::start(request, Arc::clone(&history), Arc::clone(&events))?;
    println!("run {}", orchestrator.run_id());

    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let pr_client = Arc::new(PrClient::new(github_token, std::env::var("GITHUB_OWNER").unwrap_or_default(), std::env::var("GITHUB_REPO").unwrap_or_default())?);
    let forced_override = args.force_task_provider;
    let runtime_default = args.provider;
    let provider_factory = move |unit_override: Option<&str>| -> Arc<ProviderRunner> {
        Arc::new(ProviderRunner::resolve(&config.provider, forced_override.as_deref(), unit_override, runtime_default.as_deref()))
    };

    orchestrator.run(pr_client, provider_factory).await.map_err(CliError::from)
}

fn latest_run_for(history: &HistoryStore, tasks_dir: &std::path::Path) -> anyhow::Result<Option<crate::history::Run>> {
    let tasks_dir_str = tasks_dir.display().to_string();
    let runs = history.list_runs(ListRunsFilter { limit: 100, ..Default::default() })?;
    Ok(runs.into_iter().find(|r| r.tasks_dir == tasks_dir_str))
}

fn status_command(args: StatusArgs) -> Result<(), CliError> {
    let tasks_dir = tasks_dir_or_cwd(args.tasks_dir)?;
    let history = HistoryStore::open(&history_path())?;
    let run = latest_run_for(&history, &tasks_dir)?
        .ok_or_else(|| CliError::Other(anyhow::anyhow!("no run found for {tasks_dir:?}")))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!(
            "run {} [{}]: {}/{} complete, {} failed, {} blocked",
            run.id,
            run.status.as_str(),
            run.completed_units,
            run.total_units,
            run.failed_units,
            run.blocked_units,
        );
    }
    Ok(())
}

fn cleanup_command(config_path: Option<&PathBuf>, args: CleanupArgs) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let tasks_dir = tasks_dir_or_cwd(args.tasks_dir)?;

    if config.worktree_base.exists() {
        std::fs::remove_dir_all(&config.worktree_base)
            .map_err(|e| anyhow::anyhow!("removing worktree base {:?}: {e}", config.worktree_base))?;
        println!("removed worktree base {:?}", config.worktree_base);
    }

    if args.reset_state {
        let history = HistoryStore::open(&history_path())?;
        if let Some(run) = latest_run_for(&history, &tasks_dir)? {
            history.delete_old_runs(chrono::Utc::now() + chrono::Duration::seconds(1))?;
            println!("reset state for {} and earlier runs", run.id);
        }
    }
    Ok(())
}

fn next_feature_command(config_path: Option<&PathBuf>, args: NextFeatureArgs) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    let prd_dir = args.prd_dir.unwrap_or(config.feature.prd_dir);
    let ranked = crate::feature::discover(&prd_dir)?;
    let top: Vec<_> = ranked.iter().take(args.top.max(1)).collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&top)?);
    } else {
        for candidate in &top {
            println!("{} (priority {}): {}", candidate.id, candidate.priority, candidate.title);
        }
        if args.explain {
            println!("{}", crate::feature::explain(&ranked));
        }
    }
    Ok(())
}

fn version_command(config_path: Option<&PathBuf>) -> Result<(), CliError> {
    let config = load_config(config_path)?;
    println!("choo {}", env!("CARGO_PKG_VERSION"));
    println!("git binary: {}", crate::git::GitOpsOptions::default().git_binary.display());
    println!("provider binary: {}", config.provider_command(&config.provider.r#type).display());
    Ok(())
}
