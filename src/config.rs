//! User-level configuration file format, loaded from the path resolved by
//! `crate::util::default_config_path` (XDG-style, via the teacher's
//! `directories` dependency) or passed explicitly. Kept in the teacher's
//! style: `serde`+`toml` deserialization, `schemars` for a machine
//! readable schema, every optional field backed by an explicit default
//! function rather than `Option` so the rest of the crate can read
//! `Config` fields unconditionally.

use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_type")]
    pub r#type: String,
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ProviderOverride>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            r#type: default_provider_type(),
            providers: Default::default(),
        }
    }
}

fn default_provider_type() -> String {
    "claude".to_string()
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProviderOverride {
    pub command: PathBuf,
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ReviewConfig {
    #[serde(default = "default_poll_interval_s", rename = "poll_interval")]
    pub poll_interval_s: u64,
    #[serde(default = "default_true")]
    pub require_ci: bool,
    #[serde(default = "default_review_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_review_attempts")]
    pub max_attempts: u32,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: default_poll_interval_s(),
            require_ci: default_true(),
            timeout_s: default_review_timeout_s(),
            max_attempts: default_max_review_attempts(),
        }
    }
}

impl ReviewConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_s)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

fn default_poll_interval_s() -> u64 {
    30
}

fn default_review_timeout_s() -> u64 {
    2 * 60 * 60
}

fn default_max_review_attempts() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiply")]
    pub backoff_multiply: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiply: default_backoff_multiply(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiply() -> f64 {
    2.0
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    #[serde(default = "default_prd_dir")]
    pub prd_dir: PathBuf,
    #[serde(default = "default_specs_dir")]
    pub specs_dir: PathBuf,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            prd_dir: default_prd_dir(),
            specs_dir: default_specs_dir(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

fn default_prd_dir() -> PathBuf {
    PathBuf::from("prds")
}

fn default_specs_dir() -> PathBuf {
    PathBuf::from("specs")
}

fn default_branch_prefix() -> String {
    "feature/".to_string()
}

#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

impl HistoryConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

fn default_retention_days() -> u64 {
    90
}

/// Top-level user-level configuration file, usually
/// `~/.config/choo/config.toml`.
#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_worktree_base")]
    pub worktree_base: PathBuf,
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub feature: FeatureConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            worktree_base: default_worktree_base(),
            target_branch: default_target_branch(),
            provider: ProviderConfig::default(),
            review: ReviewConfig::default(),
            retry: RetryConfig::default(),
            feature: FeatureConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_worktree_base() -> PathBuf {
    PathBuf::from(".choo/worktrees")
}

fn default_target_branch() -> String {
    "main".to_string()
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {path:?}: {e}"))?;
        toml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing config {path:?}: {e}"))
    }

    pub fn provider_command(&self, name: &str) -> PathBuf {
        self.provider
            .providers
            .get(name)
            .map(|o| o.command.clone())
            .unwrap_or_else(|| PathBuf::from(name))
    }
}
