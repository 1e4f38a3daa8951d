//! Thin client over the PR host's HTTP API: create PRs, read reactions/
//! comments/check-runs, request merges, and derive a review/CI status
//! from them.
//!
//! Grounded on `other_examples/c01d5d39_...git_ops.rs.rs`'s use of
//! `octocrab::Octocrab::builder().personal_token(...)` and
//! `.pulls(owner, repo).create(...)`; the retry/backoff loop is new code
//! built on the same `tokio::time::sleep` primitive the teacher already
//! depends on for its own timing logic.

use std::time::Duration;

use log::warn;
use octocrab::Octocrab;
use rand::Rng;

use crate::error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Approved,
    InReview,
    ChangesRequested,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiStatus {
    Success,
    Pending,
    Failure,
}

#[derive(Debug, Clone)]
pub struct ReviewComment {
    pub body: String,
    pub path: Option<String>,
    pub line: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

pub struct PrClient {
    octocrab: Octocrab,
    owner: String,
    repo: String,
    retry: RetryPolicy,
}

impl PrClient {
    pub fn new(token: impl Into<String>, owner: impl Into<String>, repo: impl Into<String>) -> anyhow::Result<Self> {
        let octocrab = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self {
            octocrab,
            owner: owner.into(),
            repo: repo.into(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn create_pr(
        &self,
        title: &str,
        body: &str,
        head_branch: &str,
        base_branch: &str,
    ) -> Result<u64, HostError> {
        self.with_retries("create_pr", || async {
            let pr = self
                .octocrab
                .pulls(&self.owner, &self.repo)
                .create(title, head_branch, base_branch)
                .body(body)
                .send()
                .await
                .map_err(classify)?;
            Ok(pr.number)
        })
        .await
    }

    pub async fn get_reactions(&self, pr_number: u64) -> Result<Vec<String>, HostError> {
        self.with_retries("get_reactions", || async {
            let route = format!(
                "/repos/{}/{}/issues/{}/reactions",
                self.owner, self.repo, pr_number
            );
            let reactions: Vec<serde_json::Value> =
                self.octocrab.get(route, None::<&()>).await.map_err(classify)?;
            Ok(reactions
                .into_iter()
                .filter_map(|r| r.get("content").and_then(|c| c.as_str()).map(String::from))
                .collect())
        })
        .await
    }

    pub async fn get_review_comments(&self, pr_number: u64) -> Result<Vec<ReviewComment>, HostError> {
        self.with_retries("get_review_comments", || async {
            let comments = self
                .octocrab
                .pulls(&self.owner, &self.repo)
                .list_comments(Some(pr_number))
                .send()
                .await
                .map_err(classify)?;
            Ok(comments
                .items
                .into_iter()
                .map(|c| ReviewComment {
                    body: c.body,
                    path: Some(c.path),
                    line: c.line.map(|l| l as u64),
                })
                .collect())
        })
        .await
    }

    pub async fn get_check_run_aggregate(&self, commit_sha: &str) -> Result<CiStatus, HostError> {
        self.with_retries("get_check_run_aggregate", || async {
            let route = format!(
                "/repos/{}/{}/commits/{}/check-runs",
                self.owner, self.repo, commit_sha
            );
            let response: serde_json::Value =
                self.octocrab.get(route, None::<&()>).await.map_err(classify)?;
            let runs = response
                .get("check_runs")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            Ok(aggregate_check_runs(&runs))
        })
        .await
    }

    pub async fn merge_pr(&self, pr_number: u64) -> Result<(), HostError> {
        self.with_retries("merge_pr", || async {
            self.octocrab
                .pulls(&self.owner, &self.repo)
                .merge(pr_number)
                .send()
                .await
                .map_err(classify)?;
            Ok(())
        })
        .await
    }

    async fn with_retries<T, F, Fut>(&self, op_name: &str, mut f: F) -> Result<T, HostError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, HostError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= self.retry.max_attempts || !e.is_retryable() => {
                    return Err(e);
                }
                Err(e) => {
                    let delay = retry_delay(&self.retry, attempt, &e);
                    warn!("{op_name} failed (attempt {attempt}), retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn retry_delay(policy: &RetryPolicy, attempt: u32, err: &HostError) -> Duration {
    if let HostError::RateLimited {
        retry_after_secs: Some(secs),
        ..
    } = err
    {
        return Duration::from_secs(*secs);
    }
    let exp = policy.base_delay.saturating_mul(1u32 << attempt.min(10));
    let capped = exp.min(policy.max_delay);
    let jitter_frac: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64((capped.as_secs_f64() * jitter_frac).max(0.0))
}

fn classify(err: octocrab::Error) -> HostError {
    match &err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            if status == 429 {
                HostError::RateLimited {
                    retry_after_secs: None,
                    message: source.message.clone(),
                }
            } else if status == 404 {
                HostError::NotFound(source.message.clone())
            } else if status == 409 {
                HostError::Conflict(source.message.clone())
            } else if (500..600).contains(&status) {
                HostError::Transient(source.message.clone())
            } else {
                HostError::Permanent {
                    status,
                    message: source.message.clone(),
                }
            }
        }
        other => HostError::Transient(other.to_string()),
    }
}

/// Derives review status from reactions and unresolved comments, per the
/// precedence approved > in_review > changes_requested > pending.
pub fn derive_review_status(reactions: &[String], has_unresolved_comments: bool) -> ReviewStatus {
    if reactions.iter().any(|r| r == "+1") {
        ReviewStatus::Approved
    } else if reactions.iter().any(|r| r == "eyes") {
        ReviewStatus::InReview
    } else if has_unresolved_comments {
        ReviewStatus::ChangesRequested
    } else {
        ReviewStatus::Pending
    }
}

fn aggregate_check_runs(runs: &[serde_json::Value]) -> CiStatus {
    let conclusion = |r: &serde_json::Value| r.get("conclusion").and_then(move |v| v.as_str());
    let status = |r: &serde_json::Value| r.get("status").and_then(move |v| v.as_str());

    if runs.iter().any(|r| conclusion(r) == Some("failure")) {
        CiStatus::Failure
    } else if runs.iter().any(|r| status(r) != Some("completed")) {
        CiStatus::Pending
    } else {
        CiStatus::Success
    }
}
