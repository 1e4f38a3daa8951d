//! Typed error enums for the seams spec_full.md calls out as needing
//! distinguishable error kinds (construction/runtime checks, graph
//! validation, provider/host/merge/RPC classification). Everywhere else
//! propagates via `anyhow::Result`, same as the teacher.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from constructing or operating a [`crate::git::GitOps`].
#[derive(Debug, Error)]
pub enum GitOpsError {
    #[error("path must not be empty")]
    EmptyPath,
    #[error("path {0:?} is not absolute")]
    RelativePath(PathBuf),
    #[error("path {0:?} could not be canonicalized: {1}")]
    NonCanonical(PathBuf, std::io::Error),
    #[error("path {0:?} does not exist or is not a directory")]
    NotADirectory(PathBuf),
    #[error("{0:?} is not inside a git repository")]
    NotARepo(PathBuf),
    #[error("path {given:?} does not match git toplevel {toplevel:?}")]
    PathMismatch { given: PathBuf, toplevel: PathBuf },
    #[error("{0:?} is the main repository checkout, but AllowRepoRoot is false")]
    RepoRootNotAllowed(PathBuf),
    #[error("{path:?} is not inside worktree base {base:?}")]
    OutsideWorktreeBase { path: PathBuf, base: PathBuf },
    #[error("runtime check failed: {0:?} no longer resolves to the path this GitOps was constructed with")]
    RuntimeMismatch(PathBuf),
    #[error("current branch {current:?} does not match expected branch {expected:?}")]
    UnexpectedBranch { current: String, expected: String },
    #[error("refusing to write to protected branch {0:?}")]
    ProtectedBranch(String),
    #[error("operation {0:?} requires AllowDestructive=true")]
    DestructiveNotAllowed(&'static str),
    #[error("git subprocess failed: {0}")]
    Subprocess(#[from] anyhow::Error),
}

/// Errors constructing a [`crate::dag::Dag`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DagError<I> {
    #[error("duplicate unit id {0:?}")]
    DuplicateId(I),
    #[error("{parent:?} depends on unknown unit {child:?}")]
    UnknownDependency { parent: I, child: I },
    #[error("dependency cycle detected, containing {0:?}")]
    Cycle(I),
}

/// Errors from a [`crate::scheduler::Scheduler`] state transition.
#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum SchedulerError {
    #[error("unit {0:?} is not known to this scheduler")]
    UnknownUnit(String),
    #[error("unit {unit:?} cannot transition from {from:?} to {to:?}")]
    InvalidTransition {
        unit: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Failure modes for a [`crate::provider::ProviderRunner::invoke`] call.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {provider:?} exited with status {code}")]
    NonZeroExit { provider: String, code: i32 },
    #[error("provider invocation was cancelled")]
    Cancelled,
    #[error("failed to spawn provider subprocess: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Classification of errors from the PR host's HTTP API, used to decide
/// whether [`crate::pr_client::PrClient`] retries.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("transient host error: {0}")]
    Transient(String),
    #[error("permanent host error ({status}): {message}")]
    Permanent { status: u16, message: String },
    #[error("rate limited, retry after {retry_after_secs:?}s: {message}")]
    RateLimited {
        retry_after_secs: Option<u64>,
        message: String,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl HostError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HostError::Transient(_) | HostError::RateLimited { .. })
    }
}

/// Failure modes from the rebase-with-conflict-resolution merge phase.
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("rebase conflicts unresolved after {attempts} attempts")]
    ConflictsUnresolvedAfterAttempts { attempts: u32 },
    #[error("merge precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("target branch {0:?} is protected against direct push")]
    ProtectedTarget(String),
}

/// Daemon RPC status codes, per spec_full.md §4.9's status code mapping.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum RpcErrorKind {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("not found")]
    NotFound,
    #[error("failed precondition")]
    FailedPrecondition,
    #[error("unavailable")]
    Unavailable,
    #[error("internal")]
    Internal,
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::FailedPrecondition, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Internal, message)
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        RpcError::internal(e.to_string())
    }
}
