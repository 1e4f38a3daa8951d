//! Path-bound, branch-guarded, destructive-op-gated wrapper over the git
//! subprocess. `GitOps` is the only thing in this crate allowed to invoke
//! `git`; everything else (`crate::worker`, `crate::orchestrator`) talks to
//! a repository exclusively through it.
//!
//! The subprocess plumbing (`Hash`/`CommitHash`/`TreeHash` newtypes, the
//! `Worktree` trait, `PersistentWorktree`, the `COMMAND_SEM`
//! file-descriptor guard) is carried over from the teacher's own `git.rs`.
//! `GitOps` is new code layered on top: it owns the construction validation
//! chain, the per-repo write mutex registry, the branch guard, and the
//! audit log spec_full.md §4.1 requires.

use core::fmt;
use core::fmt::{Debug, Display};
use std::ffi::OsStr;
use std::ops::Deref;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::process::{self, Command as SyncCommand};
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use std::io;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::GitOpsError;

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Hash(String);

impl Hash {
    // Infallible: having a Hash doesn't guarantee the ID refers to an
    // object in an actual repo, and that can't be enforced going forward
    // either, so callers must handle errors at every use site.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn abbrev(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl AsRef<OsStr> for Hash {
    fn as_ref(&self) -> &OsStr {
        OsStr::from_bytes(self.0.as_bytes())
    }
}

impl AsRef<str> for Hash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(Hash);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }
}

impl From<CommitHash> for Hash {
    fn from(h: CommitHash) -> Hash {
        h.0
    }
}

impl Deref for CommitHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct TreeHash(Hash);

impl TreeHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Hash::new(s))
    }
}

impl Deref for TreeHash {
    type Target = Hash;

    fn deref(&self) -> &Hash {
        &self.0
    }
}

impl From<TreeHash> for Hash {
    fn from(h: TreeHash) -> Hash {
        h.0
    }
}

impl AsRef<OsStr> for TreeHash {
    fn as_ref(&self) -> &OsStr {
        self.0.as_ref()
    }
}

impl Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub hash: CommitHash,
    pub tree: TreeHash,
}

impl From<Commit> for CommitHash {
    fn from(val: Commit) -> Self {
        val.hash
    }
}

/// Worktree represents a git tree, which might be the "main" worktree (in
/// which case it's better thought of as a repo root) or a linked one.
#[derive(Debug)]
pub struct PersistentWorktree {
    pub path: PathBuf,
    pub git_binary: PathBuf,
}

impl Worktree for PersistentWorktree {
    fn path(&self) -> &Path {
        &self.path
    }

    fn git_binary(&self) -> &Path {
        &self.git_binary
    }
}

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

/// Wrapper for a Command that holds a semaphore permit for as long as the
/// process exists, to avoid running into file descriptor exhaustion under
/// high worker concurrency.
#[derive(Debug)]
struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.arg(arg);
        self
    }

    fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut GitCommand {
        self.command.args(args);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        let output = self.command.output().await.context("spawning git")?;
        if !output.status.success() {
            bail!(
                "git exited with {:?}, stderr:\n{}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(output)
    }

    async fn output(&mut self) -> io::Result<process::Output> {
        self.command.output().await
    }

    fn env(&mut self, key: &str, value: &str) -> &mut GitCommand {
        self.command.env(key, value);
        self
    }
}

// Traits can't have private methods; this is a workaround so the `git`
// helper (which returns a type we don't want public) can live on the
// public Worktree trait.
trait WorktreePriv: Worktree {
    fn git<'a, I, S>(&'a self, args: I) -> futures::future::BoxFuture<'a, GitCommand>
    where
        I: IntoIterator<Item = S> + Send + 'a,
        S: AsRef<OsStr>,
    {
        use futures::FutureExt as _;
        (async {
            let mut cmd = Command::new(self.git_binary());
            cmd.current_dir(self.path());
            cmd.args(args);
            cmd.process_group(0);
            GitCommand {
                _permit: COMMAND_SEM.acquire().await.unwrap(),
                command: cmd,
            }
        })
        .boxed()
    }
}

impl<W: Worktree + ?Sized> WorktreePriv for W {}

pub trait Worktree: Debug + Sync {
    fn path(&self) -> &Path;
    fn git_binary(&self) -> &Path;

    async fn lookup_git_dir(&self, rev_parse_arg: &str) -> anyhow::Result<PathBuf> {
        let output = self
            .git(["rev-parse", rev_parse_arg])
            .await
            .execute()
            .await
            .map_err(|e| anyhow!("'git rev-parse {rev_parse_arg}' failed: {e}"))?;
        let mut bytes = output.stdout;
        while bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        Ok(OsStr::from_bytes(&bytes).into())
    }

    async fn git_common_dir(&self) -> anyhow::Result<PathBuf> {
        self.lookup_git_dir("--git-common-dir").await
    }

    async fn git_dir(&self) -> anyhow::Result<PathBuf> {
        self.lookup_git_dir("--absolute-git-dir").await
    }

    async fn toplevel(&self) -> anyhow::Result<PathBuf> {
        self.lookup_git_dir("--show-toplevel").await
    }

    async fn current_branch(&self) -> anyhow::Result<Option<String>> {
        let output = self
            .git(["branch", "--show-current"])
            .await
            .execute()
            .await
            .context("'git branch --show-current' failed")?;
        let name = String::from_utf8(output.stdout)
            .context("non-utf8 branch name")?
            .trim()
            .to_string();
        Ok(if name.is_empty() { None } else { Some(name) })
    }

    async fn branch_exists(&self, name: &str) -> anyhow::Result<bool> {
        for candidate in [
            format!("refs/heads/{name}"),
            format!("refs/remotes/origin/{name}"),
        ] {
            let output = self
                .git(["show-ref", "--verify", "--quiet"])
                .await
                .arg(&candidate)
                .output()
                .await
                .context("'git show-ref' failed")?;
            if output.status.success() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn status(&self) -> anyhow::Result<Status> {
        let output = self
            .git(["status", "--porcelain=v1"])
            .await
            .execute()
            .await
            .context("'git status' failed")?;
        Ok(Status::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn diff(&self, range_spec: &str) -> anyhow::Result<String> {
        let output = self
            .git(["diff"])
            .await
            .arg(range_spec)
            .execute()
            .await
            .context("'git diff' failed")?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn log(&self, range_spec: &str, format_spec: &str) -> anyhow::Result<String> {
        let mut format_arg = std::ffi::OsString::from("--format=");
        format_arg.push(format_spec);
        let output = self
            .git(["log"])
            .await
            .arg(&format_arg)
            .arg(range_spec)
            .execute()
            .await
            .context(format!("'git log' failed for {range_spec:?}"))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn fetch(&self, remote: &str, refspec: Option<&str>) -> anyhow::Result<()> {
        let mut cmd = self.git(["fetch", remote]).await;
        if let Some(refspec) = refspec {
            cmd.arg(refspec);
        }
        cmd.execute().await.context("'git fetch' failed")?;
        Ok(())
    }

    async fn rev_parse<S>(&self, rev_spec: S) -> anyhow::Result<Option<Commit>>
    where
        S: AsRef<OsStr>,
    {
        let mut cmd = self.git(["log", "-n1", "--format=%H %T"]).await;
        let cmd = cmd.arg(rev_spec);
        let output = cmd.output().await.context("failed to run 'git log -n1'")?;
        let exit_code = output.status.code().context("git was killed by a signal")?;
        if exit_code == 128 {
            return Ok(None);
        }
        if exit_code != 0 {
            bail!("'git log -n1' failed with code {exit_code}");
        }
        let out_string =
            String::from_utf8(output.stdout).context("reading git rev-parse output")?;
        let parts: Vec<&str> = out_string.trim().splitn(2, " ").collect();
        if parts.len() != 2 {
            bail!("failed to parse rev-parse output {out_string:?}");
        }
        Ok(Some(Commit {
            hash: CommitHash::new(parts[0]),
            tree: TreeHash::new(parts[1]),
        }))
    }
}

/// Result of parsing `git status --porcelain=v1`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
    pub conflicted: Vec<String>,
}

impl Status {
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.modified.is_empty()
            && self.untracked.is_empty()
            && self.conflicted.is_empty()
    }

    fn parse(porcelain: &str) -> Self {
        let mut status = Status::default();
        for line in porcelain.lines() {
            if line.len() < 3 {
                continue;
            }
            let (x, y) = (line.as_bytes()[0] as char, line.as_bytes()[1] as char);
            let path = line[3..].to_string();
            if x == 'U' || y == 'U' || (x == 'A' && y == 'A') || (x == 'D' && y == 'D') {
                status.conflicted.push(path);
            } else if x == '?' && y == '?' {
                status.untracked.push(path);
            } else {
                if x != ' ' {
                    status.staged.push(path.clone());
                }
                if y != ' ' {
                    status.modified.push(path);
                }
            }
        }
        status
    }
}

/// Restricts which branches a [`GitOps`] may write to.
#[derive(Debug, Clone, Default)]
pub struct BranchGuard {
    pub expected_branch: Option<String>,
    pub allowed_prefixes: Option<Vec<String>>,
    pub protected_branches: Vec<String>,
}

impl BranchGuard {
    pub fn protecting_defaults() -> Self {
        Self {
            expected_branch: None,
            allowed_prefixes: None,
            protected_branches: vec!["main".to_string(), "master".to_string()],
        }
    }

    fn check(&self, current: &str) -> Result<(), GitOpsError> {
        if self.protected_branches.iter().any(|b| b == current) {
            return Err(GitOpsError::ProtectedBranch(current.to_string()));
        }
        if let Some(expected) = &self.expected_branch {
            if expected != current {
                return Err(GitOpsError::UnexpectedBranch {
                    current: current.to_string(),
                    expected: expected.clone(),
                });
            }
        }
        if let Some(prefixes) = &self.allowed_prefixes {
            if !prefixes.iter().any(|p| current.starts_with(p.as_str())) {
                return Err(GitOpsError::UnexpectedBranch {
                    current: current.to_string(),
                    expected: format!("one of prefixes {prefixes:?}"),
                });
            }
        }
        Ok(())
    }
}

/// One structured entry per GitOps operation, handed to whatever
/// [`AuditLogger`] is configured.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub time: DateTime<Utc>,
    pub op: &'static str,
    pub repo_path: PathBuf,
    pub branch: Option<String>,
    pub args: Vec<String>,
    pub checks_passed: bool,
    pub failure_reason: Option<String>,
    pub duration_ms: u64,
}

pub trait AuditLogger: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Discards every entry; the default when no audit sink is configured.
#[derive(Default)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn record(&self, _entry: AuditEntry) {}
}

/// Records entries in order, for tests and for `choo status` introspection.
#[derive(Default)]
pub struct CollectingAuditLogger {
    entries: Mutex<Vec<AuditEntry>>,
}

impl AuditLogger for CollectingAuditLogger {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}

impl CollectingAuditLogger {
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

/// Process-wide registry of per-repo write locks, keyed by canonical
/// repo-root path. `GitOps` instances pointed at the same repo (e.g. the
/// repo root and one of its worktrees) share a lock through this registry,
/// serializing the operations spec_full.md §4.1 names as write-acquiring.
static WRITE_LOCKS: LazyLock<Mutex<std::collections::HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(std::collections::HashMap::new()));

fn write_lock_for(repo_root: &Path) -> Arc<tokio::sync::Mutex<()>> {
    WRITE_LOCKS
        .lock()
        .entry(repo_root.to_path_buf())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Construction options for [`GitOps`].
pub struct GitOpsOptions {
    pub worktree_base: Option<PathBuf>,
    pub allow_repo_root: bool,
    pub allow_destructive: bool,
    pub branch_guard: Option<BranchGuard>,
    pub audit: Arc<dyn AuditLogger>,
    pub git_binary: PathBuf,
}

impl Default for GitOpsOptions {
    fn default() -> Self {
        Self {
            worktree_base: None,
            allow_repo_root: true,
            allow_destructive: false,
            branch_guard: None,
            audit: Arc::new(NullAuditLogger),
            git_binary: PathBuf::from("git"),
        }
    }
}

/// Safe, path-bound wrapper over `git`. Construction validates the path per
/// spec_full.md §4.1's eight-step contract; every operation re-validates
/// steps 4-6 before running, so a repo deleted or replaced underneath a live
/// `GitOps` fails loudly instead of silently operating on the wrong tree.
#[derive(Debug)]
pub struct GitOps {
    worktree: PersistentWorktree,
    canonical_path: PathBuf,
    allow_destructive: bool,
    branch_guard: Option<BranchGuard>,
    audit: Arc<dyn AuditLogger>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl GitOps {
    pub async fn new(path: &Path, opts: GitOpsOptions) -> Result<Self, GitOpsError> {
        if path.as_os_str().is_empty() {
            return Err(GitOpsError::EmptyPath);
        }
        if !path.is_absolute() {
            return Err(GitOpsError::RelativePath(path.to_path_buf()));
        }
        let canonical = path
            .canonicalize()
            .map_err(|e| GitOpsError::NonCanonical(path.to_path_buf(), e))?;
        if !canonical.is_dir() {
            return Err(GitOpsError::NotADirectory(canonical));
        }
        let probe = PersistentWorktree {
            path: canonical.clone(),
            git_binary: opts.git_binary.clone(),
        };
        let toplevel = probe
            .toplevel()
            .await
            .map_err(|_| GitOpsError::NotARepo(canonical.clone()))?;
        let toplevel = toplevel
            .canonicalize()
            .map_err(|e| GitOpsError::NonCanonical(toplevel, e))?;
        if toplevel != canonical {
            return Err(GitOpsError::PathMismatch {
                given: canonical,
                toplevel,
            });
        }
        if !opts.allow_repo_root {
            let git_dir = probe
                .git_dir()
                .await
                .map_err(|_| GitOpsError::NotARepo(canonical.clone()))?;
            let common_dir = probe
                .git_common_dir()
                .await
                .map_err(|_| GitOpsError::NotARepo(canonical.clone()))?;
            if git_dir == common_dir {
                return Err(GitOpsError::RepoRootNotAllowed(canonical));
            }
            if let Some(base) = &opts.worktree_base {
                let base = base
                    .canonicalize()
                    .map_err(|e| GitOpsError::NonCanonical(base.clone(), e))?;
                if !canonical.starts_with(&base) {
                    return Err(GitOpsError::OutsideWorktreeBase {
                        path: canonical,
                        base,
                    });
                }
            }
        }
        let write_lock = write_lock_for(&canonical);
        Ok(Self {
            worktree: probe,
            canonical_path: canonical,
            allow_destructive: opts.allow_destructive,
            branch_guard: opts.branch_guard,
            audit: opts.audit,
            write_lock,
        })
    }

    /// "Worktree" flavor: repo root disallowed, destructive ops allowed,
    /// pinned to `worktree_base`. What `crate::worker` constructs per unit.
    pub async fn new_worktree(
        path: &Path,
        worktree_base: PathBuf,
        audit: Arc<dyn AuditLogger>,
    ) -> Result<Self, GitOpsError> {
        Self::new(
            path,
            GitOpsOptions {
                worktree_base: Some(worktree_base),
                allow_repo_root: false,
                allow_destructive: true,
                branch_guard: None,
                audit,
                ..Default::default()
            },
        )
        .await
    }

    /// "Repo-root" flavor: repo root required, destructive ops disallowed,
    /// branch guard optional. What `crate::orchestrator` constructs for the
    /// serialized merge phase.
    pub async fn new_repo_root(
        path: &Path,
        branch_guard: Option<BranchGuard>,
        audit: Arc<dyn AuditLogger>,
    ) -> Result<Self, GitOpsError> {
        Self::new(
            path,
            GitOpsOptions {
                worktree_base: None,
                allow_repo_root: true,
                allow_destructive: false,
                branch_guard,
                audit,
                ..Default::default()
            },
        )
        .await
    }

    pub fn path(&self) -> &Path {
        &self.canonical_path
    }

    async fn revalidate(&self) -> Result<(), GitOpsError> {
        if !self.canonical_path.is_dir() {
            return Err(GitOpsError::RuntimeMismatch(self.canonical_path.clone()));
        }
        let toplevel = self
            .worktree
            .toplevel()
            .await
            .map_err(|_| GitOpsError::RuntimeMismatch(self.canonical_path.clone()))?;
        let toplevel = toplevel
            .canonicalize()
            .map_err(|_| GitOpsError::RuntimeMismatch(self.canonical_path.clone()))?;
        if toplevel != self.canonical_path {
            return Err(GitOpsError::RuntimeMismatch(self.canonical_path.clone()));
        }
        Ok(())
    }

    fn audit(
        &self,
        op: &'static str,
        branch: Option<String>,
        args: Vec<String>,
        started: Instant,
        checks_passed: bool,
        failure_reason: Option<String>,
    ) {
        self.audit.record(AuditEntry {
            time: Utc::now(),
            op,
            repo_path: self.canonical_path.clone(),
            branch,
            args,
            checks_passed,
            failure_reason,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn require_destructive(&self, op: &'static str) -> Result<(), GitOpsError> {
        if !self.allow_destructive {
            return Err(GitOpsError::DestructiveNotAllowed(op));
        }
        Ok(())
    }

    // Shared pre-write machinery: re-validation, write-lock acquisition,
    // and branch-guard check. Returns the current branch (if any) and the
    // held guard, so the caller runs the actual git command while still
    // holding the lock.
    async fn begin_write(
        &self,
        op: &'static str,
        args: &[String],
    ) -> Result<(Option<String>, tokio::sync::MutexGuard<'_, ()>), GitOpsError> {
        let started = Instant::now();
        if let Err(e) = self.revalidate().await {
            self.audit(op, None, args.to_vec(), started, false, Some(e.to_string()));
            return Err(e);
        }
        let guard = self.write_lock.lock().await;
        let branch = self.worktree.current_branch().await.ok().flatten();
        if let Some(bg) = &self.branch_guard {
            if let Some(current) = &branch {
                if let Err(e) = bg.check(current) {
                    self.audit(op, branch.clone(), args.to_vec(), started, false, Some(e.to_string()));
                    return Err(e);
                }
            }
        }
        Ok((branch, guard))
    }

    async fn run_write(
        &self,
        op: &'static str,
        args: Vec<String>,
        git_args: Vec<String>,
    ) -> Result<(), GitOpsError> {
        let started = Instant::now();
        let (branch, _guard) = self.begin_write(op, &args).await?;
        match self.worktree.git(git_args).await.execute().await {
            Ok(_) => {
                self.audit(op, branch, args, started, true, None);
                Ok(())
            }
            Err(e) => {
                self.audit(op, branch, args, started, false, Some(e.to_string()));
                Err(GitOpsError::Subprocess(e))
            }
        }
    }

    pub async fn status(&self) -> Result<Status, GitOpsError> {
        self.revalidate().await?;
        self.worktree.status().await.map_err(GitOpsError::Subprocess)
    }

    pub async fn current_branch(&self) -> Result<Option<String>, GitOpsError> {
        self.revalidate().await?;
        self.worktree
            .current_branch()
            .await
            .map_err(GitOpsError::Subprocess)
    }

    pub async fn branch_exists(&self, name: &str) -> Result<bool, GitOpsError> {
        self.revalidate().await?;
        self.worktree
            .branch_exists(name)
            .await
            .map_err(GitOpsError::Subprocess)
    }

    pub async fn diff(&self, range_spec: &str) -> Result<String, GitOpsError> {
        self.revalidate().await?;
        self.worktree.diff(range_spec).await.map_err(GitOpsError::Subprocess)
    }

    pub async fn log(&self, range_spec: &str, format_spec: &str) -> Result<String, GitOpsError> {
        self.revalidate().await?;
        self.worktree
            .log(range_spec, format_spec)
            .await
            .map_err(GitOpsError::Subprocess)
    }

    pub async fn rev_parse(&self, rev_spec: &str) -> Result<Option<Commit>, GitOpsError> {
        self.revalidate().await?;
        self.worktree
            .rev_parse(rev_spec)
            .await
            .map_err(GitOpsError::Subprocess)
    }

    pub async fn add(&self, paths: &[String]) -> Result<(), GitOpsError> {
        self.revalidate().await?;
        let mut git_args = vec!["add".to_string()];
        git_args.extend(paths.iter().cloned());
        self.worktree
            .git(git_args)
            .await
            .execute()
            .await
            .map(|_| ())
            .map_err(GitOpsError::Subprocess)
    }

    pub async fn add_all(&self) -> Result<(), GitOpsError> {
        self.revalidate().await?;
        self.worktree
            .git(["add", "-A"])
            .await
            .execute()
            .await
            .map(|_| ())
            .map_err(GitOpsError::Subprocess)
    }

    pub async fn checkout_branch(&self, branch: &str) -> Result<(), GitOpsError> {
        self.run_write(
            "checkout_branch",
            vec![branch.to_string()],
            vec!["checkout".to_string(), branch.to_string()],
        )
        .await
    }

    /// Deletes a local branch. Used by `crate::orchestrator` to drain a
    /// run's deferred pending-delete list once the run finishes.
    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitOpsError> {
        self.run_write(
            "delete_branch",
            vec![branch.to_string()],
            vec!["branch".to_string(), "-D".to_string(), branch.to_string()],
        )
        .await
    }

    pub async fn checkout_files(&self, paths: &[String]) -> Result<(), GitOpsError> {
        self.require_destructive("checkout_files")?;
        let mut git_args = vec!["checkout".to_string(), "--".to_string()];
        git_args.extend(paths.iter().cloned());
        self.run_write("checkout_files", paths.to_vec(), git_args).await
    }

    pub async fn reset(&self, paths: &[String]) -> Result<(), GitOpsError> {
        let mut git_args = vec!["reset".to_string()];
        git_args.extend(paths.iter().cloned());
        self.run_write("reset", paths.to_vec(), git_args).await
    }

    pub async fn reset_hard(&self, rev: &str) -> Result<(), GitOpsError> {
        self.require_destructive("reset_hard")?;
        self.run_write(
            "reset_hard",
            vec![rev.to_string()],
            vec!["reset".to_string(), "--hard".to_string(), rev.to_string()],
        )
        .await
    }

    pub async fn clean(&self, opts: &CleanOptions) -> Result<(), GitOpsError> {
        self.require_destructive("clean")?;
        let mut git_args = vec!["clean".to_string(), "-f".to_string()];
        if opts.directories {
            git_args.push("-d".to_string());
        }
        if opts.ignored_only {
            git_args.push("-X".to_string());
        } else if opts.ignored_too {
            git_args.push("-x".to_string());
        }
        self.run_write("clean", vec![], git_args).await
    }

    pub async fn commit(&self, message: &str, opts: &CommitOptions) -> Result<(), GitOpsError> {
        let mut git_args = vec!["commit".to_string(), "-m".to_string(), message.to_string()];
        if opts.no_verify {
            git_args.push("--no-verify".to_string());
        }
        if opts.allow_empty {
            git_args.push("--allow-empty".to_string());
        }
        if let Some(author) = &opts.author {
            git_args.push("--author".to_string());
            git_args.push(author.clone());
        }
        self.run_write("commit", vec![message.to_string()], git_args).await
    }

    pub async fn fetch(&self, remote: &str, refspec: Option<&str>) -> Result<(), GitOpsError> {
        self.revalidate().await?;
        self.worktree
            .fetch(remote, refspec)
            .await
            .map_err(GitOpsError::Subprocess)
    }

    pub async fn push(&self, remote: &str, refspec: &str, opts: &PushOptions) -> Result<(), GitOpsError> {
        if opts.force || opts.force_with_lease {
            self.require_destructive("push_force")?;
        }
        let mut git_args = vec!["push".to_string()];
        if opts.set_upstream {
            git_args.push("--set-upstream".to_string());
        }
        if opts.force_with_lease {
            git_args.push("--force-with-lease".to_string());
        } else if opts.force {
            git_args.push("--force".to_string());
        }
        git_args.push(remote.to_string());
        git_args.push(refspec.to_string());
        self.run_write("push", vec![remote.to_string(), refspec.to_string()], git_args)
            .await
    }

    pub async fn rebase_onto(&self, target: &str) -> Result<RebaseOutcome, GitOpsError> {
        self.revalidate().await?;
        let output = self
            .worktree
            .git(["rebase"])
            .await
            .arg(target)
            .output()
            .await
            .map_err(|e| GitOpsError::Subprocess(e.into()))?;
        if output.status.success() {
            return Ok(RebaseOutcome::Succeeded);
        }
        let status = self.status().await?;
        if !status.conflicted.is_empty() {
            return Ok(RebaseOutcome::Conflicted(status.conflicted));
        }
        Err(GitOpsError::Subprocess(anyhow!(
            "'git rebase {target}' failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }

    pub async fn rebase_continue(&self) -> Result<RebaseOutcome, GitOpsError> {
        self.revalidate().await?;
        let output = self
            .worktree
            .git(["rebase", "--continue"])
            .await
            .output()
            .await
            .map_err(|e| GitOpsError::Subprocess(e.into()))?;
        if output.status.success() {
            return Ok(RebaseOutcome::Succeeded);
        }
        let status = self.status().await?;
        if !status.conflicted.is_empty() {
            return Ok(RebaseOutcome::Conflicted(status.conflicted));
        }
        Err(GitOpsError::Subprocess(anyhow!(
            "'git rebase --continue' failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }

    pub async fn rebase_abort(&self) -> Result<(), GitOpsError> {
        self.revalidate().await?;
        self.worktree
            .git(["rebase", "--abort"])
            .await
            .execute()
            .await
            .map(|_| ())
            .map_err(GitOpsError::Subprocess)
    }

    pub async fn merge(&self, refs: &[String], opts: &MergeOptions) -> Result<(), GitOpsError> {
        let mut git_args = vec!["merge".to_string()];
        if opts.ff_only {
            git_args.push("--ff-only".to_string());
        }
        if opts.no_ff {
            git_args.push("--no-ff".to_string());
        }
        if opts.no_commit {
            git_args.push("--no-commit".to_string());
        }
        if let Some(m) = &opts.message {
            git_args.push("-m".to_string());
            git_args.push(m.clone());
        }
        git_args.extend(refs.iter().cloned());
        self.run_write("merge", refs.to_vec(), git_args).await
    }

    pub async fn merge_abort(&self) -> Result<(), GitOpsError> {
        self.run_write("merge_abort", vec![], vec!["merge".to_string(), "--abort".to_string()])
            .await
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    pub directories: bool,
    pub ignored_only: bool,
    pub ignored_too: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub ff_only: bool,
    pub no_ff: bool,
    pub no_commit: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub set_upstream: bool,
    pub force: bool,
    pub force_with_lease: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub no_verify: bool,
    pub allow_empty: bool,
    pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RebaseOutcome {
    Succeeded,
    Conflicted(Vec<String>),
}


#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use tempfile::TempDir;

    use super::test_utils::{TempRepo, WorktreeExt as _};
    use super::*;
    use crate::test_utils::some_time;

    #[tokio::test]
    async fn test_new_gitdir_notgit() {
        let tmp_dir = TempDir::new().expect("couldn't make tempdir");
        let wt = PersistentWorktree {
            path: tmp_dir.path().to_path_buf(),
            git_binary: PathBuf::from("/usr/bin/git"),
        };
        assert!(
            wt.git_common_dir().await.is_err(),
            "opening repo with no .git didn't fail"
        );
    }

    #[tokio::test]
    async fn test_new_gitdir_file_notgit() {
        let tmp_dir = TempDir::new().expect("couldn't make tempdir");
        {
            let mut bogus_git_file =
                File::create(tmp_dir.path().join(".git")).expect("couldn't create .git");
            write!(bogus_git_file, "no no no").expect("couldn't write .git");
        }
        let wt = PersistentWorktree {
            path: tmp_dir.path().to_path_buf(),
            git_binary: PathBuf::from("/usr/bin/git"),
        };
        assert!(
            wt.git_common_dir().await.is_err(),
            "opening repo with bogus .git file didn't fail"
        );
    }

    #[tokio::test]
    async fn empty_path_is_rejected_before_spawning_git() {
        let err = GitOps::new(Path::new(""), GitOpsOptions::default())
            .await
            .expect_err("empty path should be rejected");
        assert!(matches!(err, GitOpsError::EmptyPath));
    }

    #[tokio::test]
    async fn relative_path_is_rejected() {
        let err = GitOps::new(Path::new("relative/path"), GitOpsOptions::default())
            .await
            .expect_err("relative path should be rejected");
        assert!(matches!(err, GitOpsError::RelativePath(_)));
    }

    #[tokio::test]
    async fn repo_root_flavor_opens_toplevel() {
        let repo = TempRepo::new().await.unwrap();
        repo.commit("1", some_time()).await.unwrap();
        let ops = GitOps::new_repo_root(repo.path(), None, Arc::new(NullAuditLogger))
            .await
            .unwrap();
        assert_eq!(ops.path(), repo.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn destructive_op_without_allow_destructive_fails() {
        let repo = TempRepo::new().await.unwrap();
        repo.commit("1", some_time()).await.unwrap();
        let ops = GitOps::new_repo_root(repo.path(), None, Arc::new(NullAuditLogger))
            .await
            .unwrap();
        let err = ops.reset_hard("HEAD").await.expect_err("should be gated");
        assert!(matches!(err, GitOpsError::DestructiveNotAllowed(_)));
    }

    #[tokio::test]
    async fn protected_branch_refuses_commit() {
        let repo = TempRepo::new().await.unwrap();
        repo.commit("1", some_time()).await.unwrap();
        let audit = Arc::new(CollectingAuditLogger::default());
        let guard = BranchGuard::protecting_defaults();
        let ops = GitOps::new_repo_root(repo.path(), Some(guard), audit.clone())
            .await
            .unwrap();
        let head_before = ops.rev_parse("HEAD").await.unwrap().unwrap().hash;
        let err = ops
            .commit(
                "x",
                &CommitOptions {
                    allow_empty: true,
                    ..Default::default()
                },
            )
            .await
            .expect_err("commit on main should be refused");
        assert!(matches!(err, GitOpsError::ProtectedBranch(_)));
        let head_after = ops.rev_parse("HEAD").await.unwrap().unwrap().hash;
        assert_eq!(head_before, head_after, "HEAD must be unchanged");
        let entries = audit.entries();
        let last = entries.last().unwrap();
        assert!(!last.checks_passed);
        assert!(last.failure_reason.as_ref().unwrap().contains("protected"));
    }

    #[tokio::test]
    async fn worktree_flavor_allows_destructive_and_rejects_repo_root() {
        let repo = TempRepo::new().await.unwrap();
        repo.commit("1", some_time()).await.unwrap();
        let base = TempDir::new().unwrap();
        let err = GitOps::new_worktree(repo.path(), base.path().to_path_buf(), Arc::new(NullAuditLogger))
            .await
            .expect_err("repo root should be rejected by worktree flavor");
        assert!(matches!(err, GitOpsError::RepoRootNotAllowed(_)));
    }

    #[tokio::test]
    async fn status_reports_untracked_files() {
        let repo = TempRepo::new().await.unwrap();
        repo.commit("1", some_time()).await.unwrap();
        File::create(repo.path().join("new.txt")).unwrap();
        let ops = GitOps::new_repo_root(repo.path(), None, Arc::new(NullAuditLogger))
            .await
            .unwrap();
        let status = ops.status().await.unwrap();
        assert_eq!(status.untracked, vec!["new.txt".to_string()]);
        assert!(!status.is_clean());
    }

    #[test]
    fn status_parse_detects_conflicts() {
        let status = Status::parse("UU conflicted.rs\n?? untracked.rs\n M modified.rs\n");
        assert_eq!(status.conflicted, vec!["conflicted.rs".to_string()]);
        assert_eq!(status.untracked, vec!["untracked.rs".to_string()]);
        assert_eq!(status.modified, vec!["modified.rs".to_string()]);
    }

    async fn write_and_commit(repo: &TempRepo, file: &str, content: &str, message: &str) {
        std::fs::write(repo.path().join(file), content).unwrap();
        repo.git(["add", file]).await.execute().await.unwrap();
        repo.git(["commit", "-m", message]).await.execute().await.unwrap();
    }

    #[tokio::test]
    async fn rebase_onto_reports_conflict_then_abort_restores_head() {
        let repo = TempRepo::new().await.unwrap();
        write_and_commit(&repo, "shared.txt", "base\n", "base").await;

        repo.git(["checkout", "-b", "feature"]).await.execute().await.unwrap();
        write_and_commit(&repo, "shared.txt", "feature change\n", "feature work").await;
        let feature_head = repo.rev_parse("HEAD").await.unwrap().unwrap().hash;

        repo.git(["checkout", "main"]).await.execute().await.unwrap();
        write_and_commit(&repo, "shared.txt", "main change\n", "main work").await;

        repo.git(["checkout", "feature"]).await.execute().await.unwrap();
        let ops = GitOps::new_repo_root(repo.path(), None, Arc::new(NullAuditLogger))
            .await
            .unwrap();

        let outcome = ops.rebase_onto("main").await.unwrap();
        assert!(matches!(outcome, RebaseOutcome::Conflicted(ref files) if files == &["shared.txt"]));

        ops.rebase_abort().await.unwrap();
        let head_after_abort = ops.rev_parse("HEAD").await.unwrap().unwrap().hash;
        assert_eq!(head_after_abort, feature_head, "abort must restore the pre-rebase tip");
        assert!(ops.status().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn rebase_continue_succeeds_once_conflict_is_resolved() {
        let repo = TempRepo::new().await.unwrap();
        write_and_commit(&repo, "shared.txt", "base\n", "base").await;

        repo.git(["checkout", "-b", "feature"]).await.execute().await.unwrap();
        write_and_commit(&repo, "shared.txt", "feature change\n", "feature work").await;

        repo.git(["checkout", "main"]).await.execute().await.unwrap();
        write_and_commit(&repo, "shared.txt", "main change\n", "main work").await;

        repo.git(["checkout", "feature"]).await.execute().await.unwrap();
        let ops = GitOps::new_repo_root(repo.path(), None, Arc::new(NullAuditLogger))
            .await
            .unwrap();

        let outcome = ops.rebase_onto("main").await.unwrap();
        assert!(matches!(outcome, RebaseOutcome::Conflicted(_)));

        // Resolve the conflict the way a provider invocation would: edit the
        // file and stage it, then ask git to proceed.
        std::fs::write(repo.path().join("shared.txt"), "resolved\n").unwrap();
        repo.git(["add", "shared.txt"]).await.execute().await.unwrap();

        let outcome = ops.rebase_continue().await.unwrap();
        assert!(matches!(outcome, RebaseOutcome::Succeeded));
        assert!(ops.status().await.unwrap().is_clean());
    }
}
