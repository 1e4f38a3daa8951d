//! Small helpers shared across the crate: path/XDG resolution for the
//! config file and daemon sockets, and a couple of `Result`/`Future`
//! extension traits carried over from the teacher's own `util.rs`.

use core::fmt;
use std::{
    fmt::{Display, Formatter},
    future::Future,
    io,
    ops::Deref,
    path::{Path, PathBuf},
    str::FromStr,
};

#[allow(unused_imports)]
use log::{debug, error};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct DisplayablePathBuf(pub PathBuf);

impl FromStr for DisplayablePathBuf {
    type Err = <PathBuf as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PathBuf::from_str(s).map(Self)
    }
}

impl From<PathBuf> for DisplayablePathBuf {
    fn from(p: PathBuf) -> Self {
        Self(p)
    }
}

impl From<DisplayablePathBuf> for PathBuf {
    fn from(d: DisplayablePathBuf) -> PathBuf {
        d.0
    }
}

impl Display for DisplayablePathBuf {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0.display(), f)
    }
}

impl Deref for DisplayablePathBuf {
    type Target = PathBuf;

    fn deref(&self) -> &PathBuf {
        &self.0
    }
}

pub trait ResultExt {
    /// Logs an error if it occurs, prefixed with `s`; otherwise does
    /// nothing. For fire-and-forget cleanup paths where the caller can't
    /// usefully propagate a failure (worktree teardown, draining a
    /// subscriber on shutdown).
    fn or_log_error(&self, s: &str);
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    fn or_log_error(&self, s: &str) {
        if let Err(e) = self {
            error!("{} - {}", s, e);
        }
    }
}

/// Go-style errgroup: spawns tasks sharing a cancellation token, cancels
/// the rest as soon as one fails, and surfaces the first error. Used by
/// `crate::worker_pool` to run workers concurrently under one run-level
/// cancellation token.
pub struct ErrGroup {
    ct: CancellationToken,
    join_set: JoinSet<anyhow::Result<()>>,
}

impl ErrGroup {
    pub fn new(ct: CancellationToken) -> Self {
        Self {
            ct,
            join_set: JoinSet::new(),
        }
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.join_set.spawn(task);
    }

    /// Blocks until all tasks complete, returning the first error. As soon
    /// as any task errors, cancels the token passed to `new`. Panics if any
    /// task itself panics.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let mut final_result: anyhow::Result<()> = Ok(());

        while let Some(result) = self.join_set.join_next().await {
            if let Err(err) = result.expect("joining ErrGroup tasks") {
                if final_result.is_ok() {
                    final_result = Err(err)
                }
                self.ct.cancel();
                break;
            }
        }

        let _ = self.join_set.join_all().await;

        final_result
    }
}

pub trait IoResultExt {
    fn ignore(self, kind: io::ErrorKind) -> Self;
}

impl IoResultExt for io::Result<()> {
    fn ignore(self, kind: io::ErrorKind) -> io::Result<()> {
        match self {
            Err(e) => {
                if e.kind() == kind {
                    Ok(())
                } else {
                    Err(e)
                }
            }
            Ok(()) => Ok(()),
        }
    }
}

/// Resolves `~/.config/choo/config.toml` (or `$XDG_CONFIG_HOME` equivalent)
/// via the `directories` crate's per-OS conventions. Returns `None` if the
/// platform has no resolvable home directory, in which case callers fall
/// back to `Config::default()`.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "choo")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Resolves the daemon's Unix domain socket path: `$XDG_RUNTIME_DIR/choo/daemon.sock`,
/// falling back to `~/.choo/daemon.sock` when `XDG_RUNTIME_DIR` isn't set, per
/// spec_full.md's "Environment" section.
pub fn daemon_socket_path() -> PathBuf {
    runtime_base_dir(std::env::var_os("XDG_RUNTIME_DIR")).join("daemon.sock")
}

/// Resolves the event-streaming socket path alongside the daemon socket.
pub fn web_socket_path() -> PathBuf {
    runtime_base_dir(std::env::var_os("XDG_RUNTIME_DIR")).join("web.sock")
}

fn runtime_base_dir(xdg_runtime_dir: Option<std::ffi::OsString>) -> PathBuf {
    if let Some(runtime_dir) = xdg_runtime_dir {
        return PathBuf::from(runtime_dir).join("choo");
    }
    let home = directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    home.join(".choo")
}

/// Resolves the `HistoryStore` file at `~/.choo/history.db`, per
/// spec_full.md's persisted-state layout (unlike the sockets, this is
/// not XDG-runtime-scoped: history outlives a login session).
pub fn history_db_path() -> PathBuf {
    let home = directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    home.join(".choo").join("history.db")
}

/// True if `path` contains a marker file that's a sentinel for a project
/// type `crate::worker`'s bootstrap step knows how to set up (`package.json`
/// for npm, `go.mod` for Go modules, and so on).
pub fn has_marker(dir: &Path, marker: &str) -> bool {
    dir.join(marker).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displayable_path_buf_round_trips_through_from_str() {
        let p: DisplayablePathBuf = "/tmp/choo".parse().unwrap();
        assert_eq!(format!("{p}"), "/tmp/choo");
        assert_eq!(PathBuf::from(p), PathBuf::from("/tmp/choo"));
    }

    #[test]
    fn ignore_passes_through_other_error_kinds() {
        let err = Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        assert!(err.ignore(io::ErrorKind::NotFound).is_err());
        let ok: io::Result<()> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(ok.ignore(io::ErrorKind::NotFound).is_ok());
    }

    #[tokio::test]
    async fn err_group_cancels_remaining_tasks_on_first_failure() {
        let ct = CancellationToken::new();
        let mut group = ErrGroup::new(ct.clone());
        group.spawn(async { anyhow::bail!("boom") });
        let waiting_ct = ct.clone();
        group.spawn(async move {
            waiting_ct.cancelled().await;
            Ok(())
        });
        let result = group.wait().await;
        assert!(result.is_err());
        assert!(ct.is_cancelled());
    }

    #[test]
    fn runtime_base_dir_prefers_xdg_runtime_dir() {
        let base = runtime_base_dir(Some("/run/user/1000".into()));
        assert_eq!(base, PathBuf::from("/run/user/1000/choo"));
    }

    #[test]
    fn has_marker_checks_for_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_marker(dir.path(), "package.json"));
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        assert!(has_marker(dir.path(), "package.json"));
    }
}
