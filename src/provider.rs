//! Supervises an LLM provider CLI as a subprocess: feeds it a prompt on
//! stdin, streams stdout/stderr to a log file and a caller-supplied sink
//! simultaneously, and honors cancellation with a grace period before
//! escalating from SIGTERM to SIGKILL.
//!
//! Grounded on the spawn/select!/signal dance in the teacher's sibling
//! fork, `cip999-limmat/src/test.rs`'s `Job::run`, generalized from a
//! fire-and-forget test command to a long-lived, stdin-fed, dual-streamed
//! provider invocation.

use std::path::{Path, PathBuf};
use std::pin::pin;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context as _;
use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// Grace period between SIGTERM and SIGKILL when a provider invocation
/// is cancelled.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Sink for a stream of provider output lines, fed from both stdout and
/// stderr as they are produced. Implementors decide whether to forward,
/// suppress, or both.
pub trait OutputSink: Send {
    fn on_line(&mut self, line: &str);
}

/// Sink that writes every line it sees to a log file, used as the
/// mandatory half of every invocation's dual-sink streaming.
pub struct LogFileSink {
    file: tokio::fs::File,
}

impl LogFileSink {
    pub async fn create(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening provider log file {path:?}"))?;
        Ok(Self { file })
    }

    pub async fn write_line(&mut self, line: &str) -> anyhow::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        Ok(())
    }
}

/// Invokes provider CLIs as subprocesses rooted at a worktree directory.
pub struct ProviderRunner {
    /// Binary name or path, e.g. "claude" or "codex".
    pub binary: PathBuf,
    pub extra_args: Vec<String>,
}

impl ProviderRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    /// Resolves the provider for one unit, highest precedence first: a
    /// forced run-wide override, the unit's own declared override, the
    /// run's default (CLI flag/env), then the configuration file.
    /// Whichever name wins, a `providers.<name>.command` entry in the
    /// config swaps in a path override for that name's binary.
    pub fn resolve(
        config: &crate::config::ProviderConfig,
        forced_override: Option<&str>,
        unit_override: Option<&str>,
        runtime_default: Option<&str>,
    ) -> Self {
        let name = forced_override
            .or(unit_override)
            .or(runtime_default)
            .unwrap_or(config.r#type.as_str());
        match config.providers.get(name) {
            Some(over) => Self::new(over.command.clone()),
            None => Self::new(name),
        }
    }

    /// Runs the provider with `prompt` fed on stdin, rooted at `workdir`.
    /// Every stdout/stderr line is appended to `log_path` and also handed
    /// to `passthrough`, which may discard it.
    pub async fn invoke(
        &self,
        prompt: &str,
        workdir: &Path,
        log_path: &Path,
        passthrough: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let mut log_sink = LogFileSink::create(log_path)
            .await
            .map_err(|e| ProviderError::spawn_io(std::io::Error::other(e)))?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.extra_args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(ProviderError::Spawn)?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| ProviderError::Spawn(std::io::Error::other("no pid for child")))?
                as i32,
        );

        {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            let prompt = prompt.to_string();
            // Write the prompt then close stdin so the provider sees EOF,
            // rather than holding the handle open for the process lifetime.
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(ProviderError::spawn_io)?;
            drop(stdin);
        }

        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));
        let stderr = BufReader::new(child.stderr.take().expect("stderr was piped"));

        let mut stdout_lines = stdout.lines();
        let mut stderr_lines = stderr.lines();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let mut wait_fut = pin!(child.wait());
        let mut cancel_fut = pin!(cancel.cancelled());
        let mut sigtermed = false;

        let provider_name = self.binary.to_string_lossy().into_owned();

        loop {
            select! {
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line.map_err(ProviderError::spawn_io)? {
                        Some(line) => {
                            let _ = log_sink.write_line(&line).await;
                            passthrough.on_line(&line);
                        }
                        None => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line.map_err(ProviderError::spawn_io)? {
                        Some(line) => {
                            let _ = log_sink.write_line(&line).await;
                            passthrough.on_line(&line);
                        }
                        None => stderr_done = true,
                    }
                }
                status = &mut wait_fut => {
                    let status = status.map_err(ProviderError::spawn_io)?;
                    if sigtermed {
                        return Err(ProviderError::Cancelled);
                    }
                    return match status.code() {
                        Some(0) => Ok(()),
                        Some(code) => Err(ProviderError::NonZeroExit { provider: provider_name, code }),
                        None => Err(ProviderError::NonZeroExit { provider: provider_name, code: -1 }),
                    };
                }
                _ = &mut cancel_fut, if !sigtermed => {
                    info!("cancelling provider {provider_name} (pid {pid})");
                    if let Err(e) = kill(pid, Signal::SIGTERM) {
                        warn!("failed to send SIGTERM to provider: {e}");
                    }
                    sigtermed = true;
                    select! {
                        _ = sleep(KILL_GRACE) => {
                            warn!("provider {provider_name} (pid {pid}) did not exit after SIGTERM, sending SIGKILL");
                            let _ = kill(pid, Signal::SIGKILL);
                        }
                        _ = &mut wait_fut => {
                            return Err(ProviderError::Cancelled);
                        }
                    }
                }
            }
        }
    }
}

impl ProviderError {
    fn spawn_io(e: std::io::Error) -> Self {
        ProviderError::Spawn(e)
    }
}

/// Discards every line. Used when output suppression is configured.
pub struct NullSink;

impl OutputSink for NullSink {
    fn on_line(&mut self, _line: &str) {}
}

/// Forwards every line to the process's stdout, used when the caller
/// wants passthrough terminal output.
pub struct PassthroughSink;

impl OutputSink for PassthroughSink {
    fn on_line(&mut self, line: &str) {
        println!("{line}");
    }
}

/// Collects every line into a buffer, used by tests and by the
/// conflict-resolution/review-feedback flows that don't need live
/// passthrough but do want to inspect output after the fact.
#[derive(Default)]
pub struct CollectSink {
    pub lines: Vec<String>,
}

impl OutputSink for CollectSink {
    fn on_line(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::config::ProviderConfig;

    #[test]
    fn resolve_precedence_prefers_forced_override() {
        let config = ProviderConfig {
            r#type: "claude".into(),
            providers: Default::default(),
        };
        let runner = super::ProviderRunner::resolve(&config, Some("codex"), Some("gemini"), Some("claude"));
        assert_eq!(runner.binary, std::path::PathBuf::from("codex"));
    }

    #[test]
    fn resolve_falls_back_to_config_type_when_nothing_else_set() {
        let config = ProviderConfig {
            r#type: "claude".into(),
            providers: Default::default(),
        };
        let runner = super::ProviderRunner::resolve(&config, None, None, None);
        assert_eq!(runner.binary, std::path::PathBuf::from("claude"));
    }

    #[test]
    fn resolve_applies_command_path_override() {
        let mut providers = std::collections::HashMap::new();
        providers.insert(
            "codex".to_string(),
            crate::config::ProviderOverride {
                command: "/opt/bin/codex-cli".into(),
            },
        );
        let config = ProviderConfig {
            r#type: "claude".into(),
            providers,
        };
        let runner = super::ProviderRunner::resolve(&config, None, Some("codex"), None);
        assert_eq!(runner.binary, std::path::PathBuf::from("/opt/bin/codex-cli"));
    }

    use super::*;

    #[tokio::test]
    async fn successful_invocation_collects_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProviderRunner {
            binary: "bash".into(),
            extra_args: vec!["-c".into(), "cat; echo done >&2".into()],
        };
        let mut sink = CollectSink::default();
        let cancel = CancellationToken::new();
        let log_path = dir.path().join("logs/provider.log");
        runner
            .invoke("hello", dir.path(), &log_path, &mut sink, &cancel)
            .await
            .unwrap();
        assert!(sink.lines.iter().any(|l| l == "hello"));
        assert!(sink.lines.iter().any(|l| l == "done"));
        assert!(log_path.exists());
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProviderRunner {
            binary: "bash".into(),
            extra_args: vec!["-c".into(), "exit 3".into()],
        };
        let mut sink = NullSink;
        let cancel = CancellationToken::new();
        let err = runner
            .invoke(
                "",
                dir.path(),
                &dir.path().join("logs/provider.log"),
                &mut sink,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NonZeroExit { code: 3, .. }));
    }

    #[tokio::test]
    async fn cancellation_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProviderRunner {
            binary: "bash".into(),
            extra_args: vec!["-c".into(), "trap 'exit 0' TERM; sleep 30".into()],
        };
        let mut sink = NullSink;
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });
        let result = timeout(
            Duration::from_secs(2),
            runner.invoke(
                "",
                dir.path(),
                &dir.path().join("logs/provider.log"),
                &mut sink,
                &cancel,
            ),
        )
        .await
        .expect("invoke should finish promptly after cancellation");
        assert!(matches!(result, Err(ProviderError::Cancelled)));
    }
}
