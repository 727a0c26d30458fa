//! Host-process sandbox implementation.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::config::RunnerConfig;
use crate::error::{Error, Result};

use super::tracker::{self, BackgroundTracker, HeuristicTracker, ProcessHandle};
use super::workspace::Workspace;
use super::{resolve_path, CommandOutput, CommandSpec, Sandbox};

/// A sandbox that runs commands as host subprocesses under a disposable
/// directory.
///
/// Every command gets its own process group so timeouts and teardown can
/// take out whole pipelines. Background commands (`cmd &`) are handed to a
/// [`BackgroundTracker`] and reaped on cleanup.
pub struct HostSandbox {
    workspace: Workspace,
    tracker: Box<dyn BackgroundTracker>,
    tracked: Vec<ProcessHandle>,
    default_timeout: Duration,
    max_output_bytes: usize,
}

impl HostSandbox {
    /// Creates a host sandbox for `run_id` using the configured base directory.
    pub fn new(config: &RunnerConfig, run_id: &str) -> Self {
        let workspace = Workspace::plan(&config.workspace_base(), run_id);
        let tracker = HeuristicTracker::from_config(config, workspace.path());
        Self {
            workspace,
            tracker: Box::new(tracker),
            tracked: Vec::new(),
            default_timeout: config.command_timeout(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Replaces the background-process tracker.
    pub fn with_tracker(mut self, tracker: Box<dyn BackgroundTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    /// Handles currently tracked for teardown.
    pub fn tracked(&self) -> &[ProcessHandle] {
        &self.tracked
    }

    fn resolve(&self, path: &str) -> PathBuf {
        resolve_path(self.workspace.path(), path)
    }

    fn build_command(&self, spec: &CommandSpec, cwd: &Path) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }

    async fn run_foreground(
        &self,
        spec: &CommandSpec,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut cmd = self.build_command(spec, cwd);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn shell: {}", e)))?;
        let group = child.id().and_then(|id| i32::try_from(id).ok());

        let outcome = tokio::time::timeout(timeout, collect(child, self.max_output_bytes)).await;
        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                kill_group(group);
                Err(e)
            }
            Err(_) => {
                kill_group(group);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// Runs a backgrounding command with output spooled to temp files.
    ///
    /// Pipes would keep the read side open for as long as the detached child
    /// lives, so only the shell's own exit is awaited here.
    async fn run_background(
        &mut self,
        spec: &CommandSpec,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let stdout_log = tempfile::NamedTempFile::new()?;
        let stderr_log = tempfile::NamedTempFile::new()?;

        let mut cmd = self.build_command(spec, cwd);
        cmd.stdout(Stdio::from(stdout_log.reopen()?))
            .stderr(Stdio::from(stderr_log.reopen()?))
            .kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to spawn shell: {}", e)))?;
        let group = child.id().and_then(|id| i32::try_from(id).ok());
        if let Some(pgid) = group {
            self.tracked.push(ProcessHandle::Group(pgid));
        }

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                kill_group(group);
                return Err(Error::Timeout(timeout));
            }
        };

        for handle in self.tracker.track(&spec.command, cwd).await {
            if !self.tracked.contains(&handle) {
                self.tracked.push(handle);
            }
        }

        let limit = self.max_output_bytes;
        Ok(CommandOutput {
            exit_code: exit_code(status),
            stdout: read_spool(stdout_log.path(), limit, "stdout").await?,
            stderr: read_spool(stderr_log.path(), limit, "stderr").await?,
        })
    }
}

#[async_trait]
impl Sandbox for HostSandbox {
    fn name(&self) -> &str {
        "host"
    }

    fn root(&self) -> &Path {
        self.workspace.path()
    }

    fn host_path(&self) -> &Path {
        self.workspace.path()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.workspace.create().await
    }

    async fn run(&mut self, spec: &CommandSpec) -> Result<CommandOutput> {
        let cwd = match &spec.working_dir {
            Some(dir) => self.resolve(dir),
            None => self.workspace.path().to_path_buf(),
        };
        tokio::fs::create_dir_all(&cwd).await?;

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let background = self.tracker.is_background(&spec.command);

        tracing::debug!(
            command = %spec.command,
            cwd = ?cwd,
            background,
            "running host command"
        );

        let output = if background {
            self.run_background(spec, &cwd, timeout).await?
        } else {
            self.run_foreground(spec, &cwd, timeout).await?
        };

        tracing::debug!(exit_code = output.exit_code, "host command finished");
        Ok(output)
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.resolve(path)).await?)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn file_exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    async fn cleanup(&mut self, preserve: bool) {
        for handle in std::mem::take(&mut self.tracked) {
            self.tracker.kill(handle).await;
        }
        self.tracker.sweep(self.workspace.path()).await;
        self.workspace.remove(preserve).await;
    }
}

/// Reads both streams and waits for exit, failing if either stream overflows.
async fn collect(mut child: Child, limit: usize) -> Result<CommandOutput> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Sandbox("stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Sandbox("stderr was not piped".to_string()))?;

    let (stdout, stderr, status) = tokio::try_join!(
        read_capped(stdout, limit, "stdout"),
        read_capped(stderr, limit, "stderr"),
        async { child.wait().await.map_err(Error::from) },
    )?;

    Ok(CommandOutput {
        exit_code: exit_code(status),
        stdout,
        stderr,
    })
}

async fn read_capped<R>(mut reader: R, limit: usize, stream: &'static str) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() + n > limit {
            return Err(Error::OutputLimit { stream, limit });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn read_spool(path: &Path, limit: usize, stream: &'static str) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    if bytes.len() > limit {
        return Err(Error::OutputLimit { stream, limit });
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn kill_group(group: Option<i32>) {
    if let Some(pgid) = group {
        tracker::signal(ProcessHandle::Group(pgid), Signal::SIGKILL);
    }
}

/// Exit code, or `128 + signal` for signal-terminated processes.
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    use crate::document::{AnchorAction, ContextAnchor, EditOperation, EditStep};

    fn sandbox_in(base: &TempDir) -> HostSandbox {
        sandbox_named(base, "host-test")
    }

    fn sandbox_named(base: &TempDir, run_id: &str) -> HostSandbox {
        let config = RunnerConfig::default().with_workspace_dir(base.path());
        let config = RunnerConfig {
            background_settle_ms: 50,
            kill_grace_ms: 200,
            ..config
        };
        HostSandbox::new(&config, run_id)
    }

    #[tokio::test]
    async fn runs_commands_in_the_workspace() {
        let base = TempDir::new().unwrap();
        let mut sandbox = sandbox_in(&base);
        sandbox.initialize().await.unwrap();

        let out = sandbox.run(&CommandSpec::new("pwd")).await.unwrap();
        assert_eq!(out.exit_code, 0);
        let reported = PathBuf::from(out.stdout.trim()).canonicalize().unwrap();
        assert_eq!(reported, sandbox.root().canonicalize().unwrap());

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn creates_missing_working_directories() {
        let base = TempDir::new().unwrap();
        let mut sandbox = sandbox_in(&base);
        sandbox.initialize().await.unwrap();

        let spec = CommandSpec::new("touch marker").with_working_dir("a/b");
        sandbox.run(&spec).await.unwrap();
        assert!(sandbox.file_exists("a/b/marker").await.unwrap());

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let base = TempDir::new().unwrap();
        let mut sandbox = sandbox_in(&base);
        sandbox.initialize().await.unwrap();

        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        let spec = CommandSpec::new("echo $GREETING; echo oops >&2; exit 3").with_env(env);
        let out = sandbox.run(&spec).await.unwrap();

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn output_overflow_is_an_error() {
        let base = TempDir::new().unwrap();
        let config = RunnerConfig {
            max_output_bytes: 16,
            ..RunnerConfig::default().with_workspace_dir(base.path())
        };
        let mut sandbox = HostSandbox::new(&config, "overflow");
        sandbox.initialize().await.unwrap();

        let err = sandbox
            .run(&CommandSpec::new("yes | head -c 1000"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutputLimit { stream: "stdout", .. }));

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let base = TempDir::new().unwrap();
        let mut sandbox = sandbox_in(&base);
        sandbox.initialize().await.unwrap();

        let spec = CommandSpec::new("sleep 30").with_timeout(Duration::from_millis(200));
        let err = sandbox.run(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn background_commands_return_and_are_reaped() {
        let base = TempDir::new().unwrap();
        let mut sandbox = sandbox_in(&base);
        sandbox.initialize().await.unwrap();

        let out = sandbox
            .run(&CommandSpec::new("sleep 30 & echo started"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "started");
        assert!(!sandbox.tracked().is_empty());

        sandbox.cleanup(false).await;
        assert!(sandbox.tracked().is_empty());
    }

    #[tokio::test]
    async fn file_round_trip_and_edit() {
        let base = TempDir::new().unwrap();
        let mut sandbox = sandbox_in(&base);
        sandbox.initialize().await.unwrap();

        sandbox.write_file("src/app.txt", "one\ntwo").await.unwrap();
        assert!(sandbox.file_exists("src/app.txt").await.unwrap());

        let step = EditStep {
            path: "src/app.txt".to_string(),
            operation: EditOperation::Context(ContextAnchor {
                pattern: "one".to_string(),
                action: AnchorAction::After,
                content: "one and a half".to_string(),
            }),
        };
        sandbox.apply_edit(&step).await.unwrap();
        assert_eq!(
            sandbox.read_file("src/app.txt").await.unwrap(),
            "one\none and a half\ntwo"
        );

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn edit_of_missing_file_starts_empty() {
        let base = TempDir::new().unwrap();
        let mut sandbox = sandbox_in(&base);
        sandbox.initialize().await.unwrap();

        let step = EditStep {
            path: "new/dir/file.txt".to_string(),
            operation: EditOperation::Replace {
                content: "fresh".to_string(),
            },
        };
        sandbox.apply_edit(&step).await.unwrap();
        assert_eq!(sandbox.read_file("new/dir/file.txt").await.unwrap(), "fresh");

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn cleanup_respects_preserve() {
        let base = TempDir::new().unwrap();
        let mut sandbox = sandbox_in(&base);
        sandbox.initialize().await.unwrap();
        let root = sandbox.root().to_path_buf();

        sandbox.cleanup(true).await;
        assert!(root.exists());

        let mut other = sandbox_named(&base, "host-test-other");
        other.initialize().await.unwrap();
        let other_root = other.root().to_path_buf();
        other.cleanup(false).await;
        assert!(!other_root.exists());
    }
}
