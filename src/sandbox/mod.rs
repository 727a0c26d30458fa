//! Sandbox backends for isolated step execution.
//!
//! This module provides the [`Sandbox`] trait, the capability contract the
//! execution engine depends on, and two implementations: [`HostSandbox`]
//! (subprocesses under a temp directory) and [`ContainerSandbox`] (a
//! long-lived Docker container bound to the same kind of directory).

mod container;
mod docker;
pub mod frame;
mod host;
pub mod tracker;
mod workspace;

pub use container::ContainerSandbox;
pub use docker::{BindMount, DockerClient};
pub use frame::FrameDecoder;
pub use host::HostSandbox;
pub use tracker::{BackgroundTracker, HeuristicTracker, ProcessHandle};
pub use workspace::Workspace;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{RunnerConfig, SandboxKind};
use crate::document::EditStep;
use crate::edit;
use crate::error::Result;

/// A command to execute inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Shell command text, run through `sh -c`.
    pub command: String,
    /// Working directory; relative paths resolve against the workspace root.
    pub working_dir: Option<String>,
    /// Merged over the ambient environment.
    pub env: BTreeMap<String, String>,
    /// Overrides the sandbox's default timeout.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        let dir = dir.into();
        self.working_dir = if dir.is_empty() { None } else { Some(dir) };
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout followed by stderr, newline-separated when both are present.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Capability contract shared by every isolation backend.
///
/// A sandbox is owned by exactly one engine for one run. `cleanup` never
/// fails: teardown problems are logged so they cannot mask the run result.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short backend name for logs and reports.
    fn name(&self) -> &str;

    /// Workspace root as seen by commands running in the sandbox.
    fn root(&self) -> &Path;

    /// Host directory backing the workspace.
    fn host_path(&self) -> &Path;

    /// Creates the workspace and any backend resources. Called once.
    async fn initialize(&mut self) -> Result<()>;

    /// Runs a shell command and captures its output.
    async fn run(&mut self, spec: &CommandSpec) -> Result<CommandOutput>;

    async fn read_file(&self, path: &str) -> Result<String>;

    /// Writes a file, creating parent directories as needed.
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    async fn file_exists(&self, path: &str) -> Result<bool>;

    /// Applies an edit: read (empty if absent), transform, write back.
    async fn apply_edit(&self, step: &EditStep) -> Result<()> {
        let existing = if self.file_exists(&step.path).await? {
            self.read_file(&step.path).await?
        } else {
            String::new()
        };
        let updated = edit::apply(&existing, &step.operation, &step.path)?;
        self.write_file(&step.path, &updated).await
    }

    /// Tears down all resources. The host workspace is kept when `preserve` is set.
    async fn cleanup(&mut self, preserve: bool);
}

/// Resolves a sandbox path: absolute paths are used verbatim, everything else
/// is joined onto `root`.
pub fn resolve_path(root: &Path, path: &str) -> PathBuf {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else if path.is_empty() || path == "." {
        root.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Single-quotes a string for `sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Builds the configured sandbox backend for one run.
pub fn from_config(config: &RunnerConfig, run_id: &str) -> Box<dyn Sandbox> {
    match config.sandbox {
        SandboxKind::Host => Box::new(HostSandbox::new(config, run_id)),
        SandboxKind::Container => Box::new(ContainerSandbox::new(config, run_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_keeps_absolute_paths() {
        let root = Path::new("/tmp/ws");
        assert_eq!(resolve_path(root, "/etc/hosts"), PathBuf::from("/etc/hosts"));
        assert_eq!(resolve_path(root, "src/main.rs"), PathBuf::from("/tmp/ws/src/main.rs"));
        assert_eq!(resolve_path(root, ""), PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn command_output_combines_streams() {
        let out = CommandOutput {
            exit_code: 0,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_eq!(out.combined(), "out\nerr");

        let only_err = CommandOutput {
            stderr: "err".to_string(),
            ..Default::default()
        };
        assert_eq!(only_err.combined(), "err");
    }

    #[test]
    fn command_spec_treats_empty_dir_as_root() {
        let spec = CommandSpec::new("ls").with_working_dir("");
        assert!(spec.working_dir.is_none());

        let spec = CommandSpec::new("ls").with_working_dir("app");
        assert_eq!(spec.working_dir.as_deref(), Some("app"));
    }

    #[test]
    fn from_config_selects_backend() {
        let host = from_config(&RunnerConfig::default(), "run-1");
        assert_eq!(host.name(), "host");

        let config = RunnerConfig::default().with_sandbox(SandboxKind::Container);
        let container = from_config(&config, "run-1");
        assert_eq!(container.name(), "container");
        assert_eq!(container.root(), Path::new("/workspace"));
    }
}
