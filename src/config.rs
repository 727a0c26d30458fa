//! Runner configuration.
//!
//! Configuration comes from defaults, an optional TOML file, and finally
//! environment overrides. Validation follows the usual errors-plus-warnings
//! shape so callers can surface warnings without failing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable selecting the base directory for disposable workspaces.
pub const WORKSPACE_DIR_ENV: &str = "TUTORIAL_RUNNER_WORKSPACE_DIR";

/// Directory created under the platform temp dir when no base is configured.
const DEFAULT_WORKSPACE_SUBDIR: &str = "tutorial-runner-workspaces";

/// Which isolation backend executes the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// Host subprocesses rooted at a temp directory.
    #[default]
    Host,
    /// A long-lived container per run.
    Container,
}

/// Settings for the container backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image the sandbox container is created from.
    #[serde(default = "default_image")]
    pub image: String,

    /// Dockerfile used to build `image` when it is missing locally.
    #[serde(default)]
    pub dockerfile: Option<PathBuf>,

    /// Copy files in/out instead of bind-mounting the host workspace.
    #[serde(default)]
    pub isolated: bool,

    /// Docker Engine socket. Defaults to `DOCKER_HOST` or `/var/run/docker.sock`.
    #[serde(default)]
    pub socket: Option<PathBuf>,

    /// Workspace path inside the container.
    #[serde(default = "default_container_workdir")]
    pub workdir: String,
}

fn default_image() -> String {
    "tutorial-runner-sandbox:latest".to_string()
}

fn default_container_workdir() -> String {
    "/workspace".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            dockerfile: None,
            isolated: false,
            socket: None,
            workdir: default_container_workdir(),
        }
    }
}

impl ContainerConfig {
    /// Resolves the Docker Engine socket path.
    pub fn socket_path(&self) -> PathBuf {
        if let Some(socket) = &self.socket {
            return socket.clone();
        }
        std::env::var("DOCKER_HOST")
            .ok()
            .and_then(|host| host.strip_prefix("unix://").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/var/run/docker.sock"))
    }
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Base directory for workspaces. `None` means the platform temp dir.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,

    /// Default timeout for each command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Capture limit per output stream. Exceeding it fails the command.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Output included in step results is truncated to this many characters.
    #[serde(default = "default_report_output_chars")]
    pub report_output_chars: usize,

    /// Delay before looking for processes a background command started.
    #[serde(default = "default_background_settle_ms")]
    pub background_settle_ms: u64,

    /// Time between SIGTERM and SIGKILL when reaping background processes.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    #[serde(default)]
    pub sandbox: SandboxKind,

    #[serde(default)]
    pub container: ContainerConfig,
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_report_output_chars() -> usize {
    4000
}

fn default_background_settle_ms() -> u64 {
    2000
}

fn default_kill_grace_ms() -> u64 {
    3000
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_dir: None,
            command_timeout_secs: default_command_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            report_output_chars: default_report_output_chars(),
            background_settle_ms: default_background_settle_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            sandbox: SandboxKind::default(),
            container: ContainerConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Loads configuration from a TOML file, then applies environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        Ok(config.with_env_overrides())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies recognized environment variables over the current values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var(WORKSPACE_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.workspace_dir = Some(PathBuf::from(dir));
            }
        }
        self
    }

    /// Sets the sandbox backend.
    pub fn with_sandbox(mut self, sandbox: SandboxKind) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Sets the workspace base directory.
    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = Some(dir.into());
        self
    }

    /// Sets the default command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Base directory under which run workspaces are created.
    pub fn workspace_base(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_WORKSPACE_SUBDIR))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn background_settle(&self) -> Duration {
        Duration::from_millis(self.background_settle_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for RunnerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.command_timeout_secs == 0 {
            result.add_error("command_timeout_secs must be at least 1");
        }
        if self.command_timeout_secs > 3600 {
            result.add_warning("command_timeout_secs over 1 hour may indicate a misconfiguration");
        }

        if self.max_output_bytes == 0 {
            result.add_error("max_output_bytes must be greater than 0");
        }

        if self.kill_grace_ms > 60_000 {
            result.add_warning("kill_grace_ms over 60 seconds delays cleanup considerably");
        }

        if let Some(dir) = &self.workspace_dir {
            if dir.is_relative() {
                result.add_warning(format!(
                    "workspace_dir '{}' is relative and depends on the launch directory",
                    dir.display()
                ));
            }
        }

        result.merge(self.container.validate());
        result
    }
}

impl Validate for ContainerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.image.trim().is_empty() {
            result.add_error("container.image cannot be empty");
        }
        if !self.workdir.starts_with('/') {
            result.add_error("container.workdir must be an absolute path");
        }
        if let Some(dockerfile) = &self.dockerfile {
            if !dockerfile.exists() {
                result.add_warning(format!(
                    "container.dockerfile '{}' does not exist; missing images cannot be built",
                    dockerfile.display()
                ));
            }
        }

        result
    }
}
