//! Error types for the tutorial runner.

use std::time::Duration;

use thiserror::Error;

use crate::document::ValidationIssue;
use crate::edit::EditError;

/// Top-level error type for document loading and run execution.
///
/// Step failures are not errors: they are reported through
/// [`StepResult`](crate::engine::StepResult). Everything here aborts a run
/// before or outside step attribution.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation document failed structural validation.
    #[error("invalid operation document ({} issue(s)): {}", .0.len(), format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// The operation document could not be parsed at all.
    #[error("failed to parse operation document: {0}")]
    Parse(String),

    /// Declared prerequisites are missing from the host.
    #[error("prerequisites not met: {}", .0.join("; "))]
    Prerequisites(Vec<String>),

    /// Failed to create a sandbox.
    #[error("failed to create sandbox: {0}")]
    SandboxCreation(String),

    /// A sandbox operation failed outside of any step's success criteria.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// The container image is absent and could not be built automatically.
    #[error("container image '{image}' not found; build it with: {remediation}")]
    ImageMissing { image: String, remediation: String },

    /// A Docker Engine API call failed.
    #[error("docker {operation} failed (status {status}): {message}")]
    Docker {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// Command output exceeded the capture buffer.
    #[error("{stream} exceeded the {limit} byte capture limit")]
    OutputLimit { stream: &'static str, limit: usize },

    /// A command did not finish within its timeout.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// A file edit could not be applied.
    #[error(transparent)]
    Edit(#[from] EditError),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Runner configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for runner operations.
pub type Result<T> = std::result::Result<T, Error>;
