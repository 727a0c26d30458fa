//! Step and run results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Outcome of one executed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub id: String,
    pub ordinal: u32,
    /// `run`, `edit`, `cli-output`, `file-state` or `ui-state`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Captured output, truncated for reporting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of a whole run.
///
/// `steps` holds only executed operations, so `success` over a halted run
/// says nothing about the steps that never ran. Use
/// [`RunResult::is_complete`] before treating the document as valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    /// Backend that executed the run.
    pub sandbox: String,
    /// Host directory backing the workspace.
    pub workspace: PathBuf,
    pub steps: Vec<StepResult>,
    /// Number of operations the document declared.
    pub total_steps: usize,
    /// True iff every executed step succeeded.
    pub success: bool,
    pub duration_ms: u64,
}

impl RunResult {
    /// True when every declared step ran and succeeded.
    pub fn is_complete(&self) -> bool {
        self.success && self.steps.len() == self.total_steps
    }

    /// The step that halted the run, if any.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| !s.success)
    }
}

/// Truncates `output` to `max_chars` characters, noting what was dropped.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    format!("{}\n... [truncated {} characters]", kept, total - max_chars)
}
