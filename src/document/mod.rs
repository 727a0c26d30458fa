//! Operation document model.
//!
//! The document is produced by an external extraction layer (usually as YAML)
//! and is immutable once loaded. Loading always goes through
//! [`Document::from_value`], which validates the raw tree and reports every
//! problem as a `(path, problem)` pair before deserializing.

mod validate;

pub use validate::{validate_value, ValidationIssue};

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Optional descriptive metadata carried through to reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Host requirements checked before any operation runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisites {
    /// Command names that must resolve on `PATH`.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Environment variable names that must be set.
    #[serde(default)]
    pub env: Vec<String>,
}

impl Prerequisites {
    /// Returns true if nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.env.is_empty()
    }
}

/// A complete operation document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default)]
    pub prerequisites: Prerequisites,

    /// Initial logical working directory, relative to the workspace root.
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Environment applied to every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Ordered operations. An empty list is a trivially successful run.
    pub steps: Vec<Operation>,
}

impl Document {
    /// Loads a document from a YAML or JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parses a document from YAML or JSON text.
    pub fn parse(content: &str) -> Result<Self> {
        // YAML is a superset of JSON, so one parser covers both inputs.
        let value: serde_json::Value =
            serde_yaml::from_str(content).map_err(|e| Error::Parse(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validates a raw document tree and converts it into a [`Document`].
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let issues = validate_value(&value);
        if !issues.is_empty() {
            return Err(Error::Validation(issues));
        }

        serde_json::from_value(value)
            .map_err(|e| Error::Validation(vec![ValidationIssue::new("$", e.to_string())]))
    }
}

/// One step of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Caller-supplied identifier, unique within the document.
    pub id: String,

    /// Reporting position. Positive, not required to be contiguous.
    pub ordinal: u32,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(flatten)]
    pub kind: OperationKind,
}

impl Operation {
    /// Short label for the operation kind, used in logs and reports.
    pub fn kind_label(&self) -> &'static str {
        match &self.kind {
            OperationKind::Run(_) => "run",
            OperationKind::Edit(_) => "edit",
            OperationKind::Check(step) => match step.check {
                Assertion::CliOutput(_) => "cli-output",
                Assertion::FileState(_) => "file-state",
                Assertion::UiState(_) => "ui-state",
            },
        }
    }
}

/// The three operation kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OperationKind {
    Run(RunOperation),
    Edit(EditStep),
    Check(CheckStep),
}

/// A shell command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOperation {
    pub command: String,

    /// Overrides the logical working directory for this command only.
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Environment overrides for this command only.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub expect_exit_code: i32,

    /// Include stdout in the step result even on success.
    #[serde(default)]
    pub capture_output: bool,

    /// Overrides the configured command timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl RunOperation {
    /// Creates a run operation with default expectations.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_directory: None,
            env: BTreeMap::new(),
            expect_exit_code: 0,
            capture_output: false,
            timeout_secs: None,
        }
    }
}

/// A file edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditStep {
    pub path: String,
    pub operation: EditOperation,
}

/// Structural edits understood by the text edit engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EditOperation {
    /// Replace the whole file.
    Replace { content: String },
    LineDiff(LineDiff),
    Context(ContextAnchor),
}

/// Line-oriented splice. See [`crate::edit::apply`] for ordering rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDiff {
    #[serde(default)]
    pub remove_lines: Option<LineRange>,
    #[serde(default)]
    pub insert_lines: Option<LineInsert>,
    #[serde(default)]
    pub find_replace: Option<FindReplace>,
}

/// Inclusive, 0-indexed line range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineInsert {
    /// 0-indexed line position the first inserted line will occupy.
    pub at: usize,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindReplace {
    pub find: String,
    pub replace: String,
}

/// Insert or substitute content relative to a literal anchor pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextAnchor {
    pub pattern: String,
    pub action: AnchorAction,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorAction {
    Before,
    After,
    Replace,
}

/// A check step wrapping one assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckStep {
    pub check: Assertion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Assertion {
    CliOutput(CommandOutputCheck),
    FileState(FileStateCheck),
    UiState(UiStateCheck),
}

/// Runs a command and checks its output. All configured predicates must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutputCheck {
    pub command: String,
    /// Substring expected in stdout.
    #[serde(default)]
    pub contains: Option<String>,
    /// Substring expected in stderr.
    #[serde(default)]
    pub contains_error: Option<String>,
    /// Regex matched against stdout followed by stderr.
    #[serde(default)]
    pub matches: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Checks a file's existence and contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStateCheck {
    pub path: String,
    /// Whether the file must exist (default) or must be absent.
    #[serde(default)]
    pub exists: Option<bool>,
    #[serde(default)]
    pub contains: Option<String>,
    #[serde(default)]
    pub equals: Option<String>,
    #[serde(default)]
    pub matches: Option<String>,
}

/// Browser-level check, evaluated by an external collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiStateCheck {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub contains: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_parses_minimal_yaml() {
        let yaml = r#"
steps:
  - id: make-dir
    ordinal: 1
    type: run
    command: mkdir t
"#;
        let doc = Document::parse(yaml).unwrap();
        assert_eq!(doc.steps.len(), 1);
        assert!(doc.prerequisites.is_empty());

        let step = &doc.steps[0];
        assert_eq!(step.id, "make-dir");
        assert_eq!(step.kind_label(), "run");
        match &step.kind {
            OperationKind::Run(run) => {
                assert_eq!(run.command, "mkdir t");
                assert_eq!(run.expect_exit_code, 0);
                assert!(!run.capture_output);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn document_parses_every_kind() {
        let yaml = r#"
metadata:
  title: Hello tutorial
prerequisites:
  commands: [sh]
  env: [HOME]
working_directory: app
env:
  GREETING: hi
steps:
  - id: s1
    ordinal: 1
    type: edit
    path: config.json
    operation:
      type: context
      pattern: '"a": 1'
      action: after
      content: '"b": 2'
  - id: s2
    ordinal: 2
    type: edit
    path: notes.txt
    operation:
      type: line-diff
      remove_lines: { start: 0, end: 1 }
      insert_lines: { at: 0, lines: ["first"] }
  - id: s3
    ordinal: 3
    type: check
    check:
      type: file-state
      path: notes.txt
      equals: "first"
  - id: s4
    ordinal: 4
    type: check
    check:
      type: cli-output
      command: echo hi
      contains: hi
      exit_code: 0
  - id: s5
    ordinal: 5
    type: check
    check:
      type: ui-state
      url: http://localhost:3000
"#;
        let doc = Document::parse(yaml).unwrap();
        assert_eq!(doc.metadata.title.as_deref(), Some("Hello tutorial"));
        assert_eq!(doc.working_directory.as_deref(), Some("app"));
        assert_eq!(doc.env.get("GREETING").map(String::as_str), Some("hi"));

        let labels: Vec<_> = doc.steps.iter().map(Operation::kind_label).collect();
        assert_eq!(
            labels,
            vec!["edit", "edit", "file-state", "cli-output", "ui-state"]
        );

        match &doc.steps[0].kind {
            OperationKind::Edit(edit) => match &edit.operation {
                EditOperation::Context(anchor) => {
                    assert_eq!(anchor.action, AnchorAction::After);
                    assert_eq!(anchor.pattern, "\"a\": 1");
                }
                other => panic!("unexpected edit: {:?}", other),
            },
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn document_accepts_json_input() {
        let json = r#"{"steps":[{"id":"a","ordinal":1,"type":"run","command":"true"}]}"#;
        let doc = Document::parse(json).unwrap();
        assert_eq!(doc.steps.len(), 1);
    }

    #[test]
    fn empty_step_list_is_valid() {
        let doc = Document::parse("steps: []").unwrap();
        assert!(doc.steps.is_empty());
    }

    #[test]
    fn unparseable_text_is_a_parse_error() {
        let err = Document::parse("steps: [unterminated").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
