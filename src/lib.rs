//! Tutorial Runner - deterministic execution of tutorial operation documents
//!
//! This library runs an ordered list of shell commands, file edits, and
//! assertions against a disposable sandbox (host directory or container) and
//! reports per-step results.

pub mod config;
pub mod document;
pub mod edit;
pub mod engine;
pub mod error;
pub mod sandbox;

pub use config::{ContainerConfig, RunnerConfig, SandboxKind, Validate, ValidationResult};
pub use document::{Document, Operation, OperationKind, ValidationIssue};
pub use engine::{Engine, InterpreterState, RunResult, StepResult};
pub use error::{Error, Result};
pub use sandbox::{CommandOutput, CommandSpec, ContainerSandbox, HostSandbox, Sandbox};
