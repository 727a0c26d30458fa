//! The execution engine.
//!
//! Walks a document's operations in order against one [`Sandbox`], threading
//! an [`InterpreterState`] through each dispatch. The first failing step
//! halts the run. Cleanup always runs once the sandbox has been touched,
//! including when the run future is dropped or a step panics.

pub mod checks;
mod prereq;
mod result;
pub mod state;

pub use result::{truncate_output, RunResult, StepResult};
pub use state::{CdUpdate, InterpreterState};

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::RunnerConfig;
use crate::document::{
    Assertion, CommandOutputCheck, Document, EditStep, FileStateCheck, Operation, OperationKind,
    RunOperation,
};
use crate::error::{Error, Result};
use crate::sandbox::{self, CommandOutput, CommandSpec, Sandbox};

/// Step outcome before timing and identity are attached.
struct Outcome {
    success: bool,
    error: Option<String>,
    output: Option<String>,
}

impl Outcome {
    fn passed(output: Option<String>) -> Self {
        Self {
            success: true,
            error: None,
            output,
        }
    }

    fn failed(error: impl Into<String>, output: Option<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            output,
        }
    }
}

/// Runs one document against one sandbox.
pub struct Engine {
    /// Taken by teardown; `None` afterwards.
    sandbox: Option<Box<dyn Sandbox>>,
    config: RunnerConfig,
    run_id: String,
    preserve: bool,
    /// Set once the sandbox may hold resources that need teardown.
    armed: bool,
}

impl Engine {
    /// Creates an engine with the configured backend and a fresh run id.
    pub fn new(config: RunnerConfig) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        Self::with_run_id(config, run_id)
    }

    /// Creates an engine with the configured backend and a caller-chosen run id.
    pub fn with_run_id(config: RunnerConfig, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let sandbox = sandbox::from_config(&config, &run_id);
        Self::with_sandbox(config, sandbox, run_id)
    }

    /// Creates an engine around an existing sandbox.
    pub fn with_sandbox(
        config: RunnerConfig,
        sandbox: Box<dyn Sandbox>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            sandbox: Some(sandbox),
            config,
            run_id: run_id.into(),
            preserve: false,
            armed: false,
        }
    }

    /// Keeps the workspace after the run for inspection.
    pub fn preserve_workspace(mut self, preserve: bool) -> Self {
        self.preserve = preserve;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn sandbox(&mut self) -> Result<&mut (dyn Sandbox + 'static)> {
        self.sandbox
            .as_deref_mut()
            .ok_or_else(|| Error::Sandbox("sandbox was already torn down".to_string()))
    }

    /// Cleans up and releases the sandbox. Runs at most once.
    async fn teardown(&mut self) {
        if let Some(mut sandbox) = self.sandbox.take() {
            sandbox.cleanup(self.preserve).await;
        }
        self.armed = false;
    }

    /// Executes every step of `document` until one fails.
    ///
    /// Returns `Err` only for failures with no step to attribute them to:
    /// unmet prerequisites and sandbox setup. Step failures are reported in
    /// the returned [`RunResult`].
    pub async fn execute(mut self, document: &Document) -> Result<RunResult> {
        let started = Instant::now();
        let (sandbox_name, workspace) = {
            let sandbox = self.sandbox()?;
            (sandbox.name().to_string(), sandbox.host_path().to_path_buf())
        };
        tracing::info!(
            run_id = %self.run_id,
            sandbox = %sandbox_name,
            steps = document.steps.len(),
            title = ?document.metadata.title,
            "starting run"
        );

        let problems = prereq::missing(&document.prerequisites).await;
        if !problems.is_empty() {
            tracing::error!(problems = ?problems, "prerequisites not met");
            return Err(Error::Prerequisites(problems));
        }

        self.armed = true;
        let initialized = self.sandbox()?.initialize().await;
        if let Err(e) = initialized {
            tracing::error!(error = %e, "failed to initialize sandbox");
            self.teardown().await;
            return Err(e);
        }

        let mut state = InterpreterState::new(document.working_directory.as_deref());
        let mut steps = Vec::with_capacity(document.steps.len());

        for op in &document.steps {
            let (step, next) = self.dispatch(document, op, state).await;
            state = next;
            let failed = !step.success;
            steps.push(step);
            if failed {
                break;
            }
        }

        self.teardown().await;

        let success = steps.iter().all(|s| s.success);
        let result = RunResult {
            run_id: self.run_id.clone(),
            sandbox: sandbox_name,
            workspace,
            total_steps: document.steps.len(),
            success,
            duration_ms: elapsed_ms(started),
            steps,
        };

        tracing::info!(
            run_id = %result.run_id,
            success = result.success,
            executed = result.steps.len(),
            total = result.total_steps,
            duration_ms = result.duration_ms,
            "run finished"
        );
        Ok(result)
    }

    /// Runs one operation. Never fails: every error becomes a failed step.
    async fn dispatch(
        &mut self,
        document: &Document,
        op: &Operation,
        state: InterpreterState,
    ) -> (StepResult, InterpreterState) {
        let started = Instant::now();
        tracing::info!(
            step = %op.id,
            ordinal = op.ordinal,
            kind = op.kind_label(),
            "executing step"
        );

        let (outcome, state) = match &op.kind {
            OperationKind::Run(run) => self.run_step(document, run, state).await,
            OperationKind::Edit(edit) => (self.edit_step(edit).await, state),
            OperationKind::Check(check) => {
                let outcome = match &check.check {
                    Assertion::CliOutput(check) => {
                        self.command_check(document, check, &state).await
                    }
                    Assertion::FileState(check) => self.file_check(check).await,
                    Assertion::UiState(_) => {
                        Outcome::failed("UI state checks are not yet implemented", None)
                    }
                };
                (outcome, state)
            }
        };

        if outcome.success {
            tracing::info!(step = %op.id, "step succeeded");
        } else {
            tracing::warn!(step = %op.id, error = ?outcome.error, "step failed");
        }

        let step = StepResult {
            id: op.id.clone(),
            ordinal: op.ordinal,
            kind: op.kind_label().to_string(),
            description: op.description.clone(),
            success: outcome.success,
            error: outcome.error,
            output: outcome.output,
            duration_ms: elapsed_ms(started),
        };
        (step, state)
    }

    async fn run_step(
        &mut self,
        document: &Document,
        run: &RunOperation,
        state: InterpreterState,
    ) -> (Outcome, InterpreterState) {
        let env = state.command_env(&document.env, &run.env);
        let mut spec = command_spec(&run.command, run.working_directory.as_deref(), env, &state);
        if let Some(secs) = run.timeout_secs {
            spec = spec.with_timeout(Duration::from_secs(secs));
        }

        let output = match self.run_command(&spec).await {
            Ok(output) => output,
            Err(e) => return (Outcome::failed(e.to_string(), None), state),
        };

        if output.exit_code != run.expect_exit_code {
            let error = format!(
                "command exited with {} (expected {})",
                output.exit_code, run.expect_exit_code
            );
            return (Outcome::failed(error, Some(self.report(&output.combined()))), state);
        }

        let captured = run
            .capture_output
            .then(|| self.report(&output.stdout));

        let state = self.track_session(&spec, state).await;
        (Outcome::passed(captured), state)
    }

    /// Updates the session after a successful command: `cd` and `export`.
    async fn track_session(
        &mut self,
        spec: &CommandSpec,
        mut state: InterpreterState,
    ) -> InterpreterState {
        if let Some((key, value)) = state::parse_export(&spec.command) {
            tracing::debug!(var = %key, "tracking exported variable");
            return state.with_var(key, value);
        }

        let ran_in = spec.working_dir.as_deref().unwrap_or("");
        let cwd = match state::plan_cd(ran_in, &spec.command) {
            CdUpdate::Unchanged => return state,
            CdUpdate::Local(cwd) => Some(cwd),
            CdUpdate::Probe(clause) => self.probe_cd(spec, &clause).await,
        };

        if let Some(cwd) = cwd {
            tracing::debug!(cwd = %cwd, "working directory changed");
            state.cwd = cwd;
        }
        state
    }

    /// Asks the sandbox's shell where a `cd` clause lands.
    async fn probe_cd(&mut self, spec: &CommandSpec, clause: &str) -> Option<String> {
        let root = self.sandbox.as_deref()?.root().to_string_lossy().to_string();
        let probe = CommandSpec {
            command: state::probe_command(&root, clause),
            ..spec.clone()
        };
        match self.run_command(&probe).await {
            Ok(out) if out.exit_code == 0 => state::parse_probe(&out.stdout),
            Ok(out) => {
                tracing::warn!(exit_code = out.exit_code, clause = %clause, "cd probe failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, clause = %clause, "cd probe failed");
                None
            }
        }
    }

    async fn run_command(&mut self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.sandbox()?.run(spec).await
    }

    async fn edit_step(&mut self, edit: &EditStep) -> Outcome {
        let applied = async { self.sandbox()?.apply_edit(edit).await }.await;
        match applied {
            Ok(()) => Outcome::passed(None),
            Err(e) => Outcome::failed(e.to_string(), None),
        }
    }

    async fn command_check(
        &mut self,
        document: &Document,
        check: &CommandOutputCheck,
        state: &InterpreterState,
    ) -> Outcome {
        let env = state.command_env(&document.env, &check.env);
        let spec = command_spec(&check.command, check.working_directory.as_deref(), env, state);

        let output = match self.run_command(&spec).await {
            Ok(output) => output,
            Err(e) => return Outcome::failed(e.to_string(), None),
        };

        let failures = checks::command_output(check, &output);
        let report = Some(self.report(&output.combined()));
        if failures.is_empty() {
            Outcome::passed(report)
        } else {
            Outcome::failed(failures.join("; "), report)
        }
    }

    async fn file_check(&mut self, check: &FileStateCheck) -> Outcome {
        let content = match self.read_if_exists(&check.path).await {
            Ok(content) => content,
            Err(e) => return Outcome::failed(e.to_string(), None),
        };

        let failures = checks::file_state(check, content.as_deref());
        if failures.is_empty() {
            Outcome::passed(None)
        } else {
            Outcome::failed(failures.join("; "), None)
        }
    }

    async fn read_if_exists(&mut self, path: &str) -> Result<Option<String>> {
        let sandbox = self.sandbox()?;
        if !sandbox.file_exists(path).await? {
            return Ok(None);
        }
        Ok(Some(sandbox.read_file(path).await?))
    }

    fn report(&self, output: &str) -> String {
        truncate_output(output, self.config.report_output_chars)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(mut sandbox) = self.sandbox.take() else {
            return;
        };
        let preserve = self.preserve;
        tracing::warn!(run_id = %self.run_id, "run abandoned, tearing down sandbox");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    sandbox.cleanup(preserve).await;
                });
            }
            Err(_) => tracing::error!(
                run_id = %self.run_id,
                path = ?sandbox.host_path(),
                "no async runtime to tear down sandbox, workspace left behind"
            ),
        }
    }
}

/// A step override is relative to the root; otherwise the session cwd applies.
fn command_spec(
    command: &str,
    dir: Option<&str>,
    env: BTreeMap<String, String>,
    state: &InterpreterState,
) -> CommandSpec {
    CommandSpec::new(command)
        .with_working_dir(dir.unwrap_or(&state.cwd))
        .with_env(env)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
