//! Tutorial Runner CLI
//!
//! Executes an operation document in a disposable sandbox and reports the
//! outcome of each step.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use tutorial_runner::{Document, Engine, RunResult, RunnerConfig, SandboxKind, Validate};

#[derive(Parser)]
#[command(author, version, long_about = None)]
#[command(name = "tutorial-runner")]
#[command(about = "Run a tutorial's operations in a disposable sandbox")]
struct Cli {
    /// Operation document (YAML or JSON)
    document: PathBuf,

    /// Keep the workspace after the run for inspection
    #[arg(long)]
    preserve: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Capture screenshots for UI checks (handled by the browser collaborator)
    #[arg(long)]
    screenshots: bool,

    /// Isolation backend (overrides the config file)
    #[arg(long, value_enum)]
    sandbox: Option<SandboxArg>,

    /// Runner configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the run result as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SandboxArg {
    Host,
    Container,
}

impl From<SandboxArg> for SandboxKind {
    fn from(arg: SandboxArg) -> Self {
        match arg {
            SandboxArg::Host => SandboxKind::Host,
            SandboxArg::Container => SandboxKind::Container,
        }
    }
}

/// Exit status for failures outside any step: bad input, prerequisites, sandbox setup.
const EXIT_INFRASTRUCTURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => match RunnerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::from(EXIT_INFRASTRUCTURE);
            }
        },
        None => RunnerConfig::from_env(),
    };
    let config = match cli.sandbox {
        Some(kind) => config.with_sandbox(kind.into()),
        None => config,
    };

    match config.validate().into_result() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!("{}", warning);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_INFRASTRUCTURE);
        }
    }

    if cli.screenshots {
        tracing::info!("screenshot capture is delegated to the browser automation collaborator");
    }

    let document = match Document::load(&cli.document) {
        Ok(document) => document,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(EXIT_INFRASTRUCTURE);
        }
    };

    let engine = Engine::new(config).preserve_workspace(cli.preserve);
    tracing::info!(run_id = %engine.run_id(), document = ?cli.document, "running document");

    let result = match engine.execute(&document).await {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Run aborted: {}", e);
            return ExitCode::from(EXIT_INFRASTRUCTURE);
        }
    };

    print_summary(&result, cli.preserve);

    if let Some(path) = &cli.report {
        let written = serde_json::to_string_pretty(&result)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            eprintln!("Failed to write report to {}: {}", path.display(), e);
        }
    }

    if result.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_summary(result: &RunResult, preserved: bool) {
    println!("\n{}", "=".repeat(60));
    println!("Run {}", result.run_id);
    println!("{}", "=".repeat(60));
    println!();

    for step in &result.steps {
        let mark = if step.success { "PASS" } else { "FAIL" };
        println!(
            "[{}] #{} {} ({}, {} ms)",
            mark, step.ordinal, step.id, step.kind, step.duration_ms
        );
        if let Some(description) = &step.description {
            println!("       {}", description);
        }
        if let Some(error) = &step.error {
            println!("       error: {}", error);
        }
        if !step.success {
            if let Some(output) = &step.output {
                for line in output.lines() {
                    println!("       | {}", line);
                }
            }
        }
    }

    println!();
    println!(
        "Executed {} of {} steps in {} ms on the {} sandbox",
        result.steps.len(),
        result.total_steps,
        result.duration_ms,
        result.sandbox
    );
    if preserved {
        println!("Workspace preserved at {}", result.workspace.display());
    }
    println!("Result: {}", if result.is_complete() { "SUCCESS" } else { "FAILED" });
}
