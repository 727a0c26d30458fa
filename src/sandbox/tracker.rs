//! Best-effort tracking of background processes started by host commands.
//!
//! Commands like `npm run dev &` return immediately while their server keeps
//! running. The tracker guesses at those processes from the command text and
//! the workspace path so they can be reaped at teardown. Nothing here ever
//! fails a run: discovery and kill problems are logged and swallowed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::RunnerConfig;

/// Well-known development-server ports, keyed by a command substring.
const DEV_SERVER_PORTS: &[(&str, u16)] = &[
    ("vite", 5173),
    ("next dev", 3000),
    ("npm start", 3000),
    ("npm run dev", 3000),
    ("yarn dev", 3000),
    ("pnpm dev", 3000),
    ("react-scripts start", 3000),
    ("rails s", 3000),
    ("ng serve", 4200),
    ("flask run", 5000),
    ("http.server", 8000),
    ("runserver", 8000),
    ("uvicorn", 8000),
    ("webpack serve", 8080),
];

/// A process (or process group) the tracker will reap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProcessHandle {
    Pid(i32),
    Group(i32),
}

/// Replaceable discovery and teardown of background processes.
#[async_trait]
pub trait BackgroundTracker: Send + Sync {
    /// Returns true if the command text signals background intent.
    fn is_background(&self, command: &str) -> bool;

    /// Discovers processes started by `command` running in `cwd`.
    async fn track(&self, command: &str, cwd: &Path) -> Vec<ProcessHandle>;

    /// Terminates a process gracefully, escalating to SIGKILL.
    async fn kill(&self, handle: ProcessHandle);

    /// Kills any remaining process whose command line references `workspace`.
    async fn sweep(&self, workspace: &Path);
}

/// Default tracker: command-text heuristics plus `lsof`/`pgrep` discovery.
#[derive(Debug, Clone)]
pub struct HeuristicTracker {
    workspace: PathBuf,
    settle: Duration,
    grace: Duration,
}

impl HeuristicTracker {
    pub fn new(workspace: impl Into<PathBuf>, settle: Duration, grace: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            settle,
            grace,
        }
    }

    /// Tracker for `workspace` using the configured timings.
    pub fn from_config(config: &RunnerConfig, workspace: impl Into<PathBuf>) -> Self {
        Self::new(workspace, config.background_settle(), config.kill_grace())
    }
}

// A lone `&`: not `&&`, not a redirection like `2>&1`, `&>` or `|&`.
static BACKGROUND_OPERATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^&>|])&(?:\s*$|\s*[^&>\s])").expect("background operator regex is valid")
});

static DETACH_WRAPPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:nohup|disown|setsid)\b").expect("detach wrapper regex is valid")
});

static EXPLICIT_PORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:--port[=\s]+|-p\s+|PORT=|localhost:|127\.0\.0\.1:|0\.0\.0\.0:)(\d{2,5})\b")
        .expect("port regex is valid")
});

/// Returns true if the command backgrounds work (`cmd &`, `nohup cmd`).
pub fn is_background_command(command: &str) -> bool {
    BACKGROUND_OPERATOR.is_match(command) || DETACH_WRAPPER.is_match(command)
}

/// Extracts ports named in the command text, plus well-known dev-server ports.
pub fn candidate_ports(command: &str) -> Vec<u16> {
    let mut ports = BTreeSet::new();
    for caps in EXPLICIT_PORT.captures_iter(command) {
        if let Some(port) = caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()) {
            ports.insert(port);
        }
    }
    if ports.is_empty() {
        for (needle, port) in DEV_SERVER_PORTS {
            if command.contains(needle) {
                ports.insert(*port);
            }
        }
    }
    ports.into_iter().collect()
}

#[async_trait]
impl BackgroundTracker for HeuristicTracker {
    fn is_background(&self, command: &str) -> bool {
        is_background_command(command)
    }

    async fn track(&self, command: &str, cwd: &Path) -> Vec<ProcessHandle> {
        tokio::time::sleep(self.settle).await;

        let mut pids = BTreeSet::new();
        for port in candidate_ports(command) {
            let found = list_pids("lsof", &["-t", "-i", &format!("tcp:{}", port)]).await;
            if !found.is_empty() {
                tracing::debug!(port, pids = ?found, "found listeners on port");
            }
            pids.extend(found);
        }

        let scope = self.workspace.to_string_lossy().to_string();
        pids.extend(list_pids("pgrep", &["-f", &scope]).await);

        let own = i32::try_from(std::process::id()).unwrap_or_default();
        pids.remove(&own);

        tracing::info!(
            command = %command,
            cwd = ?cwd,
            pids = ?pids,
            "tracked background processes"
        );
        pids.into_iter().map(ProcessHandle::Pid).collect()
    }

    async fn kill(&self, handle: ProcessHandle) {
        if !is_alive(handle) {
            return;
        }
        signal(handle, Signal::SIGTERM);

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if !is_alive(handle) {
                tracing::debug!(?handle, "process exited after SIGTERM");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tracing::debug!(?handle, "escalating to SIGKILL");
        signal(handle, Signal::SIGKILL);
    }

    async fn sweep(&self, workspace: &Path) {
        let scope = workspace.to_string_lossy().to_string();
        let own = i32::try_from(std::process::id()).unwrap_or_default();
        for pid in list_pids("pgrep", &["-f", &scope]).await {
            if pid == own {
                continue;
            }
            tracing::info!(pid, "sweeping leftover workspace process");
            signal(ProcessHandle::Pid(pid), Signal::SIGKILL);
        }
    }
}

/// Sends `sig` to a handle. ESRCH (already gone) is silently ignored.
pub(crate) fn signal(handle: ProcessHandle, sig: Signal) {
    let result = match handle {
        ProcessHandle::Pid(pid) => kill(Pid::from_raw(pid), sig),
        ProcessHandle::Group(pgid) => killpg(Pid::from_raw(pgid), sig),
    };
    match result {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(?handle, signal = ?sig, error = %e, "failed to signal process"),
    }
}

fn is_alive(handle: ProcessHandle) -> bool {
    let probe = match handle {
        ProcessHandle::Pid(pid) => kill(Pid::from_raw(pid), None),
        ProcessHandle::Group(pgid) => killpg(Pid::from_raw(pgid), None),
    };
    probe.is_ok()
}

/// Runs a pid-listing tool and parses one pid per line. Missing tools yield nothing.
async fn list_pids(program: &str, args: &[&str]) -> Vec<i32> {
    match Command::new(program).args(args).output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .filter(|pid| *pid > 0)
            .collect(),
        Err(e) => {
            tracing::debug!(program, error = %e, "process discovery tool unavailable");
            Vec::new()
        }
    }
}
