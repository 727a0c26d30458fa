//! Interpreter state threaded through step dispatch.
//!
//! Every command runs in a fresh shell, so the engine keeps its own notion of
//! the session: a logical working directory and an environment overlay. Both
//! are inferred from command text after a command succeeds.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Logical shell session state for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterState {
    /// Working directory relative to the workspace root. Empty means the root;
    /// an absolute path means the session left the workspace.
    pub cwd: String,
    /// Variables exported by earlier steps.
    pub env: BTreeMap<String, String>,
}

impl InterpreterState {
    /// Initial state, starting in `base_dir` (relative to the root) if given.
    pub fn new(base_dir: Option<&str>) -> Self {
        Self {
            cwd: base_dir.map(|d| normalize("", d)).unwrap_or_default(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Layers the document env, then this session's exports, then step env.
    pub fn command_env(
        &self,
        global: &BTreeMap<String, String>,
        step: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = global.clone();
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(step.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// How a successful command changes the logical working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdUpdate {
    /// Not a `cd` command.
    Unchanged,
    /// New directory computed without touching the sandbox.
    Local(String),
    /// Only a shell can resolve the target; run this `cd` clause and ask `pwd`.
    Probe(String),
}

static CD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^cd(\s.*)?$").expect("cd regex is valid"));

static EXPORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^export\s+([A-Za-z_][A-Za-z0-9_]*)=("[^"$`]*"|'[^']*'|[^\s"'$`;&|]*)$"#)
        .expect("export regex is valid")
});

/// Decides how `command`, issued from `cwd`, moves the session.
///
/// Only the leading `cd` clause counts: `cd app && npm install` moves to
/// `app`.
pub fn plan_cd(cwd: &str, command: &str) -> CdUpdate {
    let command = command.trim();
    if !CD_PATTERN.is_match(command) {
        return CdUpdate::Unchanged;
    }

    let clause = first_clause(command);
    let target = unquote(clause["cd".len()..].trim());

    if target.is_empty() || needs_shell(target) {
        return CdUpdate::Probe(clause.to_string());
    }
    CdUpdate::Local(normalize(cwd, target))
}

/// Text up to the first list or pipe operator.
fn first_clause(command: &str) -> &str {
    let end = ["&&", "||", ";", "|", "\n"]
        .iter()
        .filter_map(|op| command.find(op))
        .min()
        .unwrap_or(command.len());
    command[..end].trim_end()
}

fn unquote(target: &str) -> &str {
    for quote in ['"', '\''] {
        if target.len() >= 2 && target.starts_with(quote) && target.ends_with(quote) {
            return &target[1..target.len() - 1];
        }
    }
    target
}

/// Targets a local join cannot resolve: home, absolute, options, expansions.
fn needs_shell(target: &str) -> bool {
    target.starts_with('~')
        || target.starts_with('/')
        || target.starts_with('-')
        || target
            .chars()
            .any(|c| c.is_whitespace() || "$`*?[{()\\".contains(c))
}

/// Joins `target` onto `cwd`, resolving `.` and `..`. Popping past the
/// workspace root stops at the root.
pub fn normalize(cwd: &str, target: &str) -> String {
    let absolute = cwd.starts_with('/');
    let mut parts: Vec<&str> = cwd.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Builds the probe command for a `cd` clause.
///
/// Prints the physical workspace root, then the directory the clause lands
/// in, so symlinked roots still compare equal.
pub fn probe_command(root: &str, clause: &str) -> String {
    format!(
        "printf '%s\\n' \"$(cd {} && pwd -P)\"; {} && pwd -P",
        crate::sandbox::shell_quote(root),
        clause
    )
}

/// Interprets probe output as a workspace-relative directory.
pub fn parse_probe(output: &str) -> Option<String> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let root = lines.next()?;
    let target = lines.last()?;
    Some(relative_to(root, target))
}

/// Strips `root` from an absolute path. Paths outside the root stay absolute.
pub fn relative_to(root: &str, path: &str) -> String {
    let root = root.trim_end_matches('/');
    if path == root {
        return String::new();
    }
    match path.strip_prefix(root).and_then(|rest| rest.strip_prefix('/')) {
        Some(rest) if !root.is_empty() => rest.trim_end_matches('/').to_string(),
        _ => path.to_string(),
    }
}

/// Recognizes a single literal `export NAME=value`.
pub fn parse_export(command: &str) -> Option<(String, String)> {
    let caps = EXPORT_PATTERN.captures(command.trim())?;
    let name = caps.get(1)?.as_str().to_string();
    let value = unquote(caps.get(2)?.as_str()).to_string();
    Some((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cd_dot_dot_pops_one_segment() {
        assert_eq!(plan_cd("a/b", "cd .."), CdUpdate::Local("a".to_string()));
        assert_eq!(plan_cd("a", "cd .."), CdUpdate::Local(String::new()));
        assert_eq!(plan_cd("a/b/c", "cd ../.."), CdUpdate::Local("a".to_string()));
    }

    #[test]
    fn cd_past_root_stays_at_root() {
        assert_eq!(plan_cd("", "cd .."), CdUpdate::Local(String::new()));
    }

    #[test]
    fn relative_cd_joins() {
        assert_eq!(plan_cd("", "cd app"), CdUpdate::Local("app".to_string()));
        assert_eq!(
            plan_cd("app", "cd src/components/"),
            CdUpdate::Local("app/src/components".to_string())
        );
        assert_eq!(plan_cd("a/b", "cd ../c"), CdUpdate::Local("a/c".to_string()));
        assert_eq!(plan_cd("", "cd \"my app\""), CdUpdate::Probe("cd \"my app\"".to_string()));
        assert_eq!(plan_cd("", "cd 'app'"), CdUpdate::Local("app".to_string()));
    }

    #[test]
    fn only_the_leading_clause_counts() {
        assert_eq!(
            plan_cd("", "cd app && npm install"),
            CdUpdate::Local("app".to_string())
        );
        assert_eq!(plan_cd("", "cd web; ls"), CdUpdate::Local("web".to_string()));
    }

    #[test]
    fn home_absolute_and_bare_cd_probe() {
        assert_eq!(plan_cd("a", "cd"), CdUpdate::Probe("cd".to_string()));
        assert_eq!(plan_cd("a", "cd ~"), CdUpdate::Probe("cd ~".to_string()));
        assert_eq!(plan_cd("a", "cd /tmp"), CdUpdate::Probe("cd /tmp".to_string()));
        assert_eq!(
            plan_cd("a", "cd $HOME/src && ls"),
            CdUpdate::Probe("cd $HOME/src".to_string())
        );
    }

    #[test]
    fn non_cd_commands_are_unchanged() {
        assert_eq!(plan_cd("a", "cdk deploy"), CdUpdate::Unchanged);
        assert_eq!(plan_cd("a", "echo cd .."), CdUpdate::Unchanged);
    }

    #[test]
    fn absolute_state_stays_absolute() {
        assert_eq!(normalize("/home/user", "projects"), "/home/user/projects");
        assert_eq!(normalize("/home", ".."), "/");
    }

    #[test]
    fn probe_output_maps_back_to_workspace() {
        assert_eq!(
            parse_probe("/private/tmp/ws\n/private/tmp/ws/app/src\n"),
            Some("app/src".to_string())
        );
        assert_eq!(parse_probe("/tmp/ws\n/tmp/ws\n"), Some(String::new()));
        assert_eq!(parse_probe("/tmp/ws\n/home/user\n"), Some("/home/user".to_string()));
        assert_eq!(parse_probe(""), None);
    }

    #[test]
    fn relative_to_requires_a_segment_boundary() {
        assert_eq!(relative_to("/tmp/ws", "/tmp/ws2"), "/tmp/ws2");
        assert_eq!(relative_to("/tmp/ws/", "/tmp/ws/a"), "a");
    }

    #[test]
    fn exports_are_recognized() {
        assert_eq!(
            parse_export("export NODE_ENV=production"),
            Some(("NODE_ENV".to_string(), "production".to_string()))
        );
        assert_eq!(
            parse_export("export GREETING='hello world'"),
            Some(("GREETING".to_string(), "hello world".to_string()))
        );
        assert_eq!(parse_export("export PATH=$PATH:/opt/bin"), None);
        assert_eq!(parse_export("export A=1 && echo hi"), None);
    }

    #[test]
    fn command_env_layers_step_over_session_over_global() {
        let state = InterpreterState::new(None).with_var("MODE", "session");
        let mut global = BTreeMap::new();
        global.insert("MODE".to_string(), "global".to_string());
        global.insert("KEEP".to_string(), "yes".to_string());

        let env = state.command_env(&global, &BTreeMap::new());
        assert_eq!(env["MODE"], "session");
        assert_eq!(env["KEEP"], "yes");

        let mut step = BTreeMap::new();
        step.insert("MODE".to_string(), "step".to_string());
        assert_eq!(state.command_env(&global, &step)["MODE"], "step");
    }

    #[test]
    fn base_directory_is_normalized() {
        assert_eq!(InterpreterState::new(Some("./app/")).cwd, "app");
        assert_eq!(InterpreterState::new(None).cwd, "");
    }
}
