//! Prerequisite checks run once before a workspace is created.

use tokio::process::Command;

use crate::document::Prerequisites;

/// Returns a message for every missing command or environment variable.
pub async fn missing(prereqs: &Prerequisites) -> Vec<String> {
    let mut problems = Vec::new();

    for command in &prereqs.commands {
        if !command_available(command).await {
            problems.push(format!("required command '{}' was not found on PATH", command));
        }
    }
    for var in &prereqs.env {
        if std::env::var_os(var).is_none() {
            problems.push(format!("required environment variable '{}' is not set", var));
        }
    }

    if problems.is_empty() && !prereqs.is_empty() {
        tracing::debug!(
            commands = prereqs.commands.len(),
            env = prereqs.env.len(),
            "prerequisites satisfied"
        );
    }
    problems
}

/// Probes with `command -v`, falling back to `which`.
async fn command_available(name: &str) -> bool {
    let probe = Command::new("sh")
        .arg("-c")
        .arg(r#"command -v "$1" >/dev/null 2>&1 || which "$1" >/dev/null 2>&1"#)
        .arg("sh")
        .arg(name)
        .output()
        .await;

    match probe {
        Ok(output) => output.status.success(),
        Err(e) => {
            tracing::warn!(command = %name, error = %e, "failed to probe for command");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn present_prerequisites_pass() {
        let prereqs = Prerequisites {
            commands: vec!["sh".to_string()],
            env: vec!["PATH".to_string()],
        };
        assert!(missing(&prereqs).await.is_empty());
    }

    #[tokio::test]
    async fn every_missing_item_is_reported() {
        let prereqs = Prerequisites {
            commands: vec![
                "definitely-not-a-real-command-xyz".to_string(),
                "sh".to_string(),
            ],
            env: vec!["TUTORIAL_RUNNER_SURELY_UNSET_VAR".to_string()],
        };
        let problems = missing(&prereqs).await;
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("definitely-not-a-real-command-xyz"));
        assert!(problems[1].contains("TUTORIAL_RUNNER_SURELY_UNSET_VAR"));
    }

    #[tokio::test]
    async fn shell_metacharacters_are_not_interpreted() {
        let prereqs = Prerequisites {
            commands: vec!["sh; exit 0".to_string()],
            env: Vec::new(),
        };
        assert_eq!(missing(&prereqs).await.len(), 1);
    }
}
