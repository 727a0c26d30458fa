//! Assertion evaluation.
//!
//! Each evaluator returns every failing predicate's message. An empty list
//! means the check passed.

use regex::Regex;

use crate::document::{CommandOutputCheck, FileStateCheck};
use crate::sandbox::CommandOutput;

/// Evaluates a command-output check against captured output.
pub fn command_output(check: &CommandOutputCheck, output: &CommandOutput) -> Vec<String> {
    let mut failures = Vec::new();

    if let Some(expected) = &check.contains {
        if !output.stdout.contains(expected.as_str()) {
            failures.push(format!("stdout does not contain {:?}", expected));
        }
    }
    if let Some(expected) = &check.contains_error {
        if !output.stderr.contains(expected.as_str()) {
            failures.push(format!("stderr does not contain {:?}", expected));
        }
    }
    if let Some(pattern) = &check.matches {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(&output.combined()) => {}
            Ok(_) => failures.push(format!("output does not match /{}/", pattern)),
            Err(e) => failures.push(format!("invalid pattern /{}/: {}", pattern, e)),
        }
    }
    if let Some(code) = check.exit_code {
        if output.exit_code != code {
            failures.push(format!(
                "exit code {} (expected {})",
                output.exit_code, code
            ));
        }
    }

    failures
}

/// Evaluates a file-state check. `content` is the file's text when it exists.
///
/// Existence is decided first; content predicates only run on a file that
/// exists and is expected to.
pub fn file_state(check: &FileStateCheck, content: Option<&str>) -> Vec<String> {
    let should_exist = check.exists.unwrap_or(true);

    let content = match (should_exist, content) {
        (true, None) => return vec![format!("file {} does not exist", check.path)],
        (false, Some(_)) => return vec![format!("file {} exists but should not", check.path)],
        (false, None) => return Vec::new(),
        (true, Some(content)) => normalize_newlines(content),
    };

    let mut failures = Vec::new();
    if let Some(expected) = &check.contains {
        if !content.contains(&normalize_newlines(expected)) {
            failures.push(format!("{} does not contain {:?}", check.path, expected));
        }
    }
    if let Some(expected) = &check.equals {
        if content != normalize_newlines(expected) {
            failures.push(format!(
                "{} does not equal the expected content ({} vs {} bytes)",
                check.path,
                content.len(),
                expected.len()
            ));
        }
    }
    if let Some(pattern) = &check.matches {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(&content) => {}
            Ok(_) => failures.push(format!("{} does not match /{}/", check.path, pattern)),
            Err(e) => failures.push(format!("invalid pattern /{}/: {}", pattern, e)),
        }
    }
    failures
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(exit_code: i32, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn cli_check() -> CommandOutputCheck {
        CommandOutputCheck {
            command: "true".to_string(),
            contains: None,
            contains_error: None,
            matches: None,
            exit_code: None,
            working_directory: None,
            env: Default::default(),
        }
    }

    fn file_check(path: &str) -> FileStateCheck {
        FileStateCheck {
            path: path.to_string(),
            exists: None,
            contains: None,
            equals: None,
            matches: None,
        }
    }

    #[test]
    fn all_predicates_must_hold() {
        let check = CommandOutputCheck {
            contains: Some("ready".to_string()),
            contains_error: Some("warn".to_string()),
            matches: Some(r"v\d+\.\d+".to_string()),
            exit_code: Some(0),
            ..cli_check()
        };
        assert!(command_output(&check, &output(0, "server ready v1.2", "warn: x")).is_empty());
    }

    #[test]
    fn every_failing_predicate_is_reported() {
        let check = CommandOutputCheck {
            contains: Some("ready".to_string()),
            exit_code: Some(0),
            ..cli_check()
        };
        let failures = command_output(&check, &output(1, "crashed", ""));
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("stdout does not contain"));
        assert!(failures[1].contains("exit code 1 (expected 0)"));
    }

    #[test]
    fn matches_runs_against_combined_output() {
        let check = CommandOutputCheck {
            matches: Some("^error: .*$".to_string()),
            ..cli_check()
        };
        assert!(!command_output(&check, &output(0, "line", "error: boom")).is_empty());

        let check = CommandOutputCheck {
            matches: Some("(?m)^error: .*$".to_string()),
            ..cli_check()
        };
        assert!(command_output(&check, &output(0, "line", "error: boom")).is_empty());
    }

    #[test]
    fn missing_file_short_circuits_content_checks() {
        let check = FileStateCheck {
            contains: Some("x".to_string()),
            ..file_check("a.txt")
        };
        let failures = file_state(&check, None);
        assert_eq!(failures, vec!["file a.txt does not exist".to_string()]);
    }

    #[test]
    fn absent_file_expectation() {
        let check = FileStateCheck {
            exists: Some(false),
            ..file_check("gone.txt")
        };
        assert!(file_state(&check, None).is_empty());
        assert_eq!(file_state(&check, Some("still here")).len(), 1);
    }

    #[test]
    fn equals_ignores_line_ending_style() {
        let check = FileStateCheck {
            equals: Some("line one\nline two\n".to_string()),
            ..file_check("f")
        };
        assert!(file_state(&check, Some("line one\nline two\n")).is_empty());
        assert!(file_state(&check, Some("line one\r\nline two\r\n")).is_empty());

        let crlf_expected = FileStateCheck {
            equals: Some("a\r\nb".to_string()),
            ..file_check("f")
        };
        assert!(file_state(&crlf_expected, Some("a\nb")).is_empty());
    }

    #[test]
    fn content_predicates_accumulate() {
        let check = FileStateCheck {
            contains: Some("needle".to_string()),
            matches: Some("^\\{".to_string()),
            ..file_check("f.json")
        };
        assert_eq!(file_state(&check, Some("haystack")).len(), 2);
        assert!(file_state(&check, Some("{ needle }")).is_empty());
    }
}
