//! Structural validation of raw operation documents.
//!
//! Validation walks the untyped tree so that every problem can be reported at
//! once. The extraction layer feeds the full list back into its retry prompt,
//! so a single opaque deserialization error is not enough.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const OPERATION_KINDS: &[&str] = &["run", "edit", "check"];
const EDIT_KINDS: &[&str] = &["replace", "line-diff", "context"];
const ANCHOR_ACTIONS: &[&str] = &["before", "after", "replace"];
const ASSERTION_KINDS: &[&str] = &["cli-output", "file-state", "ui-state"];

/// A single validation problem at a field path such as `steps[2].operation.type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub problem: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            problem: problem.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.problem)
    }
}

/// Validates a raw document tree, returning every issue found.
pub fn validate_value(value: &Value) -> Vec<ValidationIssue> {
    let mut v = Validator::default();

    let Some(root) = value.as_object() else {
        v.issue("$", "document must be a mapping");
        return v.issues;
    };

    v.optional_object(root, "$", "metadata");
    v.optional_string(root, "$", "working_directory");
    v.string_map(root, "$", "env");

    if let Some(prereqs) = v.optional_object(root, "$", "prerequisites") {
        v.string_list(prereqs, "prerequisites", "commands");
        v.string_list(prereqs, "prerequisites", "env");
    }

    match root.get("steps") {
        None => v.issue("steps", "is required"),
        Some(Value::Array(steps)) => {
            let mut seen = HashSet::new();
            for (index, step) in steps.iter().enumerate() {
                v.operation(&format!("steps[{}]", index), step, &mut seen);
            }
        }
        Some(_) => v.issue("steps", "must be a list"),
    }

    v.issues
}

#[derive(Default)]
struct Validator {
    issues: Vec<ValidationIssue>,
}

impl Validator {
    fn issue(&mut self, path: impl Into<String>, problem: impl Into<String>) {
        self.issues.push(ValidationIssue::new(path, problem));
    }

    fn operation(&mut self, path: &str, value: &Value, seen: &mut HashSet<String>) {
        let Some(op) = value.as_object() else {
            self.issue(path, "operation must be a mapping");
            return;
        };

        if let Some(id) = self.required_string(op, path, "id") {
            if id.trim().is_empty() {
                self.issue(format!("{}.id", path), "must not be empty");
            } else if !seen.insert(id.to_string()) {
                self.issue(format!("{}.id", path), format!("duplicate id '{}'", id));
            }
        }

        match op.get("ordinal") {
            None => self.issue(format!("{}.ordinal", path), "is required"),
            Some(ordinal) => match ordinal.as_u64() {
                Some(n) if n > 0 && u32::try_from(n).is_ok() => {}
                _ => self.issue(
                    format!("{}.ordinal", path),
                    "must be a positive integer",
                ),
            },
        }

        self.optional_string(op, path, "description");

        let Some(kind) = self.tag(op, path, "type", OPERATION_KINDS, "operation kind") else {
            return;
        };

        match kind {
            "run" => self.run(op, path),
            "edit" => self.edit(op, path),
            "check" => self.check(op, path),
            _ => {}
        }
    }

    fn run(&mut self, op: &Map<String, Value>, path: &str) {
        if let Some(command) = self.required_string(op, path, "command") {
            if command.trim().is_empty() {
                self.issue(format!("{}.command", path), "must not be empty");
            }
        }
        self.optional_string(op, path, "working_directory");
        self.string_map(op, path, "env");
        self.optional_bool(op, path, "capture_output");

        if let Some(code) = op.get("expect_exit_code") {
            if code.as_i64().and_then(|c| i32::try_from(c).ok()).is_none() {
                self.issue(format!("{}.expect_exit_code", path), "must be an integer");
            }
        }
        if let Some(timeout) = op.get("timeout_secs") {
            if !matches!(timeout.as_u64(), Some(t) if t > 0) {
                self.issue(format!("{}.timeout_secs", path), "must be a positive integer");
            }
        }
    }

    fn edit(&mut self, op: &Map<String, Value>, path: &str) {
        self.required_string(op, path, "path");

        let Some(operation) = op.get("operation") else {
            self.issue(format!("{}.operation", path), "is required");
            return;
        };
        let edit_path = format!("{}.operation", path);
        let Some(edit) = operation.as_object() else {
            self.issue(edit_path, "must be a mapping");
            return;
        };

        match self.tag(edit, &edit_path, "type", EDIT_KINDS, "edit kind") {
            Some("replace") => {
                self.required_string(edit, &edit_path, "content");
            }
            Some("line-diff") => self.line_diff(edit, &edit_path),
            Some("context") => {
                if let Some(pattern) = self.required_string(edit, &edit_path, "pattern") {
                    if pattern.is_empty() {
                        self.issue(format!("{}.pattern", edit_path), "must not be empty");
                    }
                }
                self.tag(edit, &edit_path, "action", ANCHOR_ACTIONS, "anchor action");
                self.required_string(edit, &edit_path, "content");
            }
            _ => {}
        }
    }

    fn line_diff(&mut self, edit: &Map<String, Value>, path: &str) {
        let has_any = ["remove_lines", "insert_lines", "find_replace"]
            .iter()
            .any(|key| edit.get(*key).is_some_and(|v| !v.is_null()));
        if !has_any {
            self.issue(
                path,
                "line-diff needs at least one of remove_lines, insert_lines, find_replace",
            );
        }

        if let Some(range) = self.optional_object(edit, path, "remove_lines") {
            let range_path = format!("{}.remove_lines", path);
            let start = self.required_index(range, &range_path, "start");
            let end = self.required_index(range, &range_path, "end");
            if let (Some(start), Some(end)) = (start, end) {
                if start > end {
                    self.issue(range_path, "start must not be greater than end");
                }
            }
        }

        if let Some(insert) = self.optional_object(edit, path, "insert_lines") {
            let insert_path = format!("{}.insert_lines", path);
            self.required_index(insert, &insert_path, "at");
            match insert.get("lines") {
                None => self.issue(format!("{}.lines", insert_path), "is required"),
                Some(Value::Array(lines)) if lines.iter().all(Value::is_string) => {}
                Some(_) => self.issue(
                    format!("{}.lines", insert_path),
                    "must be a list of strings",
                ),
            }
        }

        if let Some(find_replace) = self.optional_object(edit, path, "find_replace") {
            let fr_path = format!("{}.find_replace", path);
            if let Some(find) = self.required_string(find_replace, &fr_path, "find") {
                if find.is_empty() {
                    self.issue(format!("{}.find", fr_path), "must not be empty");
                }
            }
            self.required_string(find_replace, &fr_path, "replace");
        }
    }

    fn check(&mut self, op: &Map<String, Value>, path: &str) {
        let check_path = format!("{}.check", path);
        let Some(check) = op.get("check") else {
            self.issue(check_path, "is required");
            return;
        };
        let Some(check) = check.as_object() else {
            self.issue(check_path, "must be a mapping");
            return;
        };

        match self.tag(check, &check_path, "type", ASSERTION_KINDS, "check kind") {
            Some("cli-output") => {
                self.required_string(check, &check_path, "command");
                self.optional_string(check, &check_path, "contains");
                self.optional_string(check, &check_path, "contains_error");
                self.optional_string(check, &check_path, "working_directory");
                self.string_map(check, &check_path, "env");
                self.regex(check, &check_path, "matches");
                if let Some(code) = check.get("exit_code") {
                    if code.as_i64().and_then(|c| i32::try_from(c).ok()).is_none() {
                        self.issue(format!("{}.exit_code", check_path), "must be an integer");
                    }
                }
            }
            Some("file-state") => {
                self.required_string(check, &check_path, "path");
                self.optional_bool(check, &check_path, "exists");
                self.optional_string(check, &check_path, "contains");
                self.optional_string(check, &check_path, "equals");
                self.regex(check, &check_path, "matches");
            }
            _ => {}
        }
    }

    /// Checks a tag field against the allowed values, returning the tag if valid.
    fn tag<'a>(
        &mut self,
        map: &'a Map<String, Value>,
        path: &str,
        key: &str,
        allowed: &[&str],
        what: &str,
    ) -> Option<&'a str> {
        let tag = self.required_string(map, path, key)?;
        if allowed.contains(&tag) {
            Some(tag)
        } else {
            self.issue(
                format!("{}.{}", path, key),
                format!(
                    "unknown {} '{}' (expected one of: {})",
                    what,
                    tag,
                    allowed.join(", ")
                ),
            );
            None
        }
    }

    fn required_string<'a>(
        &mut self,
        map: &'a Map<String, Value>,
        path: &str,
        key: &str,
    ) -> Option<&'a str> {
        match map.get(key) {
            None | Some(Value::Null) => {
                self.issue(format!("{}.{}", path, key), "is required");
                None
            }
            Some(Value::String(s)) => Some(s.as_str()),
            Some(_) => {
                self.issue(format!("{}.{}", path, key), "must be a string");
                None
            }
        }
    }

    fn required_index(&mut self, map: &Map<String, Value>, path: &str, key: &str) -> Option<u64> {
        match map.get(key) {
            None => {
                self.issue(format!("{}.{}", path, key), "is required");
                None
            }
            Some(value) => {
                let index = value.as_u64();
                if index.is_none() {
                    self.issue(
                        format!("{}.{}", path, key),
                        "must be a non-negative integer",
                    );
                }
                index
            }
        }
    }

    fn optional_string(&mut self, map: &Map<String, Value>, path: &str, key: &str) {
        if let Some(value) = map.get(key) {
            if !value.is_string() && !value.is_null() {
                self.issue(format!("{}.{}", path, key), "must be a string");
            }
        }
    }

    fn optional_bool(&mut self, map: &Map<String, Value>, path: &str, key: &str) {
        if let Some(value) = map.get(key) {
            if !value.is_boolean() && !value.is_null() {
                self.issue(format!("{}.{}", path, key), "must be a boolean");
            }
        }
    }

    fn optional_object<'a>(
        &mut self,
        map: &'a Map<String, Value>,
        path: &str,
        key: &str,
    ) -> Option<&'a Map<String, Value>> {
        match map.get(key) {
            None | Some(Value::Null) => None,
            Some(Value::Object(obj)) => Some(obj),
            Some(_) => {
                self.issue(format!("{}.{}", path, key), "must be a mapping");
                None
            }
        }
    }

    fn string_map(&mut self, map: &Map<String, Value>, path: &str, key: &str) {
        if let Some(obj) = self.optional_object(map, path, key) {
            for (name, value) in obj {
                if !value.is_string() {
                    self.issue(format!("{}.{}.{}", path, key, name), "must be a string");
                }
            }
        }
    }

    fn string_list(&mut self, map: &Map<String, Value>, path: &str, key: &str) {
        match map.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    if !item.is_string() {
                        self.issue(format!("{}.{}[{}]", path, key, index), "must be a string");
                    }
                }
            }
            Some(_) => self.issue(format!("{}.{}", path, key), "must be a list"),
        }
    }

    fn regex(&mut self, map: &Map<String, Value>, path: &str, key: &str) {
        match map.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::String(pattern)) => {
                if let Err(e) = regex::Regex::new(pattern) {
                    self.issue(format!("{}.{}", path, key), format!("invalid regex: {}", e));
                }
            }
            Some(_) => self.issue(format!("{}.{}", path, key), "must be a string"),
        }
    }
}
