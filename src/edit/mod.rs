//! Text edit engine.
//!
//! Pure functions mapping `(existing content, edit) -> new content`. No I/O
//! happens here; sandboxes read the file, call [`apply`], and write the result.

mod json;

use thiserror::Error;

use crate::document::{AnchorAction, ContextAnchor, EditOperation, LineDiff};

/// Errors produced while applying an edit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    /// A context anchor pattern does not occur in the target file.
    #[error("pattern not found in {path}: {pattern:?}")]
    PatternNotFound { path: String, pattern: String },
}

/// Applies `edit` to `existing`, the current content of the file at `path`.
///
/// `path` is only consulted for format-specific behavior (`.json` files get
/// comma repair on anchored inserts). Only context anchors can fail; every
/// other edit is total over its inputs.
pub fn apply(existing: &str, edit: &EditOperation, path: &str) -> Result<String, EditError> {
    match edit {
        EditOperation::Replace { content } => Ok(content.clone()),
        EditOperation::LineDiff(diff) => Ok(apply_line_diff(existing, diff)),
        EditOperation::Context(anchor) => apply_context(existing, anchor, path),
    }
}

/// Splits content into lines. An empty file has no lines.
fn split_lines(content: &str) -> Vec<String> {
    if content.is_empty() {
        Vec::new()
    } else {
        content.split('\n').map(str::to_string).collect()
    }
}

fn apply_line_diff(existing: &str, diff: &LineDiff) -> String {
    // find/replace wins outright; remove/insert in the same diff are ignored.
    if let Some(fr) = &diff.find_replace {
        return existing.replace(&fr.find, &fr.replace);
    }

    let mut lines = split_lines(existing);

    if let Some(range) = diff.remove_lines {
        if range.start < lines.len() && range.start <= range.end {
            let end = range.end.min(lines.len() - 1);
            lines.drain(range.start..=end);
        }
    }

    if let Some(insert) = &diff.insert_lines {
        let at = insert.at.min(lines.len());
        lines.splice(at..at, insert.lines.iter().cloned());
    }

    lines.join("\n")
}

/// Location of an anchor match, in line/byte-column coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AnchorMatch {
    start_line: usize,
    end_line: usize,
    /// Byte offset within `end_line` just past the match.
    end_col: usize,
    /// Byte offset of the match in the whole content (multi-line patterns only).
    offset: Option<usize>,
}

fn find_anchor(content: &str, lines: &[String], pattern: &str) -> Option<AnchorMatch> {
    if pattern.contains('\n') {
        let offset = content.find(pattern)?;
        let start_line = content[..offset].matches('\n').count();
        // A trailing newline in the pattern should not push the anchor onto the next line.
        let end = offset + pattern.trim_end_matches('\n').len();
        let end_line = content[..end].matches('\n').count();
        let end_line_start = content[..end].rfind('\n').map_or(0, |i| i + 1);
        return Some(AnchorMatch {
            start_line,
            end_line,
            end_col: end - end_line_start,
            offset: Some(offset),
        });
    }

    lines.iter().enumerate().find_map(|(index, line)| {
        line.find(pattern).map(|col| AnchorMatch {
            start_line: index,
            end_line: index,
            end_col: col + pattern.len(),
            offset: None,
        })
    })
}

fn apply_context(existing: &str, anchor: &ContextAnchor, path: &str) -> Result<String, EditError> {
    let mut lines = split_lines(existing);
    let found = find_anchor(existing, &lines, &anchor.pattern).ok_or_else(|| {
        EditError::PatternNotFound {
            path: path.to_string(),
            pattern: anchor.pattern.clone(),
        }
    })?;

    let new_lines: Vec<String> = anchor.content.split('\n').map(str::to_string).collect();

    match anchor.action {
        AnchorAction::Replace => {
            if let Some(offset) = found.offset {
                let mut out = String::with_capacity(existing.len() + anchor.content.len());
                out.push_str(&existing[..offset]);
                out.push_str(&anchor.content);
                out.push_str(&existing[offset + anchor.pattern.len()..]);
                return Ok(out);
            }
            lines.splice(found.start_line..=found.end_line, new_lines);
        }
        AnchorAction::Before => {
            lines.splice(found.start_line..found.start_line, new_lines);
        }
        AnchorAction::After if is_json_path(path) => {
            json::insert_after(&mut lines, found.end_line, found.end_col, &anchor.content);
        }
        AnchorAction::After => {
            let at = found.end_line + 1;
            lines.splice(at..at, new_lines);
        }
    }

    Ok(lines.join("\n"))
}

fn is_json_path(path: &str) -> bool {
    path.ends_with(".json")
}
