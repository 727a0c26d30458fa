//! Comma repair for anchored inserts into JSON files.
//!
//! This is a line-based heuristic, not a JSON parser. Brace depth is counted
//! naively, so a string value containing `{` or `}` can throw off the
//! look-ahead. Minified or deeply nested documents are best-effort.

/// Inserts `content` after the anchor that ends at `(line, col)`, fixing up
/// commas around the new property.
pub(super) fn insert_after(lines: &mut Vec<String>, line: usize, col: usize, content: &str) {
    let Some(matched) = lines.get(line).cloned() else {
        return;
    };
    let col = col.min(matched.len());
    let (head, tail) = matched.split_at(col);

    // Compact JSON (`{"a":1}`): splice inline when the tail closes the value
    // or starts the next property. A partial anchor like `"name"` on
    // `"name": "app",` falls through to the line-based insert.
    if closes_inline(tail) {
        let insert = content.trim().trim_end_matches(',').trim_end();
        let sep = if looks_like_property(insert) && needs_comma(head) {
            ","
        } else {
            ""
        };
        lines[line] = format!("{}{}{}{}", head, sep, insert, tail);
        return;
    }

    if looks_like_property(content) && !ends_with_comma(&matched) && !is_structural(&matched) {
        lines[line] = format!("{},", matched.trim_end());
    }

    let new_lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    let inserted = new_lines.len();
    let at = line + 1;
    lines.splice(at..at, new_lines);

    let last = line + inserted;
    let followed = has_following_property(lines.get(last + 1..).unwrap_or(&[]));
    if let Some(last_line) = lines.get_mut(last) {
        if !followed {
            let trimmed = last_line.trim_end();
            if let Some(stripped) = trimmed.strip_suffix(',') {
                *last_line = stripped.to_string();
            }
        } else if looks_like_property(content) && !ends_with_comma(last_line) {
            *last_line = format!("{},", last_line.trim_end());
        }
    }
}

/// Scans forward within the current scope for another property.
///
/// Returns false once the enclosing brace or bracket closes.
fn has_following_property(rest: &[String]) -> bool {
    let mut depth: usize = 0;
    for line in rest {
        let trimmed = line.trim();
        if depth == 0 && trimmed.starts_with('"') {
            return true;
        }
        for c in trimmed.chars() {
            match c {
                '{' | '[' => depth += 1,
                '}' | ']' => {
                    if depth == 0 {
                        return false;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }
    false
}

fn closes_inline(tail: &str) -> bool {
    let rest = tail.trim();
    rest.starts_with(|c| c == '}' || c == ']') || (rest.starts_with(',') && rest != ",")
}

fn looks_like_property(content: &str) -> bool {
    content.trim_start().starts_with('"')
}

fn ends_with_comma(line: &str) -> bool {
    line.trim_end().ends_with(',')
}

fn needs_comma(head: &str) -> bool {
    let t = head.trim_end();
    !(t.is_empty() || t.ends_with(',') || t.ends_with('{') || t.ends_with('['))
}

/// Opening lines (`"key": {`) and bare closing lines (`}`, `],`).
fn is_structural(line: &str) -> bool {
    let t = line.trim();
    t.ends_with('{') || t.ends_with('[') || t.starts_with('}') || t.starts_with(']')
}
