use super::host_vars::{self, HostVarExtractor};
use super::types::StatementKind;
use regex::Regex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

static MARKER_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*EXEC\s+SQL\s+").expect("valid regex"));

static ARRAY_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(AT\s+:?\w+\s+)?FOR\s+:?(\w+(?:\.\w+)?)\s+").expect("valid regex")
});

pub const DEFAULT_MARKER_TEMPLATE: &str = "/* sql extracted: {id} */";
pub const DEFAULT_PLACEHOLDER_TEMPLATE: &str = "#{name}";

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes `/* */` and `--` comments outside SQL literals. Optimizer hints
/// (`/*+ ... */`) are kept.
pub fn strip_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        if bytes.get(i + 1) == Some(&b'\'') {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..].find("*/").map_or(sql.len(), |p| i + 2 + p + 2);
                if bytes.get(i + 2) != Some(&b'+') {
                    out.push_str(&sql[copied..i]);
                    out.push(' ');
                    copied = end;
                }
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..].find('\n').map_or(sql.len(), |p| i + p);
                out.push_str(&sql[copied..i]);
                out.push(' ');
                copied = end;
                i = end;
            }
            _ => i += 1,
        }
    }

    out.push_str(&sql[copied.min(sql.len())..]);
    out
}

/// Array-DML size variable of `EXEC SQL FOR :n ...`.
pub fn array_size_var(raw: &str) -> Option<String> {
    let rest = MARKER_PREFIX_RE
        .find(raw)
        .map_or(raw, |m| &raw[m.end()..]);
    ARRAY_PREFIX_RE
        .captures(rest)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// Canonical statement text: comments (not hints) removed, `EXEC SQL` and the
/// `FOR :n` prefix stripped, trailing `;` dropped, whitespace collapsed. Host
/// variables and `INTO` clauses stay in place.
pub fn normalize_sql(raw: &str) -> String {
    let text = strip_comments(raw);
    let mut rest = MARKER_PREFIX_RE
        .find(&text)
        .map_or(text.as_str(), |m| &text[m.end()..])
        .to_string();

    if let Some(caps) = ARRAY_PREFIX_RE.captures(&rest) {
        let at_clause = caps.get(1).map_or("", |m| m.as_str()).to_string();
        let end = caps.get(0).map_or(0, |m| m.end());
        rest = format!("{at_clause}{}", &rest[end..]);
    }

    let trimmed = rest.trim_end().trim_end_matches(';');
    collapse_whitespace(trimmed)
}

/// Renders `normalized` with every host variable replaced by a placeholder.
/// Select-family statements lose their `INTO` clause first.
pub fn parameterize(
    normalized: &str,
    kind: StatementKind,
    host_vars: &HostVarExtractor,
    placeholder_template: &str,
) -> String {
    let mut text = normalized.to_string();
    if kind.has_output_into() {
        if let Some(range) = host_vars::into_clause_range(&text) {
            text.replace_range(range, " ");
        }
    }

    let refs = host_vars.extract_all(&text);
    for var in refs.iter().rev() {
        let placeholder = placeholder_template.replace("{name}", &var.binding_name());
        text.replace_range(var.span.clone(), &placeholder);
    }

    collapse_whitespace(&text)
}

/// Per-file sequential ids, one counter per kind bucket.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counters: HashMap<&'static str, usize>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, kind: StatementKind) -> String {
        let bucket = kind.id_bucket();
        let counter = self.counters.entry(bucket).or_insert(0);
        let id = format!("{bucket}_{counter}");
        *counter += 1;
        id
    }
}

/// One replacement in the marked copy of the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEdit {
    pub range: Range<usize>,
    pub replacement: String,
}

/// Expands `{id}`, `{kind}`, `{function}` and `{line}` in a marker template.
pub fn marker_text(
    template: &str,
    id: &str,
    kind: StatementKind,
    function: Option<&str>,
    line: usize,
) -> String {
    template
        .replace("{id}", id)
        .replace("{kind}", kind.as_str())
        .replace("{function}", function.unwrap_or("-"))
        .replace("{line}", &line.to_string())
}

/// Applies non-overlapping edits. Each replaced region keeps its newline count so
/// line numbers in the rest of the file do not move.
pub fn mark_source(source: &str, edits: &[SourceEdit]) -> String {
    let mut sorted: Vec<&SourceEdit> = edits.iter().collect();
    sorted.sort_by_key(|e| e.range.start);

    let mut out = String::with_capacity(source.len());
    let mut copied = 0;
    for edit in sorted {
        if edit.range.start < copied || edit.range.end > source.len() {
            continue;
        }
        out.push_str(&source[copied..edit.range.start]);
        out.push_str(&edit.replacement);
        let newlines = source[edit.range.clone()].matches('\n').count();
        let kept = edit.replacement.matches('\n').count();
        out.extend(std::iter::repeat_n('\n', newlines.saturating_sub(kept)));
        copied = edit.range.end;
    }
    out.push_str(&source[copied..]);
    out
}
