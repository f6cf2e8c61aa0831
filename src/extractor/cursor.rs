//! DECLARE / OPEN / FETCH / CLOSE protocol merging.
//!
//! A cursor's query and its output bindings live in different statements. The
//! merger glues them back into one `SELECT ... INTO ... FROM ...`.
use super::host_vars::HostVarExtractor;
use super::render::collapse_whitespace;
use super::types::{
    ClassifiedBlock, CursorRelation, HostVariableRef, SourcePosition, StatementKind,
};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static DECLARE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bDECLARE\s+(\w+)\s+(?:(?:SCROLL|INSENSITIVE|SENSITIVE)\s+)*CURSOR\b")
        .expect("valid regex")
});

static CURSOR_QUERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bCURSOR\s+(?:WITH\s+HOLD\s+)?FOR\s+(.*)$").expect("valid regex")
});

static OPEN_CLOSE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:EXEC\s+SQL\s+)?(?:AT\s+:?\w+\s+)?(?:OPEN|CLOSE)\s+:?(\w+)")
        .expect("valid regex")
});

static FETCH_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*(?:EXEC\s+SQL\s+)?(?:AT\s+:?\w+\s+)?(?:FOR\s+:?\w+\s+)?FETCH\s+(?:(?:NEXT|PRIOR|FIRST|LAST|CURRENT)\s+)?(?:(?:ABSOLUTE|RELATIVE)\s+:?\w+\s+)?(?:FROM\s+)?:?(\w+)",
    )
    .expect("valid regex")
});

static QUERY_START_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*\(?\s*(?:SELECT|WITH)\b").expect("valid regex"));

/// Indices into the block list of one cursor's statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorGroup {
    pub cursor_name: String,
    pub declare: usize,
    pub open: Option<usize>,
    pub fetches: Vec<usize>,
    pub close: Option<usize>,
}

impl CursorGroup {
    /// OPEN/FETCH/CLOSE indices, in source order.
    pub fn members(&self) -> Vec<usize> {
        let mut members: Vec<usize> = self
            .open
            .iter()
            .chain(self.fetches.iter())
            .chain(self.close.iter())
            .copied()
            .collect();
        members.sort_unstable();
        members
    }
}

/// The single query standing in for a whole cursor group.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCursor {
    pub normalized_text: String,
    pub input_vars: Vec<HostVariableRef>,
    pub output_vars: Vec<HostVariableRef>,
    pub relation: CursorRelation,
}

/// Cursor name declared by a DECLARE CURSOR statement.
pub fn declared_cursor_name(text: &str) -> Option<String> {
    DECLARE_NAME_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Cursor operand of an OPEN, FETCH or CLOSE statement.
pub fn cursor_operand(text: &str, kind: StatementKind) -> Option<String> {
    let re = match kind {
        StatementKind::Open | StatementKind::Close => &OPEN_CLOSE_NAME_RE,
        StatementKind::FetchInto => &FETCH_NAME_RE,
        _ => return None,
    };
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// The query after `CURSOR FOR`.
pub fn cursor_query(declare_text: &str) -> Option<String> {
    CURSOR_QUERY_RE
        .captures(declare_text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().trim_end_matches(';').trim().to_string())
        .filter(|q| !q.is_empty())
}

/// Groups cursor statements by name. Each OPEN/FETCH/CLOSE attaches to the most
/// recent preceding DECLARE of the same name (case-insensitive); a second OPEN or
/// CLOSE for a group stays unattached.
pub fn find_cursor_groups(blocks: &[ClassifiedBlock]) -> Vec<CursorGroup> {
    let mut groups: Vec<CursorGroup> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for (idx, block) in blocks.iter().enumerate() {
        match block.kind {
            StatementKind::DeclareCursor => {
                if let Some(name) = declared_cursor_name(&block.normalized) {
                    by_name.insert(name.to_ascii_lowercase(), groups.len());
                    groups.push(CursorGroup {
                        cursor_name: name,
                        declare: idx,
                        open: None,
                        fetches: Vec::new(),
                        close: None,
                    });
                }
            }
            kind @ (StatementKind::Open | StatementKind::FetchInto | StatementKind::Close) => {
                let Some(name) = cursor_operand(&block.normalized, kind) else {
                    continue;
                };
                let Some(group) = by_name
                    .get(&name.to_ascii_lowercase())
                    .and_then(|g| groups.get_mut(*g))
                else {
                    continue;
                };
                match kind {
                    StatementKind::Open if group.open.is_none() => group.open = Some(idx),
                    StatementKind::Close if group.close.is_none() => group.close = Some(idx),
                    StatementKind::FetchInto => group.fetches.push(idx),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    groups
}

/// Merges a group into one query. `None` when the declared query is not a plain
/// SELECT (e.g. a cursor over a prepared statement name); such groups are left
/// as independent statements.
pub fn merge_group(
    group: &CursorGroup,
    blocks: &[ClassifiedBlock],
    host_vars: &HostVarExtractor,
) -> Option<MergedCursor> {
    let declare = blocks.get(group.declare)?;
    let query = cursor_query(&declare.normalized)?;
    if !QUERY_START_RE.is_match(&query) {
        return None;
    }

    let mut fetched: Vec<HostVariableRef> = Vec::new();
    for fetch in group.fetches.iter().filter_map(|i| blocks.get(*i)) {
        let (_, outputs) = host_vars.classify_by_direction(&fetch.normalized, StatementKind::FetchInto);
        for var in outputs {
            if !fetched.iter().any(|seen| seen.raw_text == var.raw_text) {
                fetched.push(var);
            }
        }
    }

    let normalized_text = if fetched.is_empty() {
        collapse_whitespace(&query)
    } else {
        let into = fetched
            .iter()
            .map(|v| v.raw_text.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        collapse_whitespace(&insert_into_clause(&query, &into))
    };

    let (input_vars, output_vars) =
        host_vars.classify_by_direction(&normalized_text, StatementKind::Select);

    let position = |i: usize| blocks.get(i).map(|b| SourcePosition::from(&b.block));
    let relation = CursorRelation {
        cursor_name: group.cursor_name.clone(),
        declare: SourcePosition::from(&declare.block),
        open: group.open.and_then(position),
        fetches: group.fetches.iter().filter_map(|i| position(*i)).collect(),
        close: group.close.and_then(position),
        is_loop_based: group.fetches.len() > 1
            || (group.fetches.len() == 1 && !fetched.is_empty()),
    };

    Some(MergedCursor {
        normalized_text,
        input_vars,
        output_vars,
        relation,
    })
}

/// Places `INTO <vars>` right before the query's top-level `FROM`, or at the end.
pub fn insert_into_clause(query: &str, vars: &str) -> String {
    match find_top_level_keyword(query, "FROM") {
        Some(at) => format!("{} INTO {} {}", query[..at].trim_end(), vars, &query[at..]),
        None => format!("{} INTO {}", query.trim_end(), vars),
    }
}

/// Offset of the first `keyword` outside parentheses and quoted literals.
pub(crate) fn find_top_level_keyword(text: &str, keyword: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let kw = keyword.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ if depth == 0
                && bytes.len() - i >= kw.len()
                && bytes[i..i + kw.len()].eq_ignore_ascii_case(kw)
                && (i == 0 || !is_word(bytes[i - 1]))
                && bytes.get(i + kw.len()).is_none_or(|n| !is_word(*n)) =>
            {
                return Some(i);
            }
            _ => {}
        }
        i += 1;
    }

    None
}
