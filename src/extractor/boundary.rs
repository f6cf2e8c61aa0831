//! Literal- and comment-aware detection of `EXEC SQL ... ;` blocks.
//!
//! This is the fallback extraction path and also the place where block ends are
//! computed for the syntax-tree path: the parser's idea of where an error region
//! stops is never trusted, the terminator is always recomputed here.
use super::types::{Diagnostic, DiagnosticKind, SourceBlock};
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

static MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bEXEC\s+SQL\b").expect("valid regex"));

/// Maps byte offsets to 1-based line numbers.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self { starts }
    }

    pub fn line_of(&self, byte: usize) -> usize {
        match self.starts.binary_search(&byte) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }

    /// Byte offset where the 1-based `line` begins.
    pub fn line_start(&self, line: usize) -> Option<usize> {
        line.checked_sub(1).and_then(|i| self.starts.get(i).copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    BlockComment,
    LineComment,
    StringLiteral,
    CharLiteral,
}

impl RegionKind {
    pub fn is_comment(&self) -> bool {
        matches!(self, RegionKind::BlockComment | RegionKind::LineComment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexicalRegion {
    pub kind: RegionKind,
    pub range: Range<usize>,
}

/// Lexes C source into comment and literal regions, in order and non-overlapping.
///
/// String and character literals end at the closing quote or at an unescaped
/// newline, so a stray apostrophe can never swallow more than one line.
pub fn lexical_regions(source: &str) -> Vec<LexicalRegion> {
    let bytes = source.as_bytes();
    let mut regions = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = find_from(bytes, i + 2, b"*/").map_or(bytes.len(), |p| p + 2);
                regions.push(LexicalRegion {
                    kind: RegionKind::BlockComment,
                    range: i..end,
                });
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                let end = bytes[i..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |p| i + p);
                regions.push(LexicalRegion {
                    kind: RegionKind::LineComment,
                    range: i..end,
                });
                i = end;
            }
            quote @ (b'"' | b'\'') => {
                let end = literal_end(bytes, i + 1, quote);
                let kind = if quote == b'"' {
                    RegionKind::StringLiteral
                } else {
                    RegionKind::CharLiteral
                };
                regions.push(LexicalRegion { kind, range: i..end });
                i = end;
            }
            _ => i += 1,
        }
    }

    regions
}

fn literal_end(bytes: &[u8], mut i: usize, quote: u8) -> usize {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

fn find_from(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// Whether `offset` falls inside one of the (sorted) `regions`.
pub fn in_regions(regions: &[LexicalRegion], offset: usize) -> bool {
    let idx = regions.partition_point(|r| r.range.end <= offset);
    regions
        .get(idx)
        .is_some_and(|r| r.range.start <= offset && offset < r.range.end)
}

/// Replaces comment bytes with spaces, keeping newlines so offsets and lines stay valid.
pub fn mask_comments(source: &str) -> String {
    let mut bytes = source.as_bytes().to_vec();
    for region in lexical_regions(source)
        .into_iter()
        .filter(|r| r.kind.is_comment())
    {
        for b in &mut bytes[region.range] {
            if *b != b'\n' {
                *b = b' ';
            }
        }
    }
    // Whole regions are blanked, so no multi-byte sequence is ever split.
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Byte offsets of every `EXEC SQL` marker that is not inside a comment or literal.
pub fn marker_offsets(source: &str, regions: &[LexicalRegion]) -> Vec<usize> {
    MARKER_RE
        .find_iter(source)
        .map(|m| m.start())
        .filter(|start| !in_regions(regions, *start))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InSingle,
    InDouble,
    BlockComment,
    LineComment,
}

/// Finds the `;` ending the statement that starts at `from`.
///
/// Quotes toggle literal state (backslash escapes and doubled quotes stay inside
/// the literal). `/* */` comments are skipped, and so are `//` and SQL `--` line
/// comments. Returns the byte offset of the semicolon.
pub fn find_terminator(source: &str, from: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut state = ScanState::Normal;
    let mut i = from;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match state {
            ScanState::Normal => match b {
                b';' => return Some(i),
                b'\'' => state = ScanState::InSingle,
                b'"' => state = ScanState::InDouble,
                b'/' if next == Some(b'*') => {
                    state = ScanState::BlockComment;
                    i += 1;
                }
                b'/' if next == Some(b'/') => {
                    state = ScanState::LineComment;
                    i += 1;
                }
                b'-' if next == Some(b'-') => {
                    state = ScanState::LineComment;
                    i += 1;
                }
                _ => {}
            },
            ScanState::InSingle | ScanState::InDouble => {
                let quote = if state == ScanState::InSingle { b'\'' } else { b'"' };
                if b == b'\\' {
                    i += 1;
                } else if b == quote && next == Some(quote) {
                    i += 1;
                } else if b == quote {
                    state = ScanState::Normal;
                }
            }
            ScanState::BlockComment => {
                if b == b'*' && next == Some(b'/') {
                    state = ScanState::Normal;
                    i += 1;
                }
            }
            ScanState::LineComment => {
                if b == b'\n' {
                    state = ScanState::Normal;
                }
            }
        }
        i += 1;
    }

    None
}

/// Outcome of expanding one marker to a full statement.
#[derive(Debug)]
pub enum BlockScan {
    Block(SourceBlock),
    Dropped(Diagnostic),
}

/// Expands the marker at `start` up to its terminator. `next_marker` bounds the
/// search: a statement that would run into the following `EXEC SQL` is dropped.
pub fn expand_marker(
    source: &str,
    lines: &LineIndex,
    start: usize,
    next_marker: Option<usize>,
) -> BlockScan {
    let line = lines.line_of(start);
    match find_terminator(source, start) {
        Some(term) if next_marker.is_none_or(|n| term < n) => BlockScan::Block(SourceBlock {
            text: source[start..=term].to_string(),
            byte_start: start,
            byte_end: term + 1,
            line_start: line,
            line_end: lines.line_of(term),
            containing_function: None,
        }),
        Some(_) => BlockScan::Dropped(Diagnostic::new(
            DiagnosticKind::UnterminatedBlock,
            line,
            format!("EXEC SQL at line {line} runs into the next EXEC SQL before a terminating ';'"),
        )),
        None => BlockScan::Dropped(Diagnostic::new(
            DiagnosticKind::UnterminatedBlock,
            line,
            format!("EXEC SQL at line {line} has no terminating ';' before end of file"),
        )),
    }
}

/// Expands a sorted list of marker offsets into blocks.
pub fn blocks_from_markers(
    source: &str,
    lines: &LineIndex,
    markers: &[usize],
) -> (Vec<SourceBlock>, Vec<Diagnostic>) {
    expand_candidates(source, lines, markers, 0..markers.len())
}

/// Expands the markers at the given (ascending) indices. Each search is still
/// bounded by the next marker in `markers`, candidate or not.
pub fn expand_candidates(
    source: &str,
    lines: &LineIndex,
    markers: &[usize],
    candidates: impl IntoIterator<Item = usize>,
) -> (Vec<SourceBlock>, Vec<Diagnostic>) {
    let mut blocks: Vec<SourceBlock> = Vec::new();
    let mut diagnostics = Vec::new();

    for idx in candidates {
        let Some(&start) = markers.get(idx) else {
            continue;
        };
        // A marker inside the previous block's text (e.g. within a SQL literal the C lexer missed).
        if blocks.last().is_some_and(|b| start < b.byte_end) {
            continue;
        }
        match expand_marker(source, lines, start, markers.get(idx + 1).copied()) {
            BlockScan::Block(block) => blocks.push(block),
            BlockScan::Dropped(diag) => {
                tracing::warn!("{}", diag.message);
                diagnostics.push(diag);
            }
        }
    }

    (blocks, diagnostics)
}

/// Pure text scan: every `EXEC SQL` outside comments and literals becomes a block.
pub fn scan_blocks(source: &str) -> (Vec<SourceBlock>, Vec<Diagnostic>) {
    let regions = lexical_regions(source);
    let markers = marker_offsets(source, &regions);
    let lines = LineIndex::new(source);
    blocks_from_markers(source, &lines, &markers)
}
