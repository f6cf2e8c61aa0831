use super::ExtractError;
use super::boundary::{self, LineIndex};
use super::types::{Diagnostic, FunctionSpan, SourceBlock};
use std::collections::BTreeSet;
use std::ops::Range;
use tree_sitter::{Language, Node, Parser, Query, QueryCursor, StreamingIterator, Tree};

const FUNCTION_QUERY: &str = r#"
(function_definition
  declarator: (_) @declarator) @function
"#;

/// Primary extraction path: a tree-sitter C parse, whose error regions point at
/// the embedded SQL the grammar cannot represent.
pub struct SyntaxExtractor {
    parser: Parser,
    function_query: Query,
}

/// Blocks found through the parse. `candidates` counts the markers the
/// tree's error regions pointed at, before expansion.
#[derive(Debug, Default)]
pub struct SyntaxBlocks {
    pub blocks: Vec<SourceBlock>,
    pub diagnostics: Vec<Diagnostic>,
    pub candidates: usize,
}

impl SyntaxExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        let language: Language = tree_sitter_c::LANGUAGE.into();
        let mut parser = Parser::new();
        parser
            .set_language(&language)
            .map_err(|e| ExtractError::Parser(e.to_string()))?;
        let function_query = Query::new(&language, FUNCTION_QUERY)
            .map_err(|e| ExtractError::Parser(e.to_string()))?;
        Ok(Self {
            parser,
            function_query,
        })
    }

    pub fn parse(&mut self, source: &str) -> Result<Tree, ExtractError> {
        self.parser
            .parse(source, None)
            .ok_or_else(|| ExtractError::Parser("parser returned no tree".to_string()))
    }

    /// Blocks for the regions the parser could not read as C. Each error region
    /// is traced back to the `EXEC SQL` marker at or before its start, plus any
    /// marker inside it, and expanded with the literal-aware terminator search.
    /// The parser's own end positions are not used.
    pub fn extract_blocks(&self, tree: &Tree, source: &str) -> SyntaxBlocks {
        let mut errors = Vec::new();
        collect_error_ranges(tree.root_node(), &mut errors);

        let regions = boundary::lexical_regions(source);
        let markers = boundary::marker_offsets(source, &regions);
        let candidates = candidate_markers(&errors, &markers);
        let lines = LineIndex::new(source);

        for (idx, offset) in markers.iter().enumerate() {
            if !candidates.contains(&idx) {
                tracing::debug!(
                    "EXEC SQL at line {} parsed as valid C, not a candidate",
                    lines.line_of(*offset)
                );
            }
        }

        let (blocks, diagnostics) =
            boundary::expand_candidates(source, &lines, &markers, candidates.iter().copied());
        SyntaxBlocks {
            blocks,
            diagnostics,
            candidates: candidates.len(),
        }
    }

    /// Function boundaries from `function_definition` nodes.
    pub fn functions(&self, tree: &Tree, source: &str) -> Vec<FunctionSpan> {
        let bytes = source.as_bytes();
        let mut cursor = QueryCursor::new();
        let mut functions = Vec::new();
        let capture_names = self.function_query.capture_names();

        let mut matches = cursor.matches(&self.function_query, tree.root_node(), bytes);
        while let Some(m) = matches.next() {
            let mut function_node = None;
            let mut name = None;
            for cap in m.captures {
                match capture_names[cap.index as usize] {
                    "function" => function_node = Some(cap.node),
                    "declarator" => name = declarator_name(cap.node, bytes),
                    _ => {}
                }
            }
            if let (Some(node), Some(name)) = (function_node, name) {
                functions.push(FunctionSpan {
                    name,
                    line_start: node.start_position().row + 1,
                    line_end: node.end_position().row + 1,
                });
            }
        }

        functions.sort_by_key(|f| f.line_start);
        functions
    }
}

fn collect_error_ranges(node: Node, out: &mut Vec<Range<usize>>) {
    if node.is_error() || node.is_missing() {
        out.push(node.start_byte()..node.end_byte());
        return;
    }
    if !node.has_error() {
        return;
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_error_ranges(child, out);
    }
}

/// Indices into `markers` (sorted offsets) that the error regions point at.
fn candidate_markers(errors: &[Range<usize>], markers: &[usize]) -> BTreeSet<usize> {
    let mut candidates = BTreeSet::new();
    for error in errors {
        let after = markers.partition_point(|m| *m <= error.start);
        if after > 0 {
            candidates.insert(after - 1);
        }
        candidates.extend((after..markers.len()).take_while(|i| markers[*i] < error.end));
    }
    candidates
}

/// Unwraps `function_declarator`, `pointer_declarator` and parenthesized
/// declarators down to the identifier.
fn declarator_name(node: Node, source: &[u8]) -> Option<String> {
    match node.kind() {
        "identifier" | "field_identifier" => node.utf8_text(source).ok().map(str::to_string),
        "parenthesized_declarator" => {
            let mut cursor = node.walk();
            let inner = node.named_children(&mut cursor).next();
            inner.and_then(|child| declarator_name(child, source))
        }
        _ => node
            .child_by_field_name("declarator")
            .and_then(|child| declarator_name(child, source)),
    }
}
