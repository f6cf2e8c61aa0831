use super::boundary::{self, LineIndex};
use super::classifier::RuleRegistry;
use super::cursor::{self, MergedCursor};
use super::dynamic_sql::{self, SqlOperand, StringCall};
use super::host_vars::HostVarExtractor;
use super::relations::{self, TransactionGroup};
use super::render::{self, IdGenerator, SourceEdit};
use super::syntax::SyntaxExtractor;
use super::types::{
    ClassifiedBlock, DeclareSection, Diagnostic, DiagnosticKind, DynamicSqlRecord,
    ExtractedStatement, FunctionSpan, Relationship, SourceBlock, StatementKind, function_at_line,
};
use super::ExtractError;
use crate::source;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub use_syntax_tree: bool,
    pub marker_template: String,
    pub placeholder_template: String,
    /// Kinds dropped from the output and removed from the marked source.
    pub skip_kinds: HashSet<StatementKind>,
    pub low_confidence_threshold: f32,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            use_syntax_tree: true,
            marker_template: render::DEFAULT_MARKER_TEMPLATE.to_string(),
            placeholder_template: render::DEFAULT_PLACEHOLDER_TEMPLATE.to_string(),
            skip_kinds: HashSet::from([
                StatementKind::Include,
                StatementKind::DeclareSectionBegin,
                StatementKind::DeclareSectionEnd,
            ]),
            low_confidence_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub unknown: usize,
    pub dropped: usize,
    pub low_confidence: usize,
}

#[derive(Debug, Clone)]
pub struct FileExtraction {
    pub statements: Vec<ExtractedStatement>,
    pub diagnostics: Vec<Diagnostic>,
    pub transactions: Vec<TransactionGroup>,
    pub declare_sections: Vec<DeclareSection>,
    pub marked_source: String,
    pub summary: Summary,
}

/// Runs the whole per-file pipeline. Holds only read-only state, so one
/// instance can serve any number of concurrent files.
pub struct Extractor {
    registry: Arc<RuleRegistry>,
    host_vars: HostVarExtractor,
    options: ExtractOptions,
}

impl Extractor {
    pub fn new(registry: Arc<RuleRegistry>, options: ExtractOptions) -> Self {
        Self {
            registry,
            host_vars: HostVarExtractor::new(),
            options,
        }
    }

    pub fn extract_file<P: AsRef<Path>>(
        &self,
        path: P,
        encoding: &str,
    ) -> Result<FileExtraction, ExtractError> {
        let path = path.as_ref();
        let text = source::read_source(path, encoding)?;
        debug!("Extracting {}", path.display());
        Ok(self.extract(&text, None))
    }

    pub fn extract(&self, source: &str, functions: Option<&[FunctionSpan]>) -> FileExtraction {
        let (mut blocks, mut diagnostics, derived) = self.locate_blocks(source);
        let functions = functions.unwrap_or(derived.as_slice());
        for block in &mut blocks {
            block.containing_function =
                function_at_line(functions, block.line_start).map(|f| f.name.clone());
        }
        let dropped = diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::UnterminatedBlock)
            .count();

        let classified: Vec<ClassifiedBlock> = blocks.into_iter().map(|b| self.classify(b)).collect();

        let mut merged: HashMap<usize, MergedCursor> = HashMap::new();
        let mut owner: HashMap<usize, usize> = HashMap::new();
        // With DECLARE skipped there is nothing to merge into; members stand alone.
        if !self.options.skip_kinds.contains(&StatementKind::DeclareCursor) {
            for group in cursor::find_cursor_groups(&classified) {
                if let Some(m) = cursor::merge_group(&group, &classified, &self.host_vars) {
                    for member in group.members() {
                        owner.insert(member, group.declare);
                    }
                    merged.insert(group.declare, m);
                }
            }
        }

        let needs_calls = classified
            .iter()
            .any(|c| matches!(c.kind, StatementKind::Prepare | StatementKind::Execute));
        let calls = if needs_calls {
            dynamic_sql::scan_string_calls(source)
        } else {
            Vec::new()
        };
        let lines = LineIndex::new(source);

        let mut ids = IdGenerator::new();
        let mut merged_ids: HashMap<usize, String> = HashMap::new();
        let mut statements = Vec::new();
        let mut edits = Vec::new();

        for (idx, cb) in classified.iter().enumerate() {
            if self.options.skip_kinds.contains(&cb.kind) {
                edits.push(SourceEdit {
                    range: cb.block.byte_start..cb.block.byte_end,
                    replacement: String::new(),
                });
                continue;
            }

            if let Some(declare) = owner.get(&idx) {
                // Cursor members sit after their DECLARE, whose id is already assigned.
                if let Some(id) = merged_ids.get(declare) {
                    edits.push(self.marker_edit(cb, id, StatementKind::Select));
                }
                continue;
            }

            let stmt = match merged.remove(&idx) {
                Some(m) => {
                    let id = ids.next_id(StatementKind::Select);
                    merged_ids.insert(idx, id.clone());
                    self.merged_statement(cb, m, id)
                }
                None => {
                    let id = ids.next_id(cb.kind);
                    self.statement(cb, id, source, &lines, functions, &calls)
                }
            };

            if stmt.kind == StatementKind::Unknown {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::UnknownStatement,
                    stmt.line_range.0,
                    format!("{} did not match any classification rule", stmt.id),
                ));
            } else if stmt.confidence < self.options.low_confidence_threshold {
                warn!(
                    "{} at line {} has low confidence {:.2}",
                    stmt.id, stmt.line_range.0, stmt.confidence
                );
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::LowConfidence,
                    stmt.line_range.0,
                    format!("{} confidence {:.2}", stmt.id, stmt.confidence),
                ));
            }

            edits.push(self.marker_edit(cb, &stmt.id, stmt.kind));
            statements.push(stmt);
        }

        relations::link_prepared_statements(&mut statements);
        let transactions = relations::detect_transactions(&statements);
        let declare_sections = declare_sections(&classified, source);
        let marked_source = render::mark_source(source, &edits);
        let summary = Summary {
            total: statements.len(),
            unknown: statements
                .iter()
                .filter(|s| s.kind == StatementKind::Unknown)
                .count(),
            dropped,
            low_confidence: diagnostics
                .iter()
                .filter(|d| d.kind == DiagnosticKind::LowConfidence)
                .count(),
        };
        diagnostics.sort_by_key(|d| d.line);

        FileExtraction {
            statements,
            diagnostics,
            transactions,
            declare_sections,
            marked_source,
            summary,
        }
    }

    /// Syntax-tree path first, text scan when the parser is unavailable or
    /// surfaces no candidate region. Also returns function spans derived from the parse.
    fn locate_blocks(&self, source: &str) -> (Vec<SourceBlock>, Vec<Diagnostic>, Vec<FunctionSpan>) {
        if !self.options.use_syntax_tree {
            let (blocks, diagnostics) = boundary::scan_blocks(source);
            return (blocks, diagnostics, Vec::new());
        }

        let parsed = SyntaxExtractor::new().and_then(|mut syntax| {
            let tree = syntax.parse(source)?;
            Ok((syntax.extract_blocks(&tree, source), syntax.functions(&tree, source)))
        });

        match parsed {
            Ok((found, functions)) if found.candidates > 0 => {
                (found.blocks, found.diagnostics, functions)
            }
            Ok((_, functions)) => {
                let (blocks, mut diagnostics) = boundary::scan_blocks(source);
                if !blocks.is_empty() {
                    debug!("Parser surfaced no EXEC SQL regions, using text scan");
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::ParserFallback,
                        1,
                        "no embedded SQL surfaced in the C parse; blocks found by text scan",
                    ));
                }
                (blocks, diagnostics, functions)
            }
            Err(e) => {
                warn!("C parser unavailable, falling back to text scan: {}", e);
                let (blocks, mut diagnostics) = boundary::scan_blocks(source);
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::ParserFallback,
                    1,
                    format!("text scan used: {e}"),
                ));
                (blocks, diagnostics, Vec::new())
            }
        }
    }

    fn classify(&self, block: SourceBlock) -> ClassifiedBlock {
        let normalized = render::normalize_sql(&block.text);
        let c = self.registry.classify(&normalized);
        ClassifiedBlock {
            block,
            kind: c.kind,
            confidence: c.confidence,
            metadata: c.metadata,
            normalized,
        }
    }

    fn marker_edit(&self, cb: &ClassifiedBlock, id: &str, kind: StatementKind) -> SourceEdit {
        SourceEdit {
            range: cb.block.byte_start..cb.block.byte_end,
            replacement: render::marker_text(
                &self.options.marker_template,
                id,
                kind,
                cb.block.containing_function.as_deref(),
                cb.block.line_start,
            ),
        }
    }

    fn merged_statement(&self, declare: &ClassifiedBlock, m: MergedCursor, id: String) -> ExtractedStatement {
        let parameterized_text = render::parameterize(
            &m.normalized_text,
            StatementKind::Select,
            &self.host_vars,
            &self.options.placeholder_template,
        );
        // The DECLARE matched the cursor rule, so select-level metadata
        // (isolation, row limits) comes from the merged query.
        let metadata = self.registry.classify(&m.normalized_text).metadata;
        ExtractedStatement {
            id,
            kind: StatementKind::Select,
            raw_text: declare.block.text.clone(),
            normalized_text: m.normalized_text,
            parameterized_text,
            input_vars: m.input_vars,
            output_vars: m.output_vars,
            function: declare.block.containing_function.clone(),
            line_range: (declare.block.line_start, declare.block.line_end),
            relationship: Some(Relationship::Cursor(m.relation)),
            confidence: declare.confidence,
            metadata,
        }
    }

    fn statement(
        &self,
        cb: &ClassifiedBlock,
        id: String,
        source: &str,
        lines: &LineIndex,
        functions: &[FunctionSpan],
        calls: &[StringCall],
    ) -> ExtractedStatement {
        let (input_vars, output_vars) = self.host_vars.classify_by_direction(&cb.normalized, cb.kind);
        let parameterized_text = render::parameterize(
            &cb.normalized,
            cb.kind,
            &self.host_vars,
            &self.options.placeholder_template,
        );

        let mut confidence = cb.confidence;
        let relationship = match cb.kind {
            StatementKind::Prepare | StatementKind::Execute => {
                let record = self.dynamic_record(cb, source, lines, functions, calls);
                if let Some(r) = &record {
                    confidence = confidence.min(r.confidence);
                }
                record.map(Relationship::DynamicSql)
            }
            kind => relations::array_dml_relationship(
                kind,
                render::array_size_var(&cb.block.text),
                &input_vars,
            ),
        };

        ExtractedStatement {
            id,
            kind: cb.kind,
            raw_text: cb.block.text.clone(),
            normalized_text: cb.normalized.clone(),
            parameterized_text,
            input_vars,
            output_vars,
            function: cb.block.containing_function.clone(),
            line_range: (cb.block.line_start, cb.block.line_end),
            relationship,
            confidence,
            metadata: cb.metadata.clone(),
        }
    }

    fn dynamic_record(
        &self,
        cb: &ClassifiedBlock,
        source: &str,
        lines: &LineIndex,
        functions: &[FunctionSpan],
        calls: &[StringCall],
    ) -> Option<DynamicSqlRecord> {
        let prepared = dynamic_sql::prepare_source(&cb.normalized)?;
        let record = match prepared.operand {
            SqlOperand::Literal(sql) => DynamicSqlRecord {
                statement_name: prepared.statement_name,
                variable: None,
                reconstructed_sql: Some(render::collapse_whitespace(&sql)),
                confidence: 1.0,
                operations: Vec::new(),
                unresolved: 0,
                executions: Vec::new(),
                parameters: Vec::new(),
                has_deallocate: false,
            },
            SqlOperand::Variable(variable) => {
                let scope_start = function_at_line(functions, cb.block.line_start)
                    .and_then(|f| lines.line_start(f.line_start))
                    .unwrap_or(0);
                let scoped: Vec<StringCall> =
                    dynamic_sql::calls_in_scope(calls, scope_start..source.len(), cb.block.byte_start)
                        .cloned()
                        .collect();
                let rebuilt = dynamic_sql::reconstruct(&scoped, &variable);
                match &rebuilt.text {
                    Some(sql) => debug!(
                        "Reconstructed :{} at line {} ({:.2}): {}",
                        variable, cb.block.line_start, rebuilt.confidence, sql
                    ),
                    None => debug!(
                        "No string operations found for :{} before line {}",
                        variable, cb.block.line_start
                    ),
                }
                DynamicSqlRecord {
                    statement_name: prepared.statement_name,
                    variable: Some(variable),
                    reconstructed_sql: rebuilt.text,
                    confidence: rebuilt.confidence,
                    operations: rebuilt.operations,
                    unresolved: rebuilt.unresolved,
                    executions: Vec::new(),
                    parameters: Vec::new(),
                    has_deallocate: false,
                }
            }
        };
        Some(record)
    }
}

/// Declarations between each BEGIN / END DECLARE SECTION pair.
fn declare_sections(classified: &[ClassifiedBlock], source: &str) -> Vec<DeclareSection> {
    let mut sections = Vec::new();
    let mut begin: Option<&SourceBlock> = None;

    for cb in classified {
        match cb.kind {
            StatementKind::DeclareSectionBegin => begin = Some(&cb.block),
            StatementKind::DeclareSectionEnd => {
                let Some(open) = begin.take() else {
                    debug!("END DECLARE SECTION at line {} without BEGIN", cb.block.line_start);
                    continue;
                };
                let body = boundary::mask_comments(&source[open.byte_end..cb.block.byte_start]);
                sections.push(DeclareSection {
                    line_start: open.line_start,
                    line_end: cb.block.line_end,
                    function: open.containing_function.clone(),
                    declarations: body
                        .split(';')
                        .map(render::collapse_whitespace)
                        .filter(|decl| !decl.is_empty())
                        .collect(),
                });
            }
            _ => {}
        }
    }

    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        Extractor::new(Arc::new(RuleRegistry::with_defaults()), ExtractOptions::default())
    }

    #[test]
    fn test_sequential_ids_in_source_order() {
        let source = r#"
void f(void)
{
    EXEC SQL SELECT a INTO :a FROM t1;
    EXEC SQL DECLARE c1 CURSOR FOR SELECT b FROM t2;
    EXEC SQL SELECT c INTO :c FROM t3;
    EXEC SQL INSERT INTO t4 VALUES (:a);
}
"#;
        let result = extractor().extract(source, None);
        let ids: Vec<&str> = result.statements.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["select_0", "select_1", "select_2", "insert_0"]);
    }

    #[test]
    fn test_cursor_members_not_emitted() {
        let source = r#"
int list(void)
{
    EXEC SQL DECLARE c1 CURSOR FOR SELECT id, name FROM employees;
    EXEC SQL OPEN c1;
    for (;;) {
        EXEC SQL FETCH c1 INTO :emp_id, :emp_name;
    }
    EXEC SQL CLOSE c1;
    return 0;
}
"#;
        let result = extractor().extract(source, None);
        assert_eq!(result.statements.len(), 1, "{:?}", result.statements);
        let stmt = &result.statements[0];
        assert_eq!(stmt.id, "select_0");
        assert_eq!(stmt.kind, StatementKind::Select);
        assert_eq!(
            stmt.normalized_text,
            "SELECT id, name INTO :emp_id, :emp_name FROM employees"
        );
        assert_eq!(stmt.parameterized_text, "SELECT id, name FROM employees");
        assert_eq!(
            result.marked_source.matches("/* sql extracted: select_0 */").count(),
            4,
            "every cursor statement points at the merged id"
        );
        assert!(result.statements.iter().all(|s| {
            matches!(&s.relationship, Some(Relationship::Cursor(c)) if c.is_loop_based && c.fetches.len() == 1)
        }));
    }

    #[test]
    fn test_dynamic_sql_reconstruction() {
        let source = r#"
void run(void)
{
    char buf[256];
    strcpy(buf, "SELECT * ");
    strcat(buf, "FROM employees");
    EXEC SQL PREPARE s FROM :buf;
    EXEC SQL EXECUTE s;
}
"#;
        let result = extractor().extract(source, None);
        let prepare = &result.statements[0];
        assert_eq!(prepare.id, "dynamic_0");
        match &prepare.relationship {
            Some(Relationship::DynamicSql(record)) => {
                assert_eq!(record.reconstructed_sql.as_deref(), Some("SELECT * FROM employees"));
                assert_eq!(record.unresolved, 0);
                assert_eq!(record.statement_name.as_deref(), Some("s"));
                assert!(record.confidence > 0.85);
            }
            other => panic!("expected dynamic SQL relationship, got {other:?}"),
        }
        assert_eq!(result.statements[1].id, "dynamic_1");
        assert_eq!(
            result.statements[1].relationship,
            Some(Relationship::Execution {
                statement_name: "s".into(),
                prepare_id: "dynamic_0".into(),
            })
        );
    }

    #[test]
    fn test_prepared_statement_executions() {
        let source = r#"
void run(void)
{
    EXEC SQL PREPARE upd FROM 'UPDATE emp SET sal = :1 WHERE id = :2';
    EXEC SQL EXECUTE upd USING :new_sal, :emp_id;
    EXEC SQL EXECUTE upd USING :bonus, :emp_id;
    EXEC SQL DEALLOCATE PREPARE upd;
}
"#;
        let result = extractor().extract(source, None);
        match &result.statements[0].relationship {
            Some(Relationship::DynamicSql(record)) => {
                assert_eq!(record.executions, vec!["dynamic_1", "dynamic_2"]);
                assert_eq!(record.parameters, vec!["new_sal", "emp_id", "bonus"]);
                assert!(record.has_deallocate);
            }
            other => panic!("expected dynamic SQL relationship, got {other:?}"),
        }
        assert!(matches!(
            &result.statements[2].relationship,
            Some(Relationship::Execution { prepare_id, .. }) if prepare_id == "dynamic_0"
        ));
    }

    #[test]
    fn test_declare_section_body_recorded() {
        let source = r#"EXEC SQL BEGIN DECLARE SECTION;
    char emp_name[41];   /* padded */
    int  emp_id;
    VARCHAR pwd[20];
EXEC SQL END DECLARE SECTION;
"#;
        let result = extractor().extract(source, None);
        assert!(result.statements.is_empty());
        assert_eq!(result.declare_sections.len(), 1);
        let section = &result.declare_sections[0];
        assert_eq!((section.line_start, section.line_end), (1, 5));
        assert_eq!(
            section.declarations,
            vec!["char emp_name[41]", "int emp_id", "VARCHAR pwd[20]"]
        );
    }

    #[test]
    fn test_skipped_declare_leaves_members() {
        let mut options = ExtractOptions::default();
        options.skip_kinds.insert(StatementKind::DeclareCursor);
        let extractor = Extractor::new(Arc::new(RuleRegistry::with_defaults()), options);
        let source = "EXEC SQL DECLARE c1 CURSOR FOR SELECT a FROM t;\n\
                      EXEC SQL OPEN c1;\n\
                      EXEC SQL FETCH c1 INTO :a;\n\
                      EXEC SQL CLOSE c1;\n";
        let result = extractor.extract(source, None);
        let ids: Vec<&str> = result.statements.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["cursor_op_0", "select_0", "cursor_op_1"]);
        assert_eq!(result.statements[1].kind, StatementKind::FetchInto);
        assert!(!result.marked_source.contains("DECLARE"));
        assert!(result.marked_source.contains("/* sql extracted: cursor_op_1 */"));
    }

    #[test]
    fn test_merged_cursor_carries_select_metadata() {
        let mut registry = RuleRegistry::with_defaults();
        registry.load_db2_rules();
        let extractor = Extractor::new(Arc::new(registry), ExtractOptions::default());
        let source = "EXEC SQL DECLARE c1 CURSOR FOR SELECT a FROM t WITH UR;\n\
                      EXEC SQL OPEN c1;\n\
                      EXEC SQL FETCH c1 INTO :a;\n\
                      EXEC SQL CLOSE c1;\n";
        let result = extractor.extract(source, None);
        assert_eq!(result.statements.len(), 1);
        let merged = &result.statements[0];
        assert_eq!(merged.kind, StatementKind::Select);
        assert_eq!(merged.metadata.get("isolation_level").map(String::as_str), Some("UR"));
        assert_eq!(merged.metadata.get("dbms").map(String::as_str), Some("db2"));
    }

    #[test]
    fn test_dynamic_sql_scoped_to_function() {
        let source = r#"
void other(void)
{
    strcpy(buf, "DELETE FROM audit");
}

void run(void)
{
    EXEC SQL PREPARE s FROM :buf;
}
"#;
        let spans = [
            FunctionSpan {
                name: "other".into(),
                line_start: 2,
                line_end: 5,
            },
            FunctionSpan {
                name: "run".into(),
                line_start: 7,
                line_end: 10,
            },
        ];
        let result = extractor().extract(source, Some(&spans));
        assert_eq!(result.statements[0].function.as_deref(), Some("run"));
        match &result.statements[0].relationship {
            Some(Relationship::DynamicSql(record)) => {
                assert!(record.reconstructed_sql.is_none());
                assert_eq!(record.confidence, 0.0);
            }
            other => panic!("expected dynamic SQL relationship, got {other:?}"),
        }
        assert_eq!(result.summary.low_confidence, 1);
    }

    #[test]
    fn test_summary_counts() {
        let source = "EXEC SQL INCLUDE sqlca;\nEXEC SQL MERGE INTO t USING s ON (1 = 1);\nEXEC SQL COMMIT\n";
        let result = extractor().extract(source, None);
        assert_eq!(result.summary.total, 1);
        assert_eq!(result.summary.unknown, 1);
        assert_eq!(result.summary.dropped, 1);
        assert_eq!(result.statements[0].id, "unknown_0");
        assert!(
            !result.marked_source.contains("INCLUDE"),
            "skipped kinds are removed from the marked source"
        );
        assert!(result.marked_source.contains("EXEC SQL COMMIT"), "dropped blocks stay intact");
    }

    #[test]
    fn test_supplied_function_spans_win() {
        let source = "EXEC SQL COMMIT;\n";
        let spans = [FunctionSpan {
            name: "from_call_graph".into(),
            line_start: 1,
            line_end: 1,
        }];
        let result = extractor().extract(source, Some(&spans));
        assert_eq!(result.statements[0].function.as_deref(), Some("from_call_graph"));
    }

    #[test]
    fn test_text_scan_only() {
        let options = ExtractOptions {
            use_syntax_tree: false,
            ..ExtractOptions::default()
        };
        let extractor = Extractor::new(Arc::new(RuleRegistry::with_defaults()), options);
        let result = extractor.extract("EXEC SQL FOR :n INSERT INTO t VALUES (:a, :b);", None);
        let stmt = &result.statements[0];
        assert_eq!(stmt.kind, StatementKind::Insert);
        assert_eq!(stmt.parameterized_text, "INSERT INTO t VALUES (#{a}, #{b})");
        assert_eq!(
            stmt.relationship,
            Some(Relationship::ArrayDml {
                size_var: "n".into(),
                array_vars: vec!["a".into(), "b".into()],
            })
        );
    }
}
