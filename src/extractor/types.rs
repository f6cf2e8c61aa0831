//! Core data model shared by every extraction stage.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// A raw `EXEC SQL ... ;` region cut out of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlock {
    pub text: String,
    pub byte_start: usize,
    pub byte_end: usize,
    pub line_start: usize,
    pub line_end: usize,
    pub containing_function: Option<String>,
}

/// A block after classification, with its normalized statement text.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedBlock {
    pub block: SourceBlock,
    pub kind: StatementKind,
    pub confidence: f32,
    pub metadata: BTreeMap<String, String>,
    pub normalized: String,
}

/// Body of one `BEGIN DECLARE SECTION` ... `END DECLARE SECTION` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclareSection {
    pub line_start: usize,
    pub line_end: usize,
    pub function: Option<String>,
    /// One C declaration per entry, comments removed and whitespace collapsed.
    pub declarations: Vec<String>,
}

/// A function's line range, supplied by the call-graph builder or derived from the C parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpan {
    pub name: String,
    pub line_start: usize,
    pub line_end: usize,
}

impl FunctionSpan {
    pub fn contains_line(&self, line: usize) -> bool {
        self.line_start <= line && line <= self.line_end
    }
}

/// Innermost function whose span contains `line`.
pub fn function_at_line(functions: &[FunctionSpan], line: usize) -> Option<&FunctionSpan> {
    functions
        .iter()
        .filter(|f| f.contains_line(line))
        .min_by_key(|f| f.line_end - f.line_start)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    DeclareCursor,
    Open,
    FetchInto,
    Close,
    Prepare,
    Execute,
    Commit,
    Rollback,
    Connect,
    Disconnect,
    Whenever,
    Include,
    DeclareSectionBegin,
    DeclareSectionEnd,
    Unknown,
}

impl StatementKind {
    pub const ALL: [StatementKind; 19] = [
        StatementKind::Select,
        StatementKind::Insert,
        StatementKind::Update,
        StatementKind::Delete,
        StatementKind::DeclareCursor,
        StatementKind::Open,
        StatementKind::FetchInto,
        StatementKind::Close,
        StatementKind::Prepare,
        StatementKind::Execute,
        StatementKind::Commit,
        StatementKind::Rollback,
        StatementKind::Connect,
        StatementKind::Disconnect,
        StatementKind::Whenever,
        StatementKind::Include,
        StatementKind::DeclareSectionBegin,
        StatementKind::DeclareSectionEnd,
        StatementKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
            StatementKind::DeclareCursor => "declare_cursor",
            StatementKind::Open => "open",
            StatementKind::FetchInto => "fetch_into",
            StatementKind::Close => "close",
            StatementKind::Prepare => "prepare",
            StatementKind::Execute => "execute",
            StatementKind::Commit => "commit",
            StatementKind::Rollback => "rollback",
            StatementKind::Connect => "connect",
            StatementKind::Disconnect => "disconnect",
            StatementKind::Whenever => "whenever",
            StatementKind::Include => "include",
            StatementKind::DeclareSectionBegin => "declare_section_begin",
            StatementKind::DeclareSectionEnd => "declare_section_end",
            StatementKind::Unknown => "unknown",
        }
    }

    /// Priority of the built-in rule for this kind. Only consulted while classifying.
    pub fn default_priority(&self) -> i32 {
        match self {
            StatementKind::Include
            | StatementKind::DeclareSectionBegin
            | StatementKind::DeclareSectionEnd => 100,
            StatementKind::DeclareCursor => 90,
            StatementKind::FetchInto => 85,
            StatementKind::Open | StatementKind::Close => 80,
            StatementKind::Whenever => 75,
            StatementKind::Prepare | StatementKind::Execute => 70,
            StatementKind::Connect | StatementKind::Disconnect => 65,
            StatementKind::Commit | StatementKind::Rollback => 60,
            StatementKind::Select
            | StatementKind::Insert
            | StatementKind::Update
            | StatementKind::Delete => 50,
            StatementKind::Unknown => 0,
        }
    }

    /// Counter bucket used for sequential ids (`select_0`, `cursor_op_1`, ...).
    pub fn id_bucket(&self) -> &'static str {
        match self {
            StatementKind::Select | StatementKind::DeclareCursor | StatementKind::FetchInto => {
                "select"
            }
            StatementKind::Open | StatementKind::Close => "cursor_op",
            StatementKind::Commit | StatementKind::Rollback => "transaction",
            StatementKind::Prepare | StatementKind::Execute => "dynamic",
            other => other.as_str(),
        }
    }

    /// Kinds whose `INTO` clause binds output variables.
    pub fn has_output_into(&self) -> bool {
        matches!(self, StatementKind::Select | StatementKind::FetchInto)
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatementKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        StatementKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == lowered)
            .ok_or_else(|| format!("unknown statement kind: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarShape {
    Basic,
    Array,
    Struct,
    Indicator,
    StructIndicator,
    ArrayIndicator,
}

impl VarShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            VarShape::Basic => "basic",
            VarShape::Array => "array",
            VarShape::Struct => "struct",
            VarShape::Indicator => "indicator",
            VarShape::StructIndicator => "struct_indicator",
            VarShape::ArrayIndicator => "array_indicator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "input",
            Direction::Output => "output",
        }
    }
}

/// One `:host` reference inside a statement. `span` is relative to the text it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVariableRef {
    pub shape: VarShape,
    pub var_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicator_name: Option<String>,
    pub raw_text: String,
    pub span: Range<usize>,
}

impl HostVariableRef {
    /// Name used for the rendered placeholder: `user.id` becomes `user_id`,
    /// array subscripts and indicators are dropped.
    pub fn binding_name(&self) -> String {
        match &self.field_name {
            Some(field) => format!("{}_{}", self.var_name, field),
            None => self.var_name.clone(),
        }
    }

    pub fn span_len(&self) -> usize {
        self.span.end - self.span.start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePosition {
    pub line_start: usize,
    pub line_end: usize,
}

impl From<&SourceBlock> for SourcePosition {
    fn from(block: &SourceBlock) -> Self {
        Self {
            line_start: block.line_start,
            line_end: block.line_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRelation {
    pub cursor_name: String,
    pub declare: SourcePosition,
    pub open: Option<SourcePosition>,
    pub fetches: Vec<SourcePosition>,
    pub close: Option<SourcePosition>,
    pub is_loop_based: bool,
}

/// Source of a PREPARE / EXECUTE IMMEDIATE and what it was resolved to.
/// `variable` is `None` when the SQL was written as a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicSqlRecord {
    pub statement_name: Option<String>,
    pub variable: Option<String>,
    pub reconstructed_sql: Option<String>,
    pub confidence: f32,
    pub operations: Vec<String>,
    pub unresolved: usize,
    /// Ids of the EXECUTE statements that run this prepared statement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executions: Vec<String>,
    /// `USING` variables across all executions, first occurrence order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub has_deallocate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Relationship {
    Cursor(CursorRelation),
    DynamicSql(DynamicSqlRecord),
    /// `EXECUTE name`, linked to the PREPARE that defined `name`.
    Execution {
        statement_name: String,
        prepare_id: String,
    },
    ArrayDml {
        size_var: String,
        array_vars: Vec<String>,
    },
}

/// Final artifact handed to generators and the lineage tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedStatement {
    pub id: String,
    pub kind: StatementKind,
    pub raw_text: String,
    pub normalized_text: String,
    pub parameterized_text: String,
    pub input_vars: Vec<HostVariableRef>,
    pub output_vars: Vec<HostVariableRef>,
    pub function: Option<String>,
    pub line_range: (usize, usize),
    pub relationship: Option<Relationship>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    UnterminatedBlock,
    UnknownStatement,
    LowConfidence,
    ParserFallback,
}

impl DiagnosticKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticKind::UnterminatedBlock => "unterminated_block",
            DiagnosticKind::UnknownStatement => "unknown_statement",
            DiagnosticKind::LowConfidence => "low_confidence",
            DiagnosticKind::ParserFallback => "parser_fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub line: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            line,
            message: message.into(),
        }
    }
}
