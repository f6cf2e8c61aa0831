//! Recovery of SQL text assembled at runtime with C string functions.
//!
//! The calls in front of a PREPARE are replayed once, in source order, over a
//! map of tracked string values. Branches and loops are not modeled: whatever
//! linear sequence of `strcpy`/`strcat`/`sprintf` calls precedes the statement is
//! what gets replayed, so the result carries a confidence score instead of a
//! guarantee.
use super::boundary;
use super::render::collapse_whitespace;
use regex::Regex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::LazyLock;

const OPERATION_PENALTY: f32 = 0.05;
const UNRESOLVED_PENALTY: f32 = 0.1;
const UNRESOLVED: &str = "?";

static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(strcpy|strncpy|strcat|strncat|sprintf|snprintf)\s*\(").expect("valid regex")
});

static FORMAT_SPEC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%%|%[-+ #0-9.*]*(?:hh|h|ll|l|L|z|j|t)?[a-zA-Z]").expect("valid regex")
});

static PREPARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:EXEC\s+SQL\s+)?(?:AT\s+:?\w+\s+)?PREPARE\s+(\w+)\s+FROM\s+(.+?)\s*;?\s*$")
        .expect("valid regex")
});

static EXECUTE_IMMEDIATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:EXEC\s+SQL\s+)?(?:AT\s+:?\w+\s+)?EXECUTE\s+IMMEDIATE\s+(.+?)\s*;?\s*$")
        .expect("valid regex")
});

static CAST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(\s*(?:const\s+|unsigned\s+|signed\s+)*\w+\s*\**\s*\)").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFn {
    Strcpy,
    Strncpy,
    Strcat,
    Strncat,
    Sprintf,
    Snprintf,
}

impl StringFn {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "strcpy" => Some(StringFn::Strcpy),
            "strncpy" => Some(StringFn::Strncpy),
            "strcat" => Some(StringFn::Strcat),
            "strncat" => Some(StringFn::Strncat),
            "sprintf" => Some(StringFn::Sprintf),
            "snprintf" => Some(StringFn::Snprintf),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StringFn::Strcpy => "strcpy",
            StringFn::Strncpy => "strncpy",
            StringFn::Strcat => "strcat",
            StringFn::Strncat => "strncat",
            StringFn::Sprintf => "sprintf",
            StringFn::Snprintf => "snprintf",
        }
    }
}

/// One string-building call found in the C source.
#[derive(Debug, Clone, PartialEq)]
pub struct StringCall {
    pub func: StringFn,
    pub args: Vec<String>,
    pub range: Range<usize>,
}

impl StringCall {
    fn describe(&self) -> String {
        collapse_whitespace(&format!("{}({})", self.func.as_str(), self.args.join(", ")))
    }
}

/// Where a PREPARE or EXECUTE IMMEDIATE takes its SQL from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlOperand {
    Literal(String),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareSource {
    /// `None` for EXECUTE IMMEDIATE.
    pub statement_name: Option<String>,
    pub operand: SqlOperand,
}

/// Parses the source operand of `PREPARE s FROM ...` or `EXECUTE IMMEDIATE ...`.
pub fn prepare_source(text: &str) -> Option<PrepareSource> {
    let (statement_name, operand) = if let Some(caps) = PREPARE_RE.captures(text) {
        (caps.get(1).map(|m| m.as_str().to_string()), caps.get(2)?.as_str())
    } else {
        let caps = EXECUTE_IMMEDIATE_RE.captures(text)?;
        (None, caps.get(1)?.as_str())
    };

    let operand = operand.trim();
    let operand = if operand.starts_with('\'') {
        SqlOperand::Literal(sql_literal(operand)?)
    } else if operand.starts_with('"') {
        SqlOperand::Literal(c_literal(operand)?)
    } else {
        let name = normalize_target(operand.trim_start_matches(':')).0;
        if name.is_empty() {
            return None;
        }
        SqlOperand::Variable(name)
    };

    Some(PrepareSource {
        statement_name,
        operand,
    })
}

/// Every string-building call in `source`, skipping comments and literals.
pub fn scan_string_calls(source: &str) -> Vec<StringCall> {
    let masked = boundary::mask_comments(source);
    let literals = boundary::lexical_regions(&masked);
    let mut calls = Vec::new();

    for caps in CALL_RE.captures_iter(&masked) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if boundary::in_regions(&literals, whole.start()) {
            continue;
        }
        let Some(func) = StringFn::from_name(name.as_str()) else {
            continue;
        };
        // `whole` ends just past the opening parenthesis.
        if let Some((args, end)) = split_call_args(&masked, whole.end()) {
            calls.push(StringCall {
                func,
                args,
                range: whole.start()..end,
            });
        }
    }

    calls
}

/// Splits the arguments of a call whose `(` ends right before `from`. Returns the
/// arguments and the offset just past the closing `)`.
fn split_call_args(source: &str, from: usize) -> Option<(Vec<String>, usize)> {
    let bytes = source.as_bytes();
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut arg_start = from;
    let mut i = from;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 1;
            } else if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'(' | b'[' | b'{' => depth += 1,
            b')' if depth == 0 => {
                let last = source[arg_start..i].trim();
                if !last.is_empty() || !args.is_empty() {
                    args.push(last.to_string());
                }
                return Some((args, i + 1));
            }
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                args.push(source[arg_start..i].trim().to_string());
                arg_start = i + 1;
            }
            // A statement end before the closing parenthesis: not a call we can read.
            b';' => return None,
            _ => {}
        }
        i += 1;
    }

    None
}

/// Best-known value of one C variable.
#[derive(Debug, Clone, Default, PartialEq)]
struct TrackedValue {
    text: String,
    ops: usize,
    unresolved: usize,
    operations: Vec<String>,
}

impl TrackedValue {
    fn unresolved() -> Self {
        Self {
            text: UNRESOLVED.to_string(),
            unresolved: 1,
            ..Self::default()
        }
    }

    fn literal(text: String) -> Self {
        Self {
            text,
            ..Self::default()
        }
    }

    fn append(&mut self, other: TrackedValue) {
        self.text.push_str(&other.text);
        self.ops += other.ops;
        self.unresolved += other.unresolved;
        self.operations.extend(other.operations);
    }

    fn record(&mut self, operation: String) {
        self.ops += 1;
        self.operations.push(operation);
    }
}

/// Variable name to tracked value, rebuilt for every reconstruction.
#[derive(Debug, Default)]
struct StringState {
    values: HashMap<String, TrackedValue>,
}

impl StringState {
    fn resolve(&self, operand: &str) -> TrackedValue {
        let operand = operand.trim();
        if operand.starts_with('"') || operand.starts_with("L\"") {
            return c_literal(operand.trim_start_matches('L'))
                .map_or_else(TrackedValue::unresolved, TrackedValue::literal);
        }
        let (name, _) = normalize_target(operand);
        self.values
            .get(&name)
            .cloned()
            .unwrap_or_else(TrackedValue::unresolved)
    }

    fn apply(&mut self, call: &StringCall) {
        let Some(dest) = call.args.first() else {
            return;
        };
        let (dest, offset_write) = normalize_target(dest);
        if dest.is_empty() {
            return;
        }

        let produced = match call.func {
            StringFn::Strcpy | StringFn::Strncpy | StringFn::Strcat | StringFn::Strncat => {
                let Some(src) = call.args.get(1) else { return };
                self.resolve(src)
            }
            StringFn::Sprintf | StringFn::Snprintf => {
                let fmt_at = if call.func == StringFn::Sprintf { 1 } else { 2 };
                let Some(fmt) = call.args.get(fmt_at) else {
                    return;
                };
                self.format(fmt, &call.args[fmt_at + 1..])
            }
        };

        let appends = matches!(call.func, StringFn::Strcat | StringFn::Strncat) || offset_write;
        let mut value = if appends {
            self.values.get(&dest).cloned().unwrap_or_default()
        } else {
            TrackedValue::default()
        };
        value.append(produced);
        value.record(call.describe());
        self.values.insert(dest, value);
    }

    fn format(&self, fmt: &str, args: &[String]) -> TrackedValue {
        let fmt = self.resolve(fmt);
        let mut out = TrackedValue {
            text: String::new(),
            ops: fmt.ops,
            unresolved: fmt.unresolved,
            operations: fmt.operations,
        };
        let mut args = args.iter();
        let mut last = 0;

        for spec in FORMAT_SPEC_RE.find_iter(&fmt.text) {
            out.text.push_str(&fmt.text[last..spec.start()]);
            last = spec.end();
            if spec.as_str() == "%%" {
                out.text.push('%');
                continue;
            }
            match args.next() {
                Some(arg) => out.append(self.resolve(arg)),
                None => out.append(TrackedValue::unresolved()),
            }
        }
        out.text.push_str(&fmt.text[last..]);
        out
    }
}

/// Outcome of replaying the calls that build one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    pub text: Option<String>,
    pub confidence: f32,
    pub operations: Vec<String>,
    pub unresolved: usize,
}

/// Replays `calls` (already limited to the enclosing function and to the part
/// before the PREPARE) and returns what `variable` ends up holding.
pub fn reconstruct(calls: &[StringCall], variable: &str) -> Reconstruction {
    let mut state = StringState::default();
    for call in calls {
        state.apply(call);
    }

    let (target, _) = normalize_target(variable.trim_start_matches(':'));
    match state.values.remove(&target) {
        Some(value) if value.ops > 0 => Reconstruction {
            text: Some(collapse_whitespace(&value.text)),
            confidence: confidence(value.ops, value.unresolved),
            operations: value.operations,
            unresolved: value.unresolved,
        },
        _ => Reconstruction {
            text: None,
            confidence: 0.0,
            operations: Vec::new(),
            unresolved: 0,
        },
    }
}

pub fn confidence(ops: usize, unresolved: usize) -> f32 {
    let score = 1.0 - OPERATION_PENALTY * ops as f32 - UNRESOLVED_PENALTY * unresolved as f32;
    score.clamp(0.0, 1.0)
}

/// Calls inside `scope` that end before `before`.
pub fn calls_in_scope<'a>(
    calls: &'a [StringCall],
    scope: Range<usize>,
    before: usize,
) -> impl Iterator<Item = &'a StringCall> {
    calls
        .iter()
        .filter(move |c| c.range.start >= scope.start && c.range.end <= before.min(scope.end))
}

/// Reduces a destination expression to the variable it writes:
/// `(char *) stmt.arr` and `stmt->arr` become `stmt`, `&buf[0]` becomes `buf`.
/// The flag is set for `buf + len` style offsets, which append.
fn normalize_target(expr: &str) -> (String, bool) {
    let mut s = expr.trim();
    while let Some(m) = CAST_RE.find(s) {
        s = s[m.end()..].trim_start();
    }
    s = s.trim_start_matches('&').trim();
    if let Some(inner) = s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        s = inner.trim();
    }

    let offset_write = s.contains('+');
    if let Some((base, _)) = s.split_once('+') {
        s = base.trim();
    }
    for suffix in [".arr", "->arr", "[0]"] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped.trim_end();
        }
    }

    (s.to_string(), offset_write)
}

/// Decodes one or more adjacent C string literals.
fn c_literal(text: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = text.trim().chars().peekable();
    let mut seen = false;

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            None if seen => return Some(out),
            Some('"') => seen = true,
            _ => return None,
        }
        loop {
            match chars.next()? {
                '"' => break,
                '\\' => match chars.next()? {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    '0' => {}
                    other => out.push(other),
                },
                c => out.push(c),
            }
        }
    }
}

/// Content of a single-quoted SQL literal, with doubled quotes collapsed.
fn sql_literal(text: &str) -> Option<String> {
    let inner = text.trim().strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("''", "'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct_source(source: &str, variable: &str) -> Reconstruction {
        let calls = scan_string_calls(source);
        reconstruct(&calls, variable)
    }

    #[test]
    fn test_copy_then_append() {
        let source = r#"
            strcpy(buf, "SELECT * ");
            strcat(buf, "FROM employees");
        "#;
        let result = reconstruct_source(source, "buf");
        assert_eq!(result.text.as_deref(), Some("SELECT * FROM employees"));
        assert_eq!(result.unresolved, 0);
        assert_eq!(result.operations.len(), 2);
        assert!((result.confidence - 0.9).abs() < 1e-6, "got {}", result.confidence);
        assert!(result.confidence > 1.0 - OPERATION_PENALTY - UNRESOLVED_PENALTY);
    }

    #[test]
    fn test_sprintf_substitution() {
        let source = r#"
            strcpy(tbl, "EMP");
            sprintf(sql, "SELECT %s FROM %s WHERE id = %d", "name", tbl, emp_id);
        "#;
        let result = reconstruct_source(source, "sql");
        assert_eq!(result.text.as_deref(), Some("SELECT name FROM EMP WHERE id = ?"));
        assert_eq!(result.unresolved, 1);
        // strcpy + sprintf, one unresolved argument
        assert!((result.confidence - 0.8).abs() < 1e-6, "got {}", result.confidence);
    }

    #[test]
    fn test_snprintf_and_missing_args() {
        let source = r#"snprintf(q, sizeof(q), "DELETE FROM %s WHERE a = %ld AND b LIKE '100%%'", name);"#;
        let result = reconstruct_source(source, "q");
        assert_eq!(
            result.text.as_deref(),
            Some("DELETE FROM ? WHERE a = ? AND b LIKE '100%'")
        );
        assert_eq!(result.unresolved, 2);
    }

    #[test]
    fn test_varchar_destinations_and_casts() {
        let source = r#"
            strcpy((char *) stmt.arr, "UPDATE t "
                                      "SET a = 1");
            strcat((char *)stmt.arr, " WHERE b = 2");
            stmt.len = strlen((char *) stmt.arr);
        "#;
        let result = reconstruct_source(source, ":stmt");
        assert_eq!(result.text.as_deref(), Some("UPDATE t SET a = 1 WHERE b = 2"));
    }

    #[test]
    fn test_offset_sprintf_appends() {
        let source = r#"
            len = sprintf(sql, "SELECT a FROM t");
            len += sprintf(sql + len, " WHERE b = %s", "'x'");
        "#;
        let result = reconstruct_source(source, "sql");
        assert_eq!(result.text.as_deref(), Some("SELECT a FROM t WHERE b = 'x'"));
    }

    #[test]
    fn test_unknown_variable() {
        let result = reconstruct_source(r#"strcpy(other, "SELECT 1");"#, "buf");
        assert!(result.text.is_none());
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_unresolved_source_operand() {
        let result = reconstruct_source("strcpy(buf, get_sql());", "buf");
        assert_eq!(result.text.as_deref(), Some("?"));
        assert_eq!(result.unresolved, 1);
    }

    #[test]
    fn test_commented_calls_ignored() {
        let source = r#"
            strcpy(buf, "SELECT 1 FROM dual");
            /* strcat(buf, " WHERE x"); */
            // strcat(buf, " WHERE y");
            printf("strcat(buf, z)");
        "#;
        let calls = scan_string_calls(source);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].func, StringFn::Strcpy);
        assert_eq!(calls[0].args, vec!["buf", "\"SELECT 1 FROM dual\""]);
    }

    #[test]
    fn test_prepare_operands() {
        assert_eq!(
            prepare_source("EXEC SQL PREPARE s1 FROM :sql_buf;"),
            Some(PrepareSource {
                statement_name: Some("s1".into()),
                operand: SqlOperand::Variable("sql_buf".into()),
            })
        );
        assert_eq!(
            prepare_source("PREPARE s2 FROM 'SELECT ''a'' FROM dual'"),
            Some(PrepareSource {
                statement_name: Some("s2".into()),
                operand: SqlOperand::Literal("SELECT 'a' FROM dual".into()),
            })
        );
        assert_eq!(
            prepare_source("EXEC SQL EXECUTE IMMEDIATE :stmt.arr;"),
            Some(PrepareSource {
                statement_name: None,
                operand: SqlOperand::Variable("stmt".into()),
            })
        );
        assert!(prepare_source("EXEC SQL EXECUTE s1 USING :a;").is_none());
    }

    #[test]
    fn test_calls_in_scope() {
        let source = "strcpy(a, \"x\");\nstrcpy(a, \"y\");\nstrcpy(a, \"z\");";
        let calls = scan_string_calls(source);
        let second_line = source.find("strcpy(a, \"y\")").unwrap_or(0);
        let third_line = source.find("strcpy(a, \"z\")").unwrap_or(0);
        let picked: Vec<_> = calls_in_scope(&calls, second_line..source.len(), third_line).collect();
        assert_eq!(picked.len(), 1);
        let result = reconstruct(&picked.into_iter().cloned().collect::<Vec<_>>(), "a");
        assert_eq!(result.text.as_deref(), Some("y"));
    }
}
