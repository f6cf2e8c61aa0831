//! Priority-ordered statement classification.
//!
//! Every rule answers one question, "does this text look like my kind?". The
//! registry asks them from highest to lowest priority and the first answer wins,
//! so a dialect variant beats the generic rule only by carrying a larger number.
use super::types::StatementKind;
use regex::Regex;
use std::collections::BTreeMap;

/// Optional leading noise before the statement verb: the marker, an `AT :db`
/// clause, an array-DML `FOR :n` prefix and comments/hints.
const STATEMENT_PREFIX: &str = r"(?is)^\s*(?:EXEC\s+SQL\s+)?(?:AT\s+:?\w+\s+)?(?:FOR\s+:?\w+\s+)?(?:/\*.*?\*/\s*)*";

#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub kind: StatementKind,
    pub confidence: f32,
    pub metadata: BTreeMap<String, String>,
}

pub trait ClassificationRule: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn kind(&self) -> StatementKind;
    fn matches(&self, text: &str) -> Option<RuleMatch>;
}

/// Rule backed by a regex anchored after the statement prefix.
///
/// Named capture groups that participate in a match are copied into the
/// metadata, e.g. `FETCH\s+FIRST\s+(?P<fetch_first>\d+)`.
pub struct PatternRule {
    name: String,
    kind: StatementKind,
    priority: i32,
    pattern: Regex,
    metadata: BTreeMap<String, String>,
}

impl PatternRule {
    /// `body` is matched right after the statement prefix, case-insensitively,
    /// with `.` matching newlines.
    pub fn new(
        name: impl Into<String>,
        kind: StatementKind,
        priority: i32,
        body: &str,
    ) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!("{STATEMENT_PREFIX}(?:{body})"))?;
        Ok(Self {
            name: name.into(),
            kind,
            priority,
            pattern,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl ClassificationRule for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn kind(&self) -> StatementKind {
        self.kind
    }

    fn matches(&self, text: &str) -> Option<RuleMatch> {
        let caps = self.pattern.captures(text)?;
        let mut metadata = self.metadata.clone();
        for group in self.pattern.capture_names().flatten() {
            if let Some(m) = caps.name(group) {
                metadata.insert(group.to_string(), m.as_str().to_string());
            }
        }
        Some(RuleMatch {
            kind: self.kind,
            confidence: 1.0,
            metadata,
        })
    }
}

/// Result of classifying one statement. `rule` is `None` for `unknown`.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: StatementKind,
    pub confidence: f32,
    pub metadata: BTreeMap<String, String>,
    pub rule: Option<String>,
}

impl Classification {
    fn unknown() -> Self {
        Self {
            kind: StatementKind::Unknown,
            confidence: 0.0,
            metadata: BTreeMap::new(),
            rule: None,
        }
    }
}

// ── Built-in rule tables ─────────────────────────────────────────────

const BUILTIN_RULES: &[(&str, StatementKind, &str)] = &[
    ("include", StatementKind::Include, r"INCLUDE\b"),
    (
        "declare_section_begin",
        StatementKind::DeclareSectionBegin,
        r"BEGIN\s+DECLARE\s+SECTION\b",
    ),
    (
        "declare_section_end",
        StatementKind::DeclareSectionEnd,
        r"END\s+DECLARE\s+SECTION\b",
    ),
    (
        "declare_cursor",
        StatementKind::DeclareCursor,
        r"DECLARE\s+\w+\s+CURSOR\b",
    ),
    ("fetch_into", StatementKind::FetchInto, r"FETCH\b"),
    ("open", StatementKind::Open, r"OPEN\b"),
    ("close", StatementKind::Close, r"CLOSE\b"),
    ("whenever", StatementKind::Whenever, r"WHENEVER\b"),
    ("prepare", StatementKind::Prepare, r"PREPARE\b"),
    ("execute", StatementKind::Execute, r"EXECUTE\b"),
    ("connect", StatementKind::Connect, r"CONNECT\b"),
    ("disconnect", StatementKind::Disconnect, r"DISCONNECT\b"),
    ("commit", StatementKind::Commit, r"COMMIT\b"),
    ("rollback", StatementKind::Rollback, r"ROLLBACK\b"),
    (
        "select",
        StatementKind::Select,
        r"SELECT\b|WITH\s+\w+(?:\s*\([^)]*\))?\s+AS\s*\(",
    ),
    ("insert", StatementKind::Insert, r"INSERT\b"),
    ("update", StatementKind::Update, r"UPDATE\b"),
    ("delete", StatementKind::Delete, r"DELETE\b"),
];

pub const DB2_PRIORITY: i32 = 55;

const DB2_ISOLATION_LEVELS: &[&str] = &["UR", "CS", "RS", "RR"];

/// Ordered collection of classification rules, read-only once loaded.
pub struct RuleRegistry {
    rules: Vec<Box<dyn ClassificationRule>>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (name, kind, body) in BUILTIN_RULES {
            let rule = PatternRule::new(*name, *kind, kind.default_priority(), body)
                .expect("valid regex");
            registry.register(Box::new(rule));
        }
        registry
    }

    /// Inserts `rule` after every rule with the same or higher priority, so ties
    /// are decided by registration order.
    pub fn register(&mut self, rule: Box<dyn ClassificationRule>) {
        let at = self
            .rules
            .partition_point(|existing| existing.priority() >= rule.priority());
        tracing::debug!(
            "Registered rule '{}' ({}) at priority {}",
            rule.name(),
            rule.kind(),
            rule.priority()
        );
        self.rules.insert(at, rule);
    }

    /// DB2 select variants: isolation clauses and row-limiting clauses.
    pub fn load_db2_rules(&mut self) {
        for level in DB2_ISOLATION_LEVELS {
            let body = format!(r"SELECT\b.*\bWITH\s+{level}\b");
            let rule = PatternRule::new(
                format!("db2_select_with_{}", level.to_ascii_lowercase()),
                StatementKind::Select,
                DB2_PRIORITY,
                &body,
            )
            .expect("valid regex")
            .with_metadata("isolation_level", *level)
            .with_metadata("dbms", "db2");
            self.register(Box::new(rule));
        }

        let row_limits = [
            (
                "db2_fetch_first",
                r"SELECT\b.*\bFETCH\s+FIRST\s+(?P<fetch_first>\d+)\s+ROWS?\s+ONLY\b",
            ),
            (
                "db2_optimize_for",
                r"SELECT\b.*\bOPTIMIZE\s+FOR\s+(?P<optimize_for>\d+)\s+ROWS?\b",
            ),
        ];
        for (name, body) in row_limits {
            let rule = PatternRule::new(name, StatementKind::Select, DB2_PRIORITY, body)
                .expect("valid regex")
                .with_metadata("dbms", "db2");
            self.register(Box::new(rule));
        }
    }

    pub fn classify(&self, text: &str) -> Classification {
        self.rules
            .iter()
            .find_map(|rule| {
                rule.matches(text).map(|m| Classification {
                    kind: m.kind,
                    confidence: m.confidence,
                    metadata: m.metadata,
                    rule: Some(rule.name().to_string()),
                })
            })
            .unwrap_or_else(Classification::unknown)
    }

    pub fn rules(&self) -> impl Iterator<Item = &dyn ClassificationRule> {
        self.rules.iter().map(|r| r.as_ref())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(registry: &RuleRegistry, text: &str) -> StatementKind {
        registry.classify(text).kind
    }

    #[test]
    fn test_builtin_kinds() {
        let registry = RuleRegistry::with_defaults();
        let cases = [
            ("EXEC SQL INCLUDE sqlca;", StatementKind::Include),
            ("EXEC SQL BEGIN DECLARE SECTION;", StatementKind::DeclareSectionBegin),
            ("EXEC SQL END DECLARE SECTION;", StatementKind::DeclareSectionEnd),
            (
                "EXEC SQL DECLARE c1 CURSOR FOR SELECT a FROM t;",
                StatementKind::DeclareCursor,
            ),
            ("EXEC SQL FETCH c1 INTO :a;", StatementKind::FetchInto),
            ("EXEC SQL OPEN c1;", StatementKind::Open),
            ("EXEC SQL CLOSE c1;", StatementKind::Close),
            ("EXEC SQL WHENEVER SQLERROR GOTO err;", StatementKind::Whenever),
            ("EXEC SQL PREPARE s FROM :buf;", StatementKind::Prepare),
            ("EXEC SQL EXECUTE IMMEDIATE :buf;", StatementKind::Execute),
            ("EXEC SQL CONNECT :uid;", StatementKind::Connect),
            ("EXEC SQL DISCONNECT;", StatementKind::Disconnect),
            ("EXEC SQL COMMIT WORK;", StatementKind::Commit),
            ("EXEC SQL ROLLBACK;", StatementKind::Rollback),
            ("EXEC SQL SELECT a INTO :b FROM t;", StatementKind::Select),
            ("EXEC SQL INSERT INTO t VALUES (:a);", StatementKind::Insert),
            ("EXEC SQL UPDATE t SET a = :a;", StatementKind::Update),
            ("EXEC SQL DELETE FROM t;", StatementKind::Delete),
            ("EXEC SQL FOR :n INSERT INTO t VALUES (:a);", StatementKind::Insert),
            ("EXEC SQL /*+ INDEX(t) */ SELECT a FROM t;", StatementKind::Select),
            ("EXEC SQL AT :db UPDATE t SET a = 1;", StatementKind::Update),
            ("EXEC SQL MERGE INTO t USING s ON (1=1);", StatementKind::Unknown),
        ];
        for (text, expected) in cases {
            assert_eq!(kind_of(&registry, text), expected, "classifying {text}");
        }
    }

    #[test]
    fn test_declare_cursor_beats_embedded_select() {
        let registry = RuleRegistry::with_defaults();
        let c = registry.classify("EXEC SQL DECLARE emp_cur CURSOR FOR SELECT id FROM emp;");
        assert_eq!(c.kind, StatementKind::DeclareCursor);
        assert_eq!(c.rule.as_deref(), Some("declare_cursor"));
    }

    #[test]
    fn test_unknown_has_no_rule() {
        let registry = RuleRegistry::new();
        let c = registry.classify("EXEC SQL SELECT 1 FROM dual;");
        assert_eq!(c.kind, StatementKind::Unknown);
        assert!(c.rule.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dialect_rule_wins_by_priority() {
        let mut registry = RuleRegistry::with_defaults();
        registry.register(Box::new(
            PatternRule::new("select_with_ur", StatementKind::Select, 55, r"SELECT\b.*\bWITH\s+UR\b")
                .expect("Failed to build rule")
                .with_metadata("isolation_level", "UR"),
        ));

        let dirty = registry.classify("EXEC SQL SELECT a INTO :a FROM t WITH UR;");
        assert_eq!(dirty.kind, StatementKind::Select);
        assert_eq!(dirty.metadata.get("isolation_level").map(String::as_str), Some("UR"));

        let plain = registry.classify("EXEC SQL SELECT a INTO :a FROM t;");
        assert_eq!(plain.kind, StatementKind::Select);
        assert!(plain.metadata.is_empty());
        assert_eq!(plain.rule.as_deref(), Some("select"));
    }

    #[test]
    fn test_db2_pack_metadata() {
        let mut registry = RuleRegistry::with_defaults();
        registry.load_db2_rules();

        let c = registry.classify("EXEC SQL SELECT a FROM t WITH CS;");
        assert_eq!(c.metadata.get("isolation_level").map(String::as_str), Some("CS"));
        assert_eq!(c.metadata.get("dbms").map(String::as_str), Some("db2"));

        let c = registry.classify("EXEC SQL SELECT a FROM t FETCH FIRST 10 ROWS ONLY;");
        assert_eq!(c.kind, StatementKind::Select);
        assert_eq!(c.metadata.get("fetch_first").map(String::as_str), Some("10"));

        let c = registry.classify("EXEC SQL SELECT a FROM t OPTIMIZE FOR 1 ROW;");
        assert_eq!(c.metadata.get("optimize_for").map(String::as_str), Some("1"));

        // Cursor declarations keep their own kind.
        let c = registry.classify("EXEC SQL DECLARE c CURSOR FOR SELECT a FROM t WITH UR;");
        assert_eq!(c.kind, StatementKind::DeclareCursor);
    }

    #[test]
    fn test_rules_sorted_by_priority() {
        let mut registry = RuleRegistry::with_defaults();
        registry.load_db2_rules();
        let priorities: Vec<i32> = registry.rules().map(|r| r.priority()).collect();
        assert!(priorities.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(registry.len(), BUILTIN_RULES.len() + 6);
    }

    struct MergeRule;

    impl ClassificationRule for MergeRule {
        fn name(&self) -> &str {
            "merge"
        }
        fn priority(&self) -> i32 {
            50
        }
        fn kind(&self) -> StatementKind {
            StatementKind::Update
        }
        fn matches(&self, text: &str) -> Option<RuleMatch> {
            text.to_ascii_uppercase().contains("MERGE INTO").then(|| RuleMatch {
                kind: StatementKind::Update,
                confidence: 0.8,
                metadata: BTreeMap::from([("verb".to_string(), "merge".to_string())]),
            })
        }
    }

    #[test]
    fn test_custom_rule_type() {
        let mut registry = RuleRegistry::with_defaults();
        registry.register(Box::new(MergeRule));
        let c = registry.classify("EXEC SQL MERGE INTO t USING s ON (1=1);");
        assert_eq!(c.kind, StatementKind::Update);
        assert_eq!(c.confidence, 0.8);
    }
}
