use super::types::{ExtractedStatement, HostVariableRef, Relationship, StatementKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::LazyLock;

static EXECUTE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:AT\s+:?\w+\s+)?EXECUTE\s+(\w+)").expect("valid regex")
});

static DEALLOCATE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*(?:AT\s+:?\w+\s+)?DEALLOCATE\s+(?:PREPARE\s+)?(\w+)")
        .expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationType {
    Cursor,
    DynamicSql,
    Execution,
    ArrayDml,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Cursor => "cursor",
            RelationType::DynamicSql => "dynamic_sql",
            RelationType::Execution => "execution",
            RelationType::ArrayDml => "array_dml",
        }
    }
}

impl Relationship {
    pub fn relation_type(&self) -> RelationType {
        match self {
            Relationship::Cursor(_) => RelationType::Cursor,
            Relationship::DynamicSql(_) => RelationType::DynamicSql,
            Relationship::Execution { .. } => RelationType::Execution,
            Relationship::ArrayDml { .. } => RelationType::ArrayDml,
        }
    }
}

/// Links `EXECUTE name` and `DEALLOCATE name` to the latest PREPARE of `name`
/// before them. Names compare case-insensitively. `statements` must be in
/// source order.
pub fn link_prepared_statements(statements: &mut [ExtractedStatement]) {
    let mut latest: HashMap<String, usize> = HashMap::new();

    for idx in 0..statements.len() {
        let stmt = &statements[idx];
        if let Some(Relationship::DynamicSql(record)) = &stmt.relationship {
            if stmt.kind == StatementKind::Prepare {
                if let Some(name) = &record.statement_name {
                    latest.insert(name.to_ascii_lowercase(), idx);
                }
            }
            continue;
        }

        if stmt.kind == StatementKind::Execute && stmt.relationship.is_none() {
            let Some(name) = capture_name(&EXECUTE_NAME_RE, &stmt.normalized_text) else {
                continue;
            };
            let Some(&prepare) = latest.get(&name.to_ascii_lowercase()) else {
                tracing::debug!("{} executes {} with no PREPARE before it", stmt.id, name);
                continue;
            };
            let execute_id = stmt.id.clone();
            let using: Vec<String> = stmt.input_vars.iter().map(|v| v.var_name.clone()).collect();
            let prepare_id = statements[prepare].id.clone();

            if let Some(Relationship::DynamicSql(record)) = &mut statements[prepare].relationship {
                record.executions.push(execute_id);
                for var in using {
                    if !record.parameters.contains(&var) {
                        record.parameters.push(var);
                    }
                }
            }
            statements[idx].relationship = Some(Relationship::Execution {
                statement_name: name,
                prepare_id,
            });
        } else if let Some(name) = capture_name(&DEALLOCATE_NAME_RE, &stmt.normalized_text) {
            if let Some(&prepare) = latest.get(&name.to_ascii_lowercase()) {
                if let Some(Relationship::DynamicSql(record)) = &mut statements[prepare].relationship {
                    record.has_deallocate = true;
                }
            }
        }
    }
}

fn capture_name(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Statements of one function that end at the same COMMIT or ROLLBACK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionGroup {
    pub id: String,
    pub function: Option<String>,
    pub statement_ids: Vec<String>,
    pub boundary_id: String,
    pub is_commit: bool,
    pub has_later_rollback: bool,
}

/// Kinds that never belong to a unit of work.
fn outside_transactions(kind: StatementKind) -> bool {
    matches!(
        kind,
        StatementKind::Commit
            | StatementKind::Rollback
            | StatementKind::Connect
            | StatementKind::Disconnect
            | StatementKind::Whenever
            | StatementKind::Include
            | StatementKind::DeclareSectionBegin
            | StatementKind::DeclareSectionEnd
    )
}

/// Groups each function's statements by the COMMIT/ROLLBACK that follows them.
/// A statement joins the first boundary after it; boundaries with nothing new
/// in front of them produce no group. Statements outside any function share
/// the `global` scope.
pub fn detect_transactions(statements: &[ExtractedStatement]) -> Vec<TransactionGroup> {
    let mut by_function: BTreeMap<Option<&str>, Vec<&ExtractedStatement>> = BTreeMap::new();
    for stmt in statements {
        by_function
            .entry(stmt.function.as_deref())
            .or_default()
            .push(stmt);
    }

    let mut groups = Vec::new();
    for (function, mut members) in by_function {
        members.sort_by_key(|s| s.line_range.0);
        let mut grouped: HashSet<&str> = HashSet::new();

        for (pos, boundary) in members.iter().enumerate() {
            if !matches!(boundary.kind, StatementKind::Commit | StatementKind::Rollback) {
                continue;
            }
            let statement_ids: Vec<String> = members[..pos]
                .iter()
                .filter(|s| !outside_transactions(s.kind) && grouped.insert(s.id.as_str()))
                .map(|s| s.id.clone())
                .collect();
            if statement_ids.is_empty() {
                continue;
            }

            let has_later_rollback = members[pos + 1..]
                .iter()
                .any(|s| s.kind == StatementKind::Rollback);
            groups.push(TransactionGroup {
                id: format!("txn_{}_{}", function.unwrap_or("global"), groups.len() + 1),
                function: function.map(str::to_string),
                statement_ids,
                boundary_id: boundary.id.clone(),
                is_commit: boundary.kind == StatementKind::Commit,
                has_later_rollback,
            });
        }
    }

    groups
}

/// `array_dml` relationship for `FOR :n` INSERT/UPDATE/DELETE statements.
pub fn array_dml_relationship(
    kind: StatementKind,
    size_var: Option<String>,
    inputs: &[HostVariableRef],
) -> Option<Relationship> {
    if !matches!(
        kind,
        StatementKind::Insert | StatementKind::Update | StatementKind::Delete
    ) {
        return None;
    }
    let size_var = size_var?;
    let mut array_vars: Vec<String> = Vec::new();
    for var in inputs {
        if var.var_name != size_var && !array_vars.contains(&var.var_name) {
            array_vars.push(var.var_name.clone());
        }
    }
    Some(Relationship::ArrayDml {
        size_var,
        array_vars,
    })
}
