use crate::extractor::types::{ExtractedStatement, HostVariableRef, Relationship};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A host variable as stored and exported. Spans are dropped: they only make
/// sense against the in-memory statement text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarRecord {
    pub name: String,
    pub var_name: String,
    pub shape: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicator: Option<String>,
    pub raw_text: String,
}

impl From<&HostVariableRef> for VarRecord {
    fn from(var: &HostVariableRef) -> Self {
        Self {
            name: var.binding_name(),
            var_name: var.var_name.clone(),
            shape: var.shape.as_str().to_string(),
            field_name: var.field_name.clone(),
            array_index: var.array_index.clone(),
            indicator: var.indicator_name.clone(),
            raw_text: var.raw_text.clone(),
        }
    }
}

/// Persisted form of one extracted statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatementRecord {
    pub id: String,
    pub kind: String,
    pub raw_content: String,
    pub normalized_sql: String,
    pub parameterized_sql: String,
    pub input_vars: Vec<VarRecord>,
    pub output_vars: Vec<VarRecord>,
    pub line_start: usize,
    pub line_end: usize,
    pub function: Option<String>,
    pub relationship: Option<Relationship>,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl From<&ExtractedStatement> for StatementRecord {
    fn from(stmt: &ExtractedStatement) -> Self {
        Self {
            id: stmt.id.clone(),
            kind: stmt.kind.as_str().to_string(),
            raw_content: stmt.raw_text.clone(),
            normalized_sql: stmt.normalized_text.clone(),
            parameterized_sql: stmt.parameterized_text.clone(),
            input_vars: stmt.input_vars.iter().map(VarRecord::from).collect(),
            output_vars: stmt.output_vars.iter().map(VarRecord::from).collect(),
            line_start: stmt.line_range.0,
            line_end: stmt.line_range.1,
            function: stmt.function.clone(),
            relationship: stmt.relationship.clone(),
            confidence: stmt.confidence,
            metadata: stmt.metadata.clone(),
        }
    }
}

/// Where a host variable is used, for lineage lookups.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarUsage {
    pub file: String,
    pub statement_id: String,
    pub kind: String,
    pub function: Option<String>,
    pub direction: String,
    pub raw_text: String,
    pub line_start: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredDiagnostic {
    pub kind: String,
    pub line: usize,
    pub message: String,
}
