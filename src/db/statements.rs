use super::{Db, models::*};
use crate::extractor::FileExtraction;
use crate::extractor::types::{Direction, HostVariableRef, Relationship};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Result, Row, Transaction, params};
use std::collections::{BTreeMap, HashMap};

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn from_json<T: serde::de::DeserializeOwned>(col: usize, text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

fn map_var(row: &Row<'_>) -> Result<(String, VarRecord)> {
    let var_name: String = row.get(2)?;
    let field_name: Option<String> = row.get(3)?;
    let name = match &field_name {
        Some(field) => format!("{var_name}_{field}"),
        None => var_name.clone(),
    };
    Ok((
        row.get(0)?,
        VarRecord {
            name,
            var_name,
            shape: row.get(1)?,
            field_name,
            array_index: row.get(4)?,
            indicator: row.get(5)?,
            raw_text: row.get(6)?,
        },
    ))
}

fn insert_vars(
    tx: &Transaction<'_>,
    statement_id: i64,
    direction: Direction,
    vars: &[HostVariableRef],
) -> Result<()> {
    for (position, var) in vars.iter().enumerate() {
        tx.execute(
            r#"
            INSERT INTO host_vars (statement_id, direction, shape, var_name, field_name, array_index, indicator, raw_text, position)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                statement_id,
                direction.as_str(),
                var.shape.as_str(),
                var.var_name,
                var.field_name,
                var.array_index,
                var.indicator_name,
                var.raw_text,
                position as i64,
            ],
        )?;
    }
    Ok(())
}

impl Db {
    /// Returns a map of path -> modified_at for all extracted files
    pub fn list_files(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut stmt = self.conn.prepare("SELECT path, modified_at FROM files")?;
        let rows = stmt.query_map([], |row| {
            let path: String = row.get(0)?;
            let modified_at: DateTime<Utc> = row.get(1)?;
            Ok((path, modified_at))
        })?;

        let mut files = HashMap::new();
        for row in rows {
            let (path, modified_at) = row?;
            files.insert(path, modified_at);
        }

        Ok(files)
    }

    /// Deletes a file and, by cascade, its statements, host variables and diagnostics
    pub fn delete_file(&self, path: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM files WHERE path = ?", params![path])?;
        Ok(rows > 0)
    }

    /// Replaces everything stored for `path` with a fresh extraction, in one transaction
    pub fn replace_file_results(
        &mut self,
        path: &str,
        modified_at: DateTime<Utc>,
        extraction: &FileExtraction,
    ) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let summary = &extraction.summary;

        let file_id: i64 = tx.query_row(
            r#"
            INSERT INTO files (path, modified_at, extracted_at, total, unknown, dropped, low_confidence)
            VALUES (?, ?, CURRENT_TIMESTAMP, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                modified_at = excluded.modified_at,
                extracted_at = CURRENT_TIMESTAMP,
                total = excluded.total,
                unknown = excluded.unknown,
                dropped = excluded.dropped,
                low_confidence = excluded.low_confidence
            RETURNING id
            "#,
            params![
                path,
                modified_at,
                summary.total as i64,
                summary.unknown as i64,
                summary.dropped as i64,
                summary.low_confidence as i64,
            ],
            |row| row.get(0),
        )?;

        // host_vars go with their statements
        tx.execute("DELETE FROM statements WHERE file_id = ?", params![file_id])?;
        tx.execute("DELETE FROM diagnostics WHERE file_id = ?", params![file_id])?;

        for stmt in &extraction.statements {
            let relationship = stmt.relationship.as_ref().map(to_json).transpose()?;
            let metadata = if stmt.metadata.is_empty() {
                None
            } else {
                Some(to_json(&stmt.metadata)?)
            };
            tx.execute(
                r#"
                INSERT INTO statements (file_id, stmt_id, kind, raw_content, normalized_sql, parameterized_sql, line_start, line_end, function, relation_type, relationship, confidence, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
                params![
                    file_id,
                    stmt.id,
                    stmt.kind.as_str(),
                    stmt.raw_text,
                    stmt.normalized_text,
                    stmt.parameterized_text,
                    stmt.line_range.0 as i64,
                    stmt.line_range.1 as i64,
                    stmt.function,
                    stmt.relationship.as_ref().map(|r| r.relation_type().as_str()),
                    relationship,
                    f64::from(stmt.confidence),
                    metadata,
                ],
            )?;
            let statement_id = tx.last_insert_rowid();
            insert_vars(&tx, statement_id, Direction::Input, &stmt.input_vars)?;
            insert_vars(&tx, statement_id, Direction::Output, &stmt.output_vars)?;
        }

        for diag in &extraction.diagnostics {
            tx.execute(
                "INSERT INTO diagnostics (file_id, kind, line, message) VALUES (?, ?, ?, ?)",
                params![file_id, diag.kind.as_str(), diag.line as i64, diag.message],
            )?;
        }

        tx.commit()?;
        Ok(file_id)
    }

    /// Returns the stored statements of a file in source order
    pub fn statements_for_file(&self, path: &str) -> Result<Vec<StatementRecord>> {
        let file_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM files WHERE path = ?",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(file_id) = file_id else {
            return Ok(Vec::new());
        };

        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, stmt_id, kind, raw_content, normalized_sql, parameterized_sql,
                   line_start, line_end, function, relationship, confidence, metadata
            FROM statements WHERE file_id = ?
            ORDER BY line_start, id
            "#,
        )?;
        let rows = stmt.query_map(params![file_id], |row| {
            let rowid: i64 = row.get(0)?;
            let relationship: Option<String> = row.get(9)?;
            let relationship: Option<Relationship> = relationship
                .as_deref()
                .map(|text| from_json(9, text))
                .transpose()?;
            let metadata: Option<String> = row.get(11)?;
            let metadata: BTreeMap<String, String> = match metadata.as_deref() {
                Some(text) => from_json(11, text)?,
                None => BTreeMap::new(),
            };
            let confidence: f64 = row.get(10)?;
            Ok((
                rowid,
                StatementRecord {
                    id: row.get(1)?,
                    kind: row.get(2)?,
                    raw_content: row.get(3)?,
                    normalized_sql: row.get(4)?,
                    parameterized_sql: row.get(5)?,
                    input_vars: Vec::new(),
                    output_vars: Vec::new(),
                    line_start: row.get::<_, i64>(6)? as usize,
                    line_end: row.get::<_, i64>(7)? as usize,
                    function: row.get(8)?,
                    relationship,
                    confidence: confidence as f32,
                    metadata,
                },
            ))
        })?;

        let mut var_stmt = self.conn.prepare(
            r#"
            SELECT direction, shape, var_name, field_name, array_index, indicator, raw_text
            FROM host_vars WHERE statement_id = ?
            ORDER BY position
            "#,
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (rowid, mut record) = row?;
            let vars = var_stmt.query_map(params![rowid], map_var)?;
            for var in vars {
                let (direction, var) = var?;
                if direction == Direction::Output.as_str() {
                    record.output_vars.push(var);
                } else {
                    record.input_vars.push(var);
                }
            }
            records.push(record);
        }

        Ok(records)
    }

    /// Every statement that binds the host variable `var_name`, across all files
    pub fn find_by_host_var(&self, var_name: &str) -> Result<Vec<VarUsage>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT f.path, s.stmt_id, s.kind, s.function, v.direction, v.raw_text, s.line_start
            FROM host_vars v
            JOIN statements s ON v.statement_id = s.id
            JOIN files f ON s.file_id = f.id
            WHERE v.var_name = ?
            ORDER BY f.path, s.line_start
            "#,
        )?;
        let rows = stmt.query_map(params![var_name], |row| {
            Ok(VarUsage {
                file: row.get(0)?,
                statement_id: row.get(1)?,
                kind: row.get(2)?,
                function: row.get(3)?,
                direction: row.get(4)?,
                raw_text: row.get(5)?,
                line_start: row.get::<_, i64>(6)? as usize,
            })
        })?;
        rows.collect()
    }

    /// Statement counts per kind, most frequent first
    pub fn count_by_kind(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, COUNT(*) AS n FROM statements GROUP BY kind ORDER BY n DESC, kind",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        rows.collect()
    }

    /// Statement counts per relationship type (`cursor`, `dynamic_sql`, ...);
    /// statements without one are left out
    pub fn count_by_relation_type(&self) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT relation_type, COUNT(*) AS n FROM statements
            WHERE relation_type IS NOT NULL
            GROUP BY relation_type ORDER BY n DESC, relation_type
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        rows.collect()
    }

    /// Stored diagnostics of a file, ordered by line
    pub fn diagnostics_for_file(&self, path: &str) -> Result<Vec<StoredDiagnostic>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT d.kind, d.line, d.message
            FROM diagnostics d JOIN files f ON d.file_id = f.id
            WHERE f.path = ?
            ORDER BY d.line, d.id
            "#,
        )?;
        let rows = stmt.query_map(params![path], |row| {
            Ok(StoredDiagnostic {
                kind: row.get(0)?,
                line: row.get::<_, i64>(1)? as usize,
                message: row.get(2)?,
            })
        })?;
        rows.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{ExtractOptions, Extractor, RuleRegistry};
    use std::sync::Arc;

    fn extract(source: &str) -> FileExtraction {
        let options = ExtractOptions {
            use_syntax_tree: false,
            ..ExtractOptions::default()
        };
        Extractor::new(Arc::new(RuleRegistry::with_defaults()), options).extract(source, None)
    }

    const SOURCE: &str = "EXEC SQL SELECT name INTO :emp.name:name_ind FROM emp WHERE id = :emp_id;\n\
                          EXEC SQL UPDATE emp SET name = :new_name WHERE id = :emp_id;\n\
                          EXEC SQL COMMIT;\n\
                          EXEC SQL DELETE FROM audit\n";

    #[test]
    fn test_file_results_crud() {
        let mut db = Db::open_in_memory().unwrap();
        let now = Utc::now();
        let path = "src/emp.pc";

        // 1. Insert
        db.replace_file_results(path, now, &extract(SOURCE)).unwrap();
        let files = db.list_files().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files.contains_key(path));

        // 2. Read back
        let records = db.statements_for_file(path).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["select_0", "update_0", "transaction_0"]);

        let select = &records[0];
        assert_eq!(select.kind, "select");
        assert_eq!(select.parameterized_sql, "SELECT name FROM emp WHERE id = #{emp_id}");
        assert_eq!(select.output_vars.len(), 1);
        assert_eq!(select.output_vars[0].name, "emp_name");
        assert_eq!(select.output_vars[0].shape, "struct_indicator");
        assert_eq!(select.output_vars[0].indicator.as_deref(), Some("name_ind"));
        assert_eq!(select.input_vars[0].var_name, "emp_id");

        let diags = db.diagnostics_for_file(path).unwrap();
        assert_eq!(diags.len(), 1, "{diags:?}");
        assert_eq!(diags[0].kind, "unterminated_block");

        // 3. Re-extract replaces old rows
        db.replace_file_results(path, Utc::now(), &extract("EXEC SQL COMMIT;\n"))
            .unwrap();
        let records = db.statements_for_file(path).unwrap();
        assert_eq!(records.len(), 1);
        let vars: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM host_vars", [], |row| row.get(0))
            .unwrap();
        assert_eq!(vars, 0);
        assert!(db.diagnostics_for_file(path).unwrap().is_empty());

        // 4. Delete cascades
        assert!(db.delete_file(path).unwrap());
        assert!(!db.delete_file(path).unwrap());
        let statements: i64 = db
            .conn
            .query_row("SELECT COUNT(*) FROM statements", [], |row| row.get(0))
            .unwrap();
        assert_eq!(statements, 0);
    }

    #[test]
    fn test_find_by_host_var_and_counts() {
        let mut db = Db::open_in_memory().unwrap();
        db.replace_file_results("a.pc", Utc::now(), &extract(SOURCE)).unwrap();
        db.replace_file_results(
            "b.pc",
            Utc::now(),
            &extract("EXEC SQL INSERT INTO log VALUES (:emp_id);\n"),
        )
        .unwrap();

        let usages = db.find_by_host_var("emp_id").unwrap();
        let found: Vec<(&str, &str)> = usages
            .iter()
            .map(|u| (u.file.as_str(), u.statement_id.as_str()))
            .collect();
        assert_eq!(
            found,
            vec![("a.pc", "select_0"), ("a.pc", "update_0"), ("b.pc", "insert_0")]
        );
        assert!(usages.iter().all(|u| u.direction == "input"));

        let counts = db.count_by_kind().unwrap();
        assert_eq!(counts[0], ("commit".to_string(), 1));
        let total: usize = counts.iter().map(|(_, n)| n).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_relationship_roundtrip() {
        let mut db = Db::open_in_memory().unwrap();
        let extraction = extract("EXEC SQL FOR :n INSERT INTO t VALUES (:a);\n");
        db.replace_file_results("c.pc", Utc::now(), &extraction).unwrap();
        let records = db.statements_for_file("c.pc").unwrap();
        assert_eq!(
            records[0].relationship,
            Some(Relationship::ArrayDml {
                size_var: "n".into(),
                array_vars: vec!["a".into()],
            })
        );
        assert_eq!(records[0], StatementRecord::from(&extraction.statements[0]));
    }

    #[test]
    fn test_count_by_relation_type() {
        let mut db = Db::open_in_memory().unwrap();
        let source = "EXEC SQL FOR :n INSERT INTO t VALUES (:a);\n\
                      EXEC SQL PREPARE s FROM 'DELETE FROM t WHERE id = :1';\n\
                      EXEC SQL EXECUTE s USING :id;\n\
                      EXEC SQL EXECUTE s USING :other_id;\n\
                      EXEC SQL COMMIT;\n";
        db.replace_file_results("d.pc", Utc::now(), &extract(source)).unwrap();

        let counts = db.count_by_relation_type().unwrap();
        assert_eq!(
            counts,
            vec![
                ("execution".to_string(), 2),
                ("array_dml".to_string(), 1),
                ("dynamic_sql".to_string(), 1),
            ]
        );

        let records = db.statements_for_file("d.pc").unwrap();
        match &records[1].relationship {
            Some(Relationship::DynamicSql(record)) => {
                assert_eq!(record.executions, vec!["dynamic_1", "dynamic_2"]);
                assert_eq!(record.parameters, vec!["id", "other_id"]);
            }
            other => panic!("expected dynamic SQL relationship, got {other:?}"),
        }
    }
}
