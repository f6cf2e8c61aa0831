//! Extraction results database using SQLite
use rusqlite::{Connection, Result};
use std::path::Path;
use tracing::info;

pub mod models;
pub mod statements;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    extracted_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    modified_at DATETIME NOT NULL,
    total INTEGER NOT NULL DEFAULT 0,
    unknown INTEGER NOT NULL DEFAULT 0,
    dropped INTEGER NOT NULL DEFAULT 0,
    low_confidence INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_path ON files(path);

CREATE TABLE IF NOT EXISTS statements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    stmt_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    raw_content TEXT NOT NULL,
    normalized_sql TEXT NOT NULL,
    parameterized_sql TEXT NOT NULL,
    line_start INTEGER NOT NULL,
    line_end INTEGER NOT NULL,
    function TEXT,
    relation_type TEXT,
    relationship TEXT,
    confidence REAL DEFAULT 1.0,
    metadata TEXT,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE,
    UNIQUE(file_id, stmt_id)
);

CREATE INDEX IF NOT EXISTS idx_stmt_file ON statements(file_id);
CREATE INDEX IF NOT EXISTS idx_stmt_kind ON statements(kind);
CREATE INDEX IF NOT EXISTS idx_stmt_function ON statements(function);
CREATE INDEX IF NOT EXISTS idx_stmt_relation ON statements(relation_type);

CREATE TABLE IF NOT EXISTS host_vars (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    statement_id INTEGER NOT NULL,
    direction TEXT NOT NULL,
    shape TEXT NOT NULL,
    var_name TEXT NOT NULL,
    field_name TEXT,
    array_index TEXT,
    indicator TEXT,
    raw_text TEXT NOT NULL,
    position INTEGER NOT NULL,
    FOREIGN KEY (statement_id) REFERENCES statements(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_var_statement ON host_vars(statement_id);
CREATE INDEX IF NOT EXISTS idx_var_name ON host_vars(var_name);

CREATE TABLE IF NOT EXISTS diagnostics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    line INTEGER NOT NULL,
    message TEXT NOT NULL,
    FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_diag_file ON diagnostics(file_id);
"#;

/// A wrapper around a SQLite connection initialized with the application schema.
pub struct Db {
    pub(crate) conn: Connection,
}

impl Db {
    /// Open a database connection at the given path and initialize the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Initializing database: {}", path.display());

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;

        info!("Database initialized successfully");

        Ok(Self { conn })
    }

    /// Open an in-memory database connection (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_init() {
        let db = Db::open_in_memory().expect("Failed to open in-memory DB");

        let tables: usize = db.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('files', 'statements', 'host_vars', 'diagnostics');",
            [],
            |row| row.get(0),
        ).unwrap();
        assert_eq!(tables, 4);

        let fk: i64 = db
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procsql.db");
        drop(Db::open(&path).unwrap());
        // Reopening runs the idempotent schema again.
        assert!(Db::open(&path).is_ok());
    }
}
