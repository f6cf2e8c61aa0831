//! Embedded-SQL extraction pipeline.
//!
//! A file goes through the stages below in order, synchronously and without I/O
//! once its text is in memory:
//!
//! 1. [`syntax`] / [`boundary`]: locate `EXEC SQL ... ;` blocks
//! 2. [`classifier`]: assign a [`types::StatementKind`]
//! 3. [`host_vars`]: pull out `:host` references and split them by direction
//! 4. [`cursor`]: fold DECLARE/OPEN/FETCH/CLOSE into one query
//! 5. [`dynamic_sql`]: rebuild the SQL text behind PREPARE / EXECUTE IMMEDIATE
//! 6. [`render`]: normalized and parameterized text, ids, call-site markers
//!
//! [`pipeline::Extractor`] strings them together; [`batch::BatchRunner`] runs it
//! over many files in parallel.

use std::path::PathBuf;
use thiserror::Error;

pub mod batch;
pub mod boundary;
pub mod classifier;
pub mod cursor;
pub mod dynamic_sql;
pub mod host_vars;
pub mod pipeline;
pub mod relations;
pub mod render;
pub mod syntax;
pub mod types;

pub use classifier::RuleRegistry;
pub use pipeline::{ExtractOptions, Extractor, FileExtraction, Summary};
pub use types::{ExtractedStatement, StatementKind};

/// File-level failures. Anything that goes wrong inside a single statement is
/// reported as a [`types::Diagnostic`] instead.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown source encoding: {0}")]
    Encoding(String),

    #[error("C parser error: {0}")]
    Parser(String),
}
