//! # procsql — Pro*C embedded-SQL extraction
//!
//! Finds `EXEC SQL` blocks in Pro*C sources, classifies them, separates input
//! and output host variables, folds cursor lifecycles into single queries,
//! rebuilds dynamic SQL assembled with C string functions, and renders
//! parameterized statements for downstream code generators.
//!
//! ## Architecture
//!
//! - **[`extractor`]** — The per-file pipeline and the parallel batch runner
//! - **[`db`]** — SQLite persistence of extraction results (statements, host variables, diagnostics)
//! - **[`config`]** — Configuration loading, validation, and pattern expansion
//! - **[`source`]** — Source decoding with configurable encodings

pub mod config;
pub mod db;
pub mod extractor;
pub mod source;
