use super::pipeline::{Extractor, FileExtraction, Summary};
use super::relations::TransactionGroup;
use super::types::{DeclareSection, Diagnostic};
use crate::config::OutputFormat;
use crate::db::Db;
use crate::db::models::StatementRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub extracted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub added: usize,
    pub updated: usize,
    /// Files whose results were discarded because the batch was cancelled.
    pub cancelled: usize,
    pub statements: usize,
    pub summaries: Vec<(String, Summary)>,
}

/// Everything written to `<stem>.sql.{json,yaml}` for one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub file: String,
    pub summary: Summary,
    pub statements: Vec<StatementRecord>,
    pub transactions: Vec<TransactionGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declare_sections: Vec<DeclareSection>,
    pub diagnostics: Vec<Diagnostic>,
}

impl FileReport {
    pub fn new(file: &str, extraction: &FileExtraction) -> Self {
        Self {
            file: file.to_string(),
            summary: extraction.summary.clone(),
            statements: extraction
                .statements
                .iter()
                .map(StatementRecord::from)
                .collect(),
            transactions: extraction.transactions.clone(),
            declare_sections: extraction.declare_sections.clone(),
            diagnostics: extraction.diagnostics.clone(),
        }
    }
}

/// Writes per-file reports and marked sources into one directory.
#[derive(Debug, Clone)]
pub struct OutputSink {
    pub dir: PathBuf,
    pub format: OutputFormat,
}

impl OutputSink {
    pub fn new<P: Into<PathBuf>>(dir: P, format: OutputFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn report_path(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        self.dir
            .join(format!("{stem}.sql.{}", self.format.extension()))
    }

    pub fn marked_path(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "source".to_string());
        match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.dir.join(format!("{stem}.marked.{ext}")),
            None => self.dir.join(format!("{stem}.marked")),
        }
    }

    pub fn write(&self, source: &Path, key: &str, extraction: &FileExtraction) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let report = FileReport::new(key, extraction);
        let data = match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&report).context("failed to serialize report")?
            }
            OutputFormat::Yaml => {
                serde_yaml::to_string(&report).context("failed to serialize report")?
            }
        };
        let report_path = self.report_path(source);
        std::fs::write(&report_path, data)
            .with_context(|| format!("failed to write {}", report_path.display()))?;

        let marked_path = self.marked_path(source);
        std::fs::write(&marked_path, &extraction.marked_source)
            .with_context(|| format!("failed to write {}", marked_path.display()))?;
        Ok(())
    }
}

/// Checks a path against the configured extensions, ignoring case
pub fn is_source_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
}

/// Collects source files under `dir`, sorted. Respects `.gitignore`.
pub fn collect_sources(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let walker = WalkBuilder::new(dir).hidden(false).build();
    let mut files: Vec<PathBuf> = walker
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .map(|e| e.into_path())
        .filter(|p| is_source_file(p, extensions))
        .collect();
    files.sort();
    files
}

struct Job {
    path: PathBuf,
    key: String,
    modified_at: DateTime<Utc>,
    is_new: bool,
}

type JobOutcome = (Job, Option<std::result::Result<FileExtraction, String>>);

/// Runs the extractor over many files. Each file's pipeline runs on the
/// blocking pool, at most `workers` at a time; all database and output writes
/// happen in the single loop that collects the results.
pub struct BatchRunner {
    extractor: Arc<Extractor>,
    encoding: String,
    workers: usize,
    db: Option<Arc<TokioMutex<Db>>>,
    sink: Option<OutputSink>,
}

impl BatchRunner {
    pub fn new(extractor: Arc<Extractor>, encoding: impl Into<String>, workers: usize) -> Self {
        Self {
            extractor,
            encoding: encoding.into(),
            workers: workers.max(1),
            db: None,
            sink: None,
        }
    }

    pub fn with_db(mut self, db: Arc<TokioMutex<Db>>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Extracts all source files in a directory with differential sync
    pub async fn run_directory<P: AsRef<Path>>(
        &self,
        dir: P,
        extensions: &[String],
        force: bool,
        cancel: CancellationToken,
    ) -> Result<SyncResult> {
        let files = collect_sources(dir.as_ref(), extensions);
        self.run(&files, force, cancel).await
    }

    /// Extracts `files`. With a database attached, a file whose modification
    /// time matches the stored one is skipped unless `force` is set.
    pub async fn run(
        &self,
        files: &[PathBuf],
        force: bool,
        cancel: CancellationToken,
    ) -> Result<SyncResult> {
        let existing = match &self.db {
            Some(db) => {
                let db_guard = db.lock().await;
                db_guard.list_files().context("failed to list extracted files")?
            }
            None => Default::default(),
        };

        let mut result = SyncResult::default();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<JobOutcome> = JoinSet::new();

        for path in files {
            let modified_at: DateTime<Utc> = match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(t) => t.into(),
                Err(e) => {
                    warn!("Cannot stat {}: {}", path.display(), e);
                    result.failed += 1;
                    continue;
                }
            };

            // Stored keys use forward slashes on every platform
            let key = path.to_string_lossy().replace('\\', "/");

            let is_new = match existing.get(&key) {
                Some(stored) if !force && stored.timestamp() == modified_at.timestamp() => {
                    debug!("Unchanged, skipping {key}");
                    result.skipped += 1;
                    continue;
                }
                Some(_) => false,
                None => true,
            };

            let job = Job {
                path: path.clone(),
                key,
                modified_at,
                is_new,
            };
            let semaphore = semaphore.clone();
            let extractor = self.extractor.clone();
            let encoding = self.encoding.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (job, None);
                };
                if cancel.is_cancelled() {
                    return (job, None);
                }
                let path = job.path.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    extractor
                        .extract_file(&path, &encoding)
                        .map_err(|e| e.to_string())
                })
                .await
                .unwrap_or_else(|e| Err(format!("extraction task failed: {e}")));
                (job, Some(outcome))
            });
        }

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    result.cancelled += tasks.len();
                    tasks.abort_all();
                    info!("Batch cancelled, {} pending files discarded", result.cancelled);
                    break;
                }
                next = tasks.join_next() => match next {
                    Some(joined) => joined,
                    None => break,
                },
            };

            let (job, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!("Extraction task aborted: {}", e);
                    result.failed += 1;
                    continue;
                }
            };

            let extraction = match outcome {
                Some(Ok(extraction)) => extraction,
                Some(Err(e)) => {
                    warn!("Failed to extract {}: {}", job.key, e);
                    result.failed += 1;
                    continue;
                }
                None => {
                    result.cancelled += 1;
                    continue;
                }
            };

            if let Err(e) = self.store(&job, &extraction).await {
                warn!("Failed to store results for {}: {:#}", job.key, e);
                result.failed += 1;
                continue;
            }

            if job.is_new {
                result.added += 1;
            } else {
                result.updated += 1;
            }
            result.extracted += 1;
            result.statements += extraction.summary.total;
            info!(
                "Extracted {} statements from {} ({} unknown, {} dropped, {} low confidence)",
                extraction.summary.total,
                job.key,
                extraction.summary.unknown,
                extraction.summary.dropped,
                extraction.summary.low_confidence
            );
            result.summaries.push((job.key, extraction.summary));
        }

        result.summaries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    async fn store(&self, job: &Job, extraction: &FileExtraction) -> Result<()> {
        if let Some(db) = &self.db {
            let mut db_guard = db.lock().await;
            db_guard
                .replace_file_results(&job.key, job.modified_at, extraction)
                .context("database write failed")?;
        }
        if let Some(sink) = &self.sink {
            sink.write(&job.path, &job.key, extraction)?;
        }
        Ok(())
    }
}
