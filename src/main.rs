use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use procsql::config::{Config, DEFAULT_CONFIG_PATH, OutputFormat};
use procsql::db::Db;
use procsql::extractor::Extractor;
use procsql::extractor::batch::{self, BatchRunner, OutputSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "procsql", version, about = "Extract embedded SQL from Pro*C sources")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract statements from files or directories (config patterns when none given)
    Extract {
        paths: Vec<PathBuf>,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
        #[arg(long)]
        db: Option<String>,
        #[arg(long)]
        out: Option<String>,
        #[arg(long)]
        format: Option<OutputFormat>,
        /// Extra dialect rule packs, e.g. `db2`
        #[arg(long)]
        dialect: Vec<String>,
        /// Re-extract files whose modification time is unchanged
        #[arg(long)]
        force: bool,
        /// Only write output files
        #[arg(long)]
        no_db: bool,
    },
    /// Print the stored statements of one file
    Show {
        file: String,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
        #[arg(long)]
        db: Option<String>,
        #[arg(long)]
        format: Option<OutputFormat>,
    },
    /// List statements binding a host variable
    Vars {
        name: String,
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
        #[arg(long)]
        db: Option<String>,
    },
    /// Statement counts per kind
    Stats {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
        #[arg(long)]
        db: Option<String>,
    },
    /// Write a default configuration file
    Init {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },
}

fn open_db(config_path: &str, db: Option<String>) -> Result<Db> {
    let db_path = match db {
        Some(path) => path,
        None => Config::load(config_path)?.db_path,
    };
    Db::open(&db_path).with_context(|| format!("Failed to open database {db_path}"))
}

fn print_records<T: serde::Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    let text = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    };
    println!("{text}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn extract(
    paths: Vec<PathBuf>,
    config_path: &str,
    db: Option<String>,
    out: Option<String>,
    format: Option<OutputFormat>,
    dialects: Vec<String>,
    force: bool,
    no_db: bool,
) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(db) = db {
        config.db_path = db;
    }
    if let Some(out) = out {
        config.output_dir = out;
    }
    if let Some(format) = format {
        config.output_format = format;
    }
    for dialect in dialects {
        if !config.extraction.dialects.contains(&dialect) {
            config.extraction.dialects.push(dialect);
        }
    }
    config.validate()?;

    let files: Vec<PathBuf> = if paths.is_empty() {
        config.get_source_files()?
    } else {
        let mut files = Vec::new();
        for path in &paths {
            if path.is_dir() {
                files.extend(batch::collect_sources(path, &config.extensions));
            } else {
                files.push(path.clone());
            }
        }
        files
    };
    info!("{} source files to process", files.len());

    let extractor = Arc::new(Extractor::new(
        config.rule_registry()?,
        config.extract_options()?,
    ));
    let mut runner = BatchRunner::new(extractor, config.encoding.clone(), config.workers)
        .with_output(OutputSink::new(&config.output_dir, config.output_format));
    if !no_db {
        let db = Db::open(&config.db_path).context("Failed to open database")?;
        runner = runner.with_db(Arc::new(TokioMutex::new(db)));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, discarding unfinished files");
            on_signal.cancel();
        }
    });

    let result = runner.run(&files, force, cancel).await?;

    for (file, summary) in &result.summaries {
        println!(
            "{file}: {} statements, {} unknown, {} dropped, {} low confidence",
            summary.total, summary.unknown, summary.dropped, summary.low_confidence
        );
    }
    println!(
        "extracted {} files ({} added, {} updated), {} skipped, {} failed, {} cancelled, {} statements -> {}",
        result.extracted,
        result.added,
        result.updated,
        result.skipped,
        result.failed,
        result.cancelled,
        result.statements,
        Path::new(&config.output_dir).display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Extract {
            paths,
            config,
            db,
            out,
            format,
            dialect,
            force,
            no_db,
        } => extract(paths, &config, db, out, format, dialect, force, no_db).await?,
        Command::Show {
            file,
            config,
            db,
            format,
        } => {
            let format = format.unwrap_or(Config::load(&config)?.output_format);
            let db = open_db(&config, db)?;
            let key = file.replace('\\', "/");
            let records = db.statements_for_file(&key)?;
            if records.is_empty() {
                warn!("No statements stored for {key}");
            }
            print_records(&records, format)?;
            for diag in db.diagnostics_for_file(&key)? {
                eprintln!("line {}: {} {}", diag.line, diag.kind, diag.message);
            }
        }
        Command::Vars { name, config, db } => {
            let db = open_db(&config, db)?;
            let name = name.trim_start_matches(':');
            for usage in db.find_by_host_var(name)? {
                println!(
                    "{}:{} {} {} {} {} in {}",
                    usage.file,
                    usage.line_start,
                    usage.statement_id,
                    usage.kind,
                    usage.direction,
                    usage.raw_text,
                    usage.function.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Stats { config, db } => {
            let db = open_db(&config, db)?;
            for (kind, count) in db.count_by_kind()? {
                println!("{kind:<24}{count}");
            }
            for (relation, count) in db.count_by_relation_type()? {
                println!("{:<24}{count}", format!("[{relation}]"));
            }
        }
        Command::Init { config } => {
            anyhow::ensure!(!Path::new(&config).exists(), "{config} already exists");
            Config::default().save(&config)?;
            println!("Wrote {config}");
        }
    }

    Ok(())
}
