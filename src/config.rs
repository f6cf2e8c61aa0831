/// Configuration module for procsql.
///
/// Handles loading, validating, and providing default configuration values.
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::extractor::batch;
use crate::extractor::render::{DEFAULT_MARKER_TEMPLATE, DEFAULT_PLACEHOLDER_TEMPLATE};
use crate::extractor::{ExtractOptions, RuleRegistry, StatementKind};

pub const DEFAULT_CONFIG_PATH: &str = "procsql.json";

const KNOWN_DIALECTS: &[&str] = &["db2"];

// ── Default value functions ──────────────────────────────────────────

fn default_source_patterns() -> Vec<String> {
    vec!["./".to_string()]
}

fn default_extensions() -> Vec<String> {
    vec!["pc".to_string(), "c".to_string(), "h".to_string()]
}

fn default_db_path() -> String {
    "./procsql.db".to_string()
}

fn default_output_dir() -> String {
    "./sql_out".to_string()
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_low_confidence_threshold() -> f32 {
    0.7
}

fn default_true() -> bool {
    true
}

fn default_marker_template() -> String {
    DEFAULT_MARKER_TEMPLATE.to_string()
}

fn default_placeholder_template() -> String {
    DEFAULT_PLACEHOLDER_TEMPLATE.to_string()
}

fn default_skip_kinds() -> Vec<String> {
    vec![
        "include".to_string(),
        "declare_section_begin".to_string(),
        "declare_section_end".to_string(),
    ]
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "yaml" | "yml" => Ok(OutputFormat::Yaml),
            other => Err(format!("unsupported output format: {other}")),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_source_patterns")]
    pub source_patterns: Vec<String>,

    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default)]
    pub output_format: OutputFormat,

    /// WHATWG label of the source encoding.
    #[serde(default = "default_encoding")]
    pub encoding: String,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f32,

    #[serde(default)]
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub dialects: Vec<String>,

    #[serde(default = "default_true")]
    pub use_syntax_tree: bool,

    #[serde(default = "default_marker_template")]
    pub marker_template: String,

    #[serde(default = "default_placeholder_template")]
    pub placeholder_template: String,

    #[serde(default = "default_skip_kinds")]
    pub skip_kinds: Vec<String>,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            source_patterns: default_source_patterns(),
            extensions: default_extensions(),
            db_path: default_db_path(),
            output_dir: default_output_dir(),
            output_format: OutputFormat::default(),
            encoding: default_encoding(),
            workers: default_workers(),
            low_confidence_threshold: default_low_confidence_threshold(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            dialects: Vec::new(),
            use_syntax_tree: default_true(),
            marker_template: default_marker_template(),
            placeholder_template: default_placeholder_template(),
            skip_kinds: default_skip_kinds(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"procsql.json"`.
    /// If the file does not exist, returns a default config and, for the
    /// default path only, writes a template next to it.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == DEFAULT_CONFIG_PATH {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let mut cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");

        if cfg.source_patterns.is_empty() {
            cfg.source_patterns = default_source_patterns();
        }
        for ext in &mut cfg.extensions {
            *ext = ext.trim_start_matches('.').to_ascii_lowercase();
        }

        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.workers > 0, "workers must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.low_confidence_threshold),
            "low_confidence_threshold must be within [0, 1]"
        );
        anyhow::ensure!(
            !self.source_patterns.is_empty(),
            "at least one source pattern must be specified"
        );
        anyhow::ensure!(
            !self.extensions.is_empty(),
            "at least one source extension must be specified"
        );
        anyhow::ensure!(
            self.extraction.marker_template.contains("{id}"),
            "extraction.marker_template must contain {{id}}"
        );
        anyhow::ensure!(
            self.extraction.placeholder_template.contains("{name}"),
            "extraction.placeholder_template must contain {{name}}"
        );
        anyhow::ensure!(
            encoding_rs::Encoding::for_label(self.encoding.trim().as_bytes()).is_some(),
            "unknown encoding: {}",
            self.encoding
        );
        for dialect in &self.extraction.dialects {
            anyhow::ensure!(
                KNOWN_DIALECTS.contains(&dialect.to_ascii_lowercase().as_str()),
                "unknown dialect: {dialect}"
            );
        }
        self.skip_kinds()?;
        Ok(())
    }

    fn skip_kinds(&self) -> Result<HashSet<StatementKind>> {
        self.extraction
            .skip_kinds
            .iter()
            .map(|k| StatementKind::from_str(k).map_err(anyhow::Error::msg))
            .collect()
    }

    /// Pipeline options derived from the `extraction` section.
    pub fn extract_options(&self) -> Result<ExtractOptions> {
        Ok(ExtractOptions {
            use_syntax_tree: self.extraction.use_syntax_tree,
            marker_template: self.extraction.marker_template.clone(),
            placeholder_template: self.extraction.placeholder_template.clone(),
            skip_kinds: self.skip_kinds().context("invalid extraction.skip_kinds")?,
            low_confidence_threshold: self.low_confidence_threshold,
        })
    }

    /// Built-in rules plus the configured dialect packs.
    pub fn rule_registry(&self) -> Result<Arc<RuleRegistry>> {
        let mut registry = RuleRegistry::with_defaults();
        for dialect in &self.extraction.dialects {
            match dialect.to_ascii_lowercase().as_str() {
                "db2" => registry.load_db2_rules(),
                other => anyhow::bail!("unknown dialect: {other}"),
            }
            info!("Loaded {dialect} dialect rules");
        }
        Ok(Arc::new(registry))
    }

    /// Expand all source patterns and return matching source files, sorted.
    pub fn get_source_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = BTreeSet::new();

        for pattern in &self.source_patterns {
            match expand_pattern(pattern, &self.extensions) {
                Ok(matches) => files.extend(matches),
                Err(e) => {
                    warn!("Failed to expand pattern {pattern}: {e}");
                }
            }
        }

        Ok(files.into_iter().collect())
    }

    /// Return the base directories derived from all patterns.
    #[must_use]
    pub fn get_base_directories(&self) -> Vec<PathBuf> {
        let mut dirs = BTreeSet::new();

        for pattern in &self.source_patterns {
            let base = extract_base_dir(pattern);
            if let Ok(abs) = std::path::absolute(Path::new(&base)) {
                dirs.insert(abs);
            }
        }

        dirs.into_iter().collect()
    }
}

// ── Pattern helpers ──────────────────────────────────────────────────

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Expand a single pattern to matching source files. A plain path is either a
/// file (taken as is) or a directory (walked).
fn expand_pattern(pattern: &str, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !pattern.contains(['*', '?', '[']) {
        let path = Path::new(pattern);
        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }
        return Ok(batch::collect_sources(path, extensions));
    }

    // `**` crosses directories, so the walk starts at the base directory
    if pattern.contains("**") {
        let matcher = glob::Pattern::new(pattern).context("invalid glob pattern")?;
        let base = extract_base_dir(pattern);
        let options = glob::MatchOptions {
            require_literal_separator: true,
            ..glob::MatchOptions::new()
        };
        return Ok(batch::collect_sources(Path::new(&base), extensions)
            .into_iter()
            .filter(|p| {
                let normalized = p.to_string_lossy().replace('\\', "/");
                matcher.matches_with(&normalized, options)
            })
            .collect());
    }

    let matches = glob::glob(pattern).context("invalid glob pattern")?;
    Ok(matches
        .flatten()
        .filter(|entry| entry.is_file() && has_extension(entry, extensions))
        .collect())
}

/// Extract the base directory from a pattern (part before first wildcard).
fn extract_base_dir(pattern: &str) -> String {
    if let Some(idx) = pattern.find(['*', '?', '[']) {
        let prefix = &pattern[..idx];
        let trimmed = prefix.trim_end_matches(['/', '\\']);
        if trimmed.is_empty() {
            return ".".to_string();
        }
        // A prefix ending in a separator is the directory itself
        if prefix.len() > trimmed.len() {
            return trimmed.to_string();
        }
        Path::new(trimmed)
            .parent()
            .map(|p| {
                let s = p.to_string_lossy().to_string();
                if s.is_empty() { ".".to_string() } else { s }
            })
            .unwrap_or_else(|| ".".to_string())
    } else {
        pattern.to_string()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.encoding, "utf-8");
        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.extensions, vec!["pc", "c", "h"]);
        assert_eq!(config.extraction.marker_template, "/* sql extracted: {id} */");
        assert_eq!(config.extraction.placeholder_template, "#{name}");
        assert!(config.extraction.use_syntax_tree);
        assert!(config.extraction.dialects.is_empty());
    }

    #[test]
    fn test_load_from_json() {
        let json = r#"{"workers": 8, "output_format": "yaml", "extraction": {"dialects": ["db2"]}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.output_format, OutputFormat::Yaml);
        assert_eq!(config.extraction.dialects, vec!["db2"]);
        // Other fields should have defaults
        assert_eq!(config.db_path, "./procsql.db");
        assert_eq!(config.extraction.skip_kinds.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_and_invalid() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("none.json");
        let config = Config::load(missing.to_str().unwrap()).unwrap();
        assert_eq!(config.workers, 4);
        assert!(!missing.exists(), "templates are only written for the default path");

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        let config = Config::load(broken.to_str().unwrap()).unwrap();
        assert_eq!(config.db_path, "./procsql.db");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.low_confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.source_patterns = vec![];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.extraction.marker_template = "/* sql */".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.extraction.placeholder_template = "?".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.extraction.skip_kinds = vec!["merge".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.extraction.dialects = vec!["informix".into()];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.encoding = "klingon".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extract_options_and_registry() {
        let mut config = Config::default();
        config.extraction.skip_kinds = vec!["Include".into(), "whenever".into()];
        config.extraction.dialects = vec!["DB2".into()];
        let options = config.extract_options().unwrap();
        assert!(options.skip_kinds.contains(&StatementKind::Include));
        assert!(options.skip_kinds.contains(&StatementKind::Whenever));
        assert_eq!(options.skip_kinds.len(), 2);

        let base = RuleRegistry::with_defaults().len();
        let registry = config.rule_registry().unwrap();
        assert!(registry.len() > base);
    }

    #[test]
    fn test_source_files_from_patterns() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("batch/sub")).unwrap();
        fs::write(root.join("batch/a.pc"), "").unwrap();
        fs::write(root.join("batch/sub/b.PC"), "").unwrap();
        fs::write(root.join("batch/sub/c.h"), "").unwrap();
        fs::write(root.join("batch/readme.md"), "").unwrap();

        let base = root.to_string_lossy().replace('\\', "/");
        let mut config = Config::default();
        config.source_patterns = vec![format!("{base}/batch")];
        assert_eq!(config.get_source_files().unwrap().len(), 3);

        config.source_patterns = vec![format!("{base}/batch/**/*.pc")];
        config.extensions = vec!["pc".into()];
        let files = config.get_source_files().unwrap();
        assert_eq!(files.len(), 1, "{files:?}");
        assert!(files[0].ends_with("a.pc"), "glob suffixes match case-sensitively");

        config.source_patterns = vec![format!("{base}/batch/*.pc")];
        let files = config.get_source_files().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.pc"));
    }

    #[test]
    fn test_extract_base_dir() {
        assert_eq!(extract_base_dir("./src"), "./src");
        assert_eq!(extract_base_dir("./src/**/*.pc"), "./src");
        assert_eq!(extract_base_dir("*.pc"), ".");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.db_path, config.db_path);
        assert_eq!(parsed.extraction.skip_kinds, config.extraction.skip_kinds);
        assert_eq!(parsed.output_format, config.output_format);
    }
}
