//! TOML configuration parsing.
//!
//! Every command reads one configuration file (see `--config`). Only `[db]`
//! and `[storage]` are required; all other sections fall back to defaults
//! that match the export layout of the transcription platform.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub parser: ParserConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_exports_dir")]
    pub exports_dir: String,
}

fn default_exports_dir() -> String {
    "transkribus_exports".to_string()
}

impl StorageConfig {
    /// Directory holding the page files of one collection.
    pub fn collection_dir(&self, collection_id: &str) -> PathBuf {
        self.root.join(&self.exports_dir).join(collection_id)
    }

    /// Resolve a page file path stored relative to the exports namespace.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(&self.exports_dir).join(relative)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default = "default_metadata_globs")]
    pub metadata_globs: Vec<String>,
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            metadata_globs: default_metadata_globs(),
            max_entry_bytes: default_max_entry_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/page/*.xml".to_string()]
}
fn default_metadata_globs() -> Vec<String> {
    vec!["**/metadata.xml".to_string(), "**/mets.xml".to_string()]
}
fn default_max_entry_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    #[serde(default = "default_line_type")]
    pub line_type: String,
    #[serde(default = "default_parser_timeout")]
    pub timeout_secs: u64,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            line_type: default_line_type(),
            timeout_secs: default_parser_timeout(),
        }
    }
}

fn default_line_type() -> String {
    "TextRegion".to_string()
}
fn default_parser_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub delete_removed_documents: bool,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            delete_removed_documents: true,
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_lock_ttl() -> i64 {
    6 * 3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolutionConfig {
    #[serde(default = "default_suggestion_limit")]
    pub suggestion_limit: usize,
    #[serde(default = "default_strong_match")]
    pub strong_match_threshold: u8,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            suggestion_limit: default_suggestion_limit(),
            strong_match_threshold: default_strong_match(),
        }
    }
}

fn default_suggestion_limit() -> usize {
    5
}
fn default_strong_match() -> u8 {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// Element types the page parser accepts as text-line containers.
pub const LINE_TYPES: &[&str] = &["TextRegion", "TextLine"];

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.archive.include_globs.is_empty() {
        anyhow::bail!("archive.include_globs must not be empty");
    }
    if config.archive.max_entry_bytes == 0 {
        anyhow::bail!("archive.max_entry_bytes must be > 0");
    }

    if !LINE_TYPES.contains(&config.parser.line_type.as_str()) {
        anyhow::bail!(
            "Unknown parser.line_type: '{}'. Must be one of: {}",
            config.parser.line_type,
            LINE_TYPES.join(", ")
        );
    }
    if config.parser.timeout_secs == 0 {
        anyhow::bail!("parser.timeout_secs must be > 0");
    }

    if config.pipeline.lock_ttl_secs < 1 {
        anyhow::bail!("pipeline.lock_ttl_secs must be >= 1");
    }

    if config.resolution.suggestion_limit == 0 {
        anyhow::bail!("resolution.suggestion_limit must be > 0");
    }
    if config.resolution.strong_match_threshold > 100 {
        anyhow::bail!("resolution.strong_match_threshold must be in [0, 100]");
    }

    Ok(())
}
