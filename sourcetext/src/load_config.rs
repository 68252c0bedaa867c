//! `load_config` module: reads the YAML config file and bulk-import manifests.
//!
//! This is the only place where user-supplied YAML is parsed. The `pipeline`
//! section maps straight onto [`PipelineConfig`]; the `store` section picks
//! the backend. `SOURCETEXT_DATABASE` in the environment (or `.env`)
//! overrides the configured database path.
//!
//! ```yaml
//! pipeline:
//!   nesting: exclusive
//!   update_batch_size: 500
//! store:
//!   kind: sqlite
//!   path: ./data/sourcetext.db
//! ```
//!
//! # Errors
//! All errors use `anyhow::Error` and are surfaced at the CLI boundary.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use sourcetext_core::config::PipelineConfig;
use sourcetext_core::markup::ContentFormat;
use sourcetext_core::synchronise::SynchroniseRequest;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const DATABASE_ENV: &str = "SOURCETEXT_DATABASE";
pub const DEFAULT_DATABASE: &str = "sourcetext.db";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreSection {
    Sqlite { path: PathBuf },
    /// Nothing persists past the process; useful for dry runs.
    Memory,
}

impl Default for StoreSection {
    fn default() -> Self {
        StoreSection::Sqlite {
            path: PathBuf::from(DEFAULT_DATABASE),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub store: StoreSection,
}

impl CliConfig {
    /// Apply `SOURCETEXT_DATABASE`, if set. Forces the SQLite backend.
    fn apply_env(mut self) -> Self {
        if let Ok(path) = std::env::var(DATABASE_ENV) {
            if !path.trim().is_empty() {
                info!(env = DATABASE_ENV, path = %path, "Database path overridden from environment");
                self.store = StoreSection::Sqlite {
                    path: PathBuf::from(path),
                };
            }
        }
        self
    }
}

fn read_file(path: &Path, what: &str) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => {
            info!(path = ?path, "{what} file read successfully");
            Ok(content)
        }
        Err(e) => {
            error!(error = ?e, path = ?path, "Failed to read {what} file");
            Err(anyhow!("Failed to read {what} file {:?}: {}", path, e))
        }
    }
}

/// Load the config at `path`, or the defaults when no path is given, then
/// apply the environment and validate the pipeline section.
pub fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<CliConfig> {
    let config = match path {
        Some(path) => {
            let path_ref = path.as_ref();
            info!(config_path = ?path_ref, "Loading configuration from file");
            let content = read_file(path_ref, "config")?;
            match serde_yaml::from_str::<CliConfig>(&content) {
                Ok(conf) => {
                    info!(config_path = ?path_ref, "Parsed config YAML successfully");
                    conf
                }
                Err(e) => {
                    error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
                    return Err(anyhow!("Failed to parse config YAML: {e}"));
                }
            }
        }
        None => {
            info!("No config file given, using defaults");
            CliConfig::default()
        }
    }
    .apply_env();

    config
        .pipeline
        .validate()
        .map_err(|e| anyhow!("Invalid pipeline config: {e}"))?;
    config.pipeline.trace_loaded();
    Ok(config)
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    slug: String,
    owner: String,
    #[serde(default)]
    title: String,
    /// Relative paths resolve against the manifest's directory.
    path: PathBuf,
    format: Option<ContentFormat>,
    #[serde(default = "default_language")]
    source_language: String,
    #[serde(default)]
    published: bool,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    documents: Vec<ManifestEntry>,
}

fn default_language() -> String {
    "en".to_string()
}

/// Guess the format from a file extension; HTML unless it looks like Markdown.
pub fn format_for_path(path: &Path) -> ContentFormat {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| ext.parse().ok())
        .unwrap_or_else(|| {
            warn!(path = ?path, "No recognised extension, treating file as HTML");
            ContentFormat::Html
        })
}

/// Read a bulk-import manifest and every document body it lists.
///
/// ```yaml
/// documents:
///   - slug: intro
///     owner: alice
///     title: Introduction
///     path: intro.md
///     published: true
/// ```
pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Vec<SynchroniseRequest>> {
    let path = path.as_ref();
    info!(manifest_path = ?path, "Loading import manifest");
    let content = read_file(path, "manifest")?;
    let manifest: Manifest = serde_yaml::from_str(&content).map_err(|e| {
        error!(error = ?e, manifest_path = ?path, "Failed to parse manifest YAML");
        anyhow!("Failed to parse manifest YAML: {e}")
    })?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    manifest
        .documents
        .into_iter()
        .map(|entry| {
            let file = if entry.path.is_absolute() {
                entry.path.clone()
            } else {
                base.join(&entry.path)
            };
            let body = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read document {:?} for {}", file, entry.slug))?;
            let format = entry.format.unwrap_or_else(|| format_for_path(&file));
            Ok(
                SynchroniseRequest::new(format, entry.slug, entry.owner, entry.title, body)
                    .with_language(entry.source_language)
                    .published(entry.published),
            )
        })
        .collect()
}
