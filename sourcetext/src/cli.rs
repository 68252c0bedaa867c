//! # sourcetext CLI Interface
//!
//! Command parsing and the async [`run`] entrypoint. All pipeline logic lives
//! in `sourcetext-core`; this module only loads config, opens the store and
//! prints results.
//!
//! ## Commands
//! - `import`: synchronise one document file and print the report as JSON
//! - `bulk-import`: synchronise every document listed in a YAML manifest
//! - `units`: print the live source texts of a document
//!
//! Progress and diagnostics go to stderr through `tracing`; stdout carries
//! JSON only.

use crate::load_config::{format_for_path, load_config, load_manifest, StoreSection};
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sourcetext_core::contract::{DocumentStore, SourceTextStore};
use sourcetext_core::locks::synchronise_all;
use sourcetext_core::markup::ContentFormat;
use sourcetext_core::store::{MemoryStore, SqliteStore};
use sourcetext_core::synchronise::{synchronise, SynchroniseRequest};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// CLI for sourcetext: split documents into stable, translatable source texts.
#[derive(Parser)]
#[clap(
    name = "sourcetext",
    version,
    about = "Extract, fingerprint and annotate the source texts of HTML and Markdown documents"
)]
pub struct Cli {
    /// Path to the YAML config file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronise one document
    Import {
        /// Document file to read the body from
        file: PathBuf,
        #[clap(long)]
        slug: String,
        #[clap(long)]
        owner: String,
        #[clap(long, default_value = "")]
        title: String,
        /// html or markdown; guessed from the file extension when omitted
        #[clap(long)]
        format: Option<ContentFormat>,
        #[clap(long, default_value = "en")]
        language: String,
        #[clap(long)]
        published: bool,
    },
    /// Synchronise every document listed in a YAML manifest
    BulkImport {
        manifest: PathBuf,
        /// Documents processed at the same time
        #[clap(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Print the live source texts of a document
    Units { slug: String },
}

enum Backend {
    Sqlite(SqliteStore),
    Memory(MemoryStore),
}

impl Backend {
    fn open(section: &StoreSection) -> Result<Self> {
        match section {
            StoreSection::Sqlite { path } => Ok(Backend::Sqlite(
                SqliteStore::open(path).map_err(|e| anyhow!("Failed to open database: {e}"))?,
            )),
            StoreSection::Memory => Ok(Backend::Memory(MemoryStore::new())),
        }
    }

    fn documents(&self) -> &dyn DocumentStore {
        match self {
            Backend::Sqlite(store) => store,
            Backend::Memory(store) => store,
        }
    }

    fn units(&self) -> &dyn SourceTextStore {
        match self {
            Backend::Sqlite(store) => store,
            Backend::Memory(store) => store,
        }
    }
}

#[derive(Serialize)]
struct BulkOutcome<'a> {
    slug: &'a str,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancel `token` on Ctrl-C. Runs past reconciliation start are not interrupted.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling runs that have not started reconciling");
            token.cancel();
        }
    });
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let config = load_config(cli.config.as_ref())?;
    let backend = Backend::open(&config.store)?;
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Import {
            file,
            slug,
            owner,
            title,
            format,
            language,
            published,
        } => {
            let body = std::fs::read_to_string(&file)
                .map_err(|e| anyhow!("Failed to read document {:?}: {e}", file))?;
            let format = format.unwrap_or_else(|| format_for_path(&file));
            let request = SynchroniseRequest::new(format, slug, owner, title, body)
                .with_language(language)
                .published(published);

            tracing::info!(command = "import", slug = %request.slug, "Starting import");
            cancel_on_ctrl_c(&cancel);
            match synchronise(
                &request,
                backend.documents(),
                backend.units(),
                &config.pipeline,
                &cancel,
            )
            .await
            {
                Ok(report) => {
                    tracing::info!(command = "import", units = report.units.len(), "Import complete");
                    print_json(&report)
                }
                Err(e) => {
                    tracing::error!(
                        command = "import",
                        error = %e,
                        retryable = e.is_retryable(),
                        "Import failed"
                    );
                    Err(anyhow::Error::new(e))
                }
            }
        }
        Commands::BulkImport {
            manifest,
            concurrency,
        } => {
            let requests = load_manifest(&manifest)?;
            tracing::info!(command = "bulk-import", documents = requests.len(), "Starting bulk import");
            cancel_on_ctrl_c(&cancel);
            let results = synchronise_all(
                &requests,
                backend.documents(),
                backend.units(),
                &config.pipeline,
                &cancel,
                concurrency,
            )
            .await;

            let outcomes: Vec<BulkOutcome<'_>> = requests
                .iter()
                .zip(&results)
                .map(|(request, result)| match result {
                    Ok(report) => BulkOutcome {
                        slug: &request.slug,
                        ok: true,
                        document_id: Some(report.document.id),
                        error: None,
                    },
                    Err(e) => BulkOutcome {
                        slug: &request.slug,
                        ok: false,
                        document_id: None,
                        error: Some(e.to_string()),
                    },
                })
                .collect();
            print_json(&outcomes)?;

            let failed = outcomes.iter().filter(|o| !o.ok).count();
            if failed > 0 {
                return Err(anyhow!("{failed} of {} documents failed", outcomes.len()));
            }
            Ok(())
        }
        Commands::Units { slug } => {
            let document = backend
                .documents()
                .find_document(&slug)
                .await?
                .ok_or_else(|| anyhow!("No document with slug '{slug}'"))?;
            let units = backend.units().find_by_document(document.id).await?;
            tracing::info!(command = "units", slug = %slug, units = units.len(), "Listed units");
            print_json(&units)
        }
    }
}
