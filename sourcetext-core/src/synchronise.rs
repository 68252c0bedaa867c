//! High-level pipeline: orchestrates parse → extract → reconcile → annotate for one document.
//!
//! This module provides the top-level orchestration for "synchronising" a
//! submitted document with its persisted source texts. One run:
//!   - Upserts the raw submission so the document row (and its id) exists
//!   - Parses the body (HTML or Markdown) into a tree and extracts block texts
//!   - Fingerprints the title and blocks and reconciles them with the store
//!   - Re-walks the tree, wraps every block in an id marker, serializes it
//!   - Upserts the annotated render as the document's content
//!
//! # Major Types
//! - [`SynchroniseRequest`]: the submission (title, body, slug, owner, language, flags, format)
//! - [`SynchroniseReport`]: the resulting document row, live units and write counts
//! - [`PipelineState`]: the states a run moves through, for tracing and failure reports
//!
//! # Responsibilities
//! - Fail-fast orchestration: the first failing step ends the run with a [`SynchroniseError`]
//! - Cancellation is honoured up to and including `Extracted`; once reconciliation
//!   starts the run goes to completion or explicit failure
//! - No retry: resubmitting the identical input is the recovery path, and it converges
//!
//! # Callable From
//! - The CLI crate (single and bulk import) and integration tests
//! - Any caller holding a [`DocumentStore`] and a [`SourceTextStore`]
//!
//! # Concurrency
//! The returned future is `Send`: the parsed tree never lives across an await.
//! Two runs for the same slug must not overlap; see [`crate::locks`].

use std::fmt;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::annotate::{annotate, strip_markers, AnnotationOutcome, Marker};
use crate::config::PipelineConfig;
use crate::contract::{Document, DocumentStore, SourceTextStore, UpsertDocument};
use crate::error::{PipelineError, ReconcilePhase, SynchroniseError};
use crate::extract::{extract_blocks, BlockTags};
use crate::fingerprint::{plan_units, Candidate};
use crate::markup::{self, ContentFormat};
use crate::reconcile::{reconcile, Resolution};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Received,
    UpsertedRaw,
    Parsed,
    Extracted,
    Reconciled,
    Annotated,
    UpsertedFinal,
    Done,
    Failed(String),
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Received => f.write_str("received"),
            PipelineState::UpsertedRaw => f.write_str("upserted(raw)"),
            PipelineState::Parsed => f.write_str("parsed"),
            PipelineState::Extracted => f.write_str("extracted"),
            PipelineState::Reconciled => f.write_str("reconciled"),
            PipelineState::Annotated => f.write_str("annotated"),
            PipelineState::UpsertedFinal => f.write_str("upserted(final)"),
            PipelineState::Done => f.write_str("done"),
            PipelineState::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

/// One submission of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynchroniseRequest {
    pub slug: String,
    pub owner: String,
    pub title: String,
    pub body: String,
    pub source_language: String,
    pub published: bool,
    pub format: ContentFormat,
}

impl SynchroniseRequest {
    pub fn new(
        format: ContentFormat,
        slug: impl Into<String>,
        owner: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            slug: slug.into(),
            owner: owner.into(),
            title: title.into(),
            body: body.into(),
            source_language: "en".to_string(),
            published: false,
            format,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.source_language = language.into();
        self
    }

    pub fn published(mut self, published: bool) -> Self {
        self.published = published;
        self
    }
}

/// A live unit after the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    /// `None` when the fingerprint did not resolve (left unmarked).
    pub id: Option<i64>,
    pub number: i64,
    pub text: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynchroniseReport {
    pub document: Document,
    pub units: Vec<UnitReport>,
    pub deleted: u64,
    pub renumbered: u64,
    pub inserted: u64,
    pub unresolved: Vec<String>,
    /// Every state the run passed through, `Received` to `Done`.
    pub states: Vec<PipelineState>,
}

struct Run<'a> {
    slug: &'a str,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl<'a> Run<'a> {
    fn new(slug: &'a str) -> Self {
        Self {
            slug,
            state: PipelineState::Received,
            history: vec![PipelineState::Received],
        }
    }

    fn advance(&mut self, next: PipelineState) {
        debug!(slug = self.slug, from = %self.state, to = %next, "[SYNC] State transition");
        self.history.push(next.clone());
        self.state = next;
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                state: self.state.clone(),
            });
        }
        Ok(())
    }

    fn fail(&mut self, error: PipelineError) -> SynchroniseError {
        let reached = self.state.clone();
        error!(
            slug = self.slug,
            state = %reached,
            retryable = error.is_retryable(),
            error = %error,
            "[SYNC][ERROR] Pipeline failed"
        );
        self.advance(PipelineState::Failed(error.to_string()));
        SynchroniseError {
            state: reached,
            error,
        }
    }
}

/// Parse, strip stale markers, extract and fingerprint. Everything that
/// borrows the tree stays inside this call.
fn decompose(
    request: &SynchroniseRequest,
    config: &PipelineConfig,
) -> Result<Vec<Candidate>, PipelineError> {
    let mut fragment = markup::parse(request.format, &request.body, config.max_input_bytes)?;
    strip_markers(&mut fragment, &Marker::from_config(config));
    let blocks = extract_blocks(fragment.root(), &BlockTags::from_config(config), config.nesting);
    Ok(plan_units(&request.title, &blocks))
}

/// Second traversal: rebuild the tree from the same input, check it decomposes
/// to the same units, wrap every resolved block and serialize.
fn render(
    request: &SynchroniseRequest,
    config: &PipelineConfig,
    candidates: &[Candidate],
    resolution: &Resolution,
) -> Result<(String, AnnotationOutcome), PipelineError> {
    let marker = Marker::from_config(config);
    let mut fragment = markup::parse(request.format, &request.body, config.max_input_bytes)?;
    strip_markers(&mut fragment, &marker);
    let blocks = extract_blocks(fragment.root(), &BlockTags::from_config(config), config.nesting);

    let replayed = plan_units(&request.title, &blocks);
    if replayed != candidates {
        return Err(PipelineError::Parse(
            "second traversal produced a different decomposition".to_string(),
        ));
    }

    let outcome = annotate(&mut fragment, &blocks, candidates, &resolution.ids, &marker);
    Ok((fragment.serialize()?, outcome))
}

/// Run the whole pipeline for one submission.
pub async fn synchronise<D, S>(
    request: &SynchroniseRequest,
    documents: &D,
    units: &S,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<SynchroniseReport, SynchroniseError>
where
    D: DocumentStore + ?Sized,
    S: SourceTextStore + ?Sized,
{
    let mut run = Run::new(&request.slug);
    info!(slug = %request.slug, format = %request.format, bytes = request.body.len(), "[SYNC] Starting document synchronisation");

    config
        .validate()
        .map_err(|e| run.fail(PipelineError::from(e)))?;
    run.checkpoint(cancel).map_err(|e| run.fail(e))?;

    // --- Raw upsert: the document id must exist before reconciliation ---
    let raw = UpsertDocument {
        slug: &request.slug,
        owner: &request.owner,
        title: &request.title,
        content: &request.body,
        source_language: &request.source_language,
        published: request.published,
    };
    let document = documents
        .upsert_document(raw)
        .await
        .map_err(|e| run.fail(PipelineError::from_store(ReconcilePhase::Document, e)))?;
    info!(slug = %request.slug, document_id = document.id, "[SYNC] Raw content upserted");
    run.advance(PipelineState::UpsertedRaw);
    run.checkpoint(cancel).map_err(|e| run.fail(e))?;

    let candidates = decompose(request, config).map_err(|e| run.fail(e))?;
    run.advance(PipelineState::Parsed);
    run.advance(PipelineState::Extracted);
    info!(slug = %request.slug, units = candidates.len(), "[SYNC] Extracted source texts");
    // Last cancellation point: past here the unit set may be mid-offset.
    run.checkpoint(cancel).map_err(|e| run.fail(e))?;

    let resolution = reconcile(
        units,
        document.id,
        &candidates,
        config.renumber_offset,
        config.update_batch_size,
    )
    .await
    .map_err(|e| run.fail(e))?;
    info!(
        slug = %request.slug,
        deleted = resolution.deleted,
        renumbered = resolution.renumbered,
        inserted = resolution.inserted,
        "[SYNC] Reconciled"
    );
    run.advance(PipelineState::Reconciled);

    let (rendered, outcome) =
        render(request, config, &candidates, &resolution).map_err(|e| run.fail(e))?;
    run.advance(PipelineState::Annotated);

    let annotated = UpsertDocument {
        content: &rendered,
        ..raw
    };
    let document = documents
        .upsert_document(annotated)
        .await
        .map_err(|e| run.fail(PipelineError::from_store(ReconcilePhase::Document, e)))?;
    run.advance(PipelineState::UpsertedFinal);

    let units = candidates
        .into_iter()
        .map(|c| UnitReport {
            id: resolution.ids.get(&c.fingerprint).copied(),
            number: c.number,
            text: c.text,
            fingerprint: c.fingerprint,
        })
        .collect();
    run.advance(PipelineState::Done);

    let report = SynchroniseReport {
        document,
        units,
        deleted: resolution.deleted,
        renumbered: resolution.renumbered,
        inserted: resolution.inserted,
        unresolved: outcome.unresolved,
        states: run.history,
    };
    info!(
        slug = %request.slug,
        annotated = outcome.annotated,
        unresolved = report.unresolved.len(),
        "[SYNC] Synchronisation complete"
    );
    match serde_json::to_string_pretty(&report.units) {
        Ok(json) => debug!(json = %json, slug = %request.slug, "[SYNC][DEBUG] Live units as JSON"),
        Err(e) => error!(slug = %request.slug, error = ?e, "[SYNC][DEBUG] Failed to serialize units as JSON"),
    }
    Ok(report)
}

/// [`synchronise`] with the request forced to HTML input.
pub async fn process_html<D, S>(
    mut request: SynchroniseRequest,
    documents: &D,
    units: &S,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<SynchroniseReport, SynchroniseError>
where
    D: DocumentStore + ?Sized,
    S: SourceTextStore + ?Sized,
{
    request.format = ContentFormat::Html;
    synchronise(&request, documents, units, config, cancel).await
}

/// [`synchronise`] with the request forced to Markdown input.
pub async fn process_markdown<D, S>(
    mut request: SynchroniseRequest,
    documents: &D,
    units: &S,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> Result<SynchroniseReport, SynchroniseError>
where
    D: DocumentStore + ?Sized,
    S: SourceTextStore + ?Sized,
{
    request.format = ContentFormat::Markdown;
    synchronise(&request, documents, units, config, cancel).await
}
