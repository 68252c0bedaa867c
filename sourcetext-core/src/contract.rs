//! # contract: persistence boundary for documents and their source texts
//!
//! This module defines the two traits the pipeline talks to storage through
//! ([`DocumentStore`] and [`SourceTextStore`]) and the plain data types that
//! cross that boundary.
//!
//! ## Interface & Extensibility
//! - Implement both traits to plug in a new backend (see [`crate::store`] for
//!   the in-memory and SQLite adapters).
//! - All methods are async and return [`StoreError`]; adapters must map
//!   uniqueness violations to [`StoreError::Conflict`] and everything that
//!   prevents a commit to [`StoreError::Unavailable`].
//! - Every method is one transaction. The reconciler relies on that and on
//!   nothing stronger.
//!
//! ## Mocking & Testing
//! - The traits are annotated for `mockall` so consumers can generate
//!   deterministic mocks (exported under the `test-export-mocks` feature).
//!
//! ## Store invariants
//! - `(document_id, fingerprint)` is unique among live source texts.
//! - `(document_id, number)` is unique among live source texts.
//! - Documents are unique by `slug`.

use async_trait::async_trait;
use serde::Serialize;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::StoreError;

/// A persisted document row. `content` always holds the last annotated render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub id: i64,
    pub slug: String,
    pub owner: String,
    pub title: String,
    pub content: String,
    pub source_language: String,
    pub published: bool,
}

/// Fields written by an upsert keyed on `slug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertDocument<'a> {
    pub slug: &'a str,
    pub owner: &'a str,
    pub title: &'a str,
    pub content: &'a str,
    pub source_language: &'a str,
    pub published: bool,
}

/// One live source text unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceText {
    pub id: i64,
    pub document_id: i64,
    pub text: String,
    pub number: i64,
    pub fingerprint: String,
}

/// A unit to insert. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSourceText {
    pub text: String,
    pub number: i64,
    pub fingerprint: String,
}

#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert the document, or overwrite every field of the one with the same slug.
    async fn upsert_document<'a>(&self, doc: UpsertDocument<'a>) -> Result<Document, StoreError>;

    async fn find_document<'a>(&self, slug: &'a str) -> Result<Option<Document>, StoreError>;
}

/// Source text persistence. Each method runs in its own transaction.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait SourceTextStore: Send + Sync {
    /// All live units of a document, ordered by `number`.
    async fn find_by_document(&self, document_id: i64) -> Result<Vec<SourceText>, StoreError>;

    /// Delete the given units. Returns how many rows went away.
    async fn delete_by_ids<'a>(
        &self,
        document_id: i64,
        ids: &'a [i64],
    ) -> Result<u64, StoreError>;

    /// Add `offset` to the `number` of every given unit, all in one transaction.
    async fn shift_numbers<'a>(
        &self,
        document_id: i64,
        ids: &'a [i64],
        offset: i64,
    ) -> Result<u64, StoreError>;

    /// Set one unit's `number`. Idempotent.
    async fn update_number(&self, id: i64, number: i64) -> Result<(), StoreError>;

    /// Bulk insert; rows that would violate a uniqueness constraint are skipped.
    /// Returns how many rows were inserted.
    async fn insert_skip_duplicates<'a>(
        &self,
        document_id: i64,
        units: &'a [NewSourceText],
    ) -> Result<u64, StoreError>;

    async fn find_by_fingerprints<'a>(
        &self,
        document_id: i64,
        fingerprints: &'a [String],
    ) -> Result<Vec<SourceText>, StoreError>;
}
