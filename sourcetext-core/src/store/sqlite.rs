//! SQLite store.
//!
//! One connection behind a mutex; every call runs on the blocking pool in its
//! own transaction. The schema carries the same uniqueness rules the pipeline
//! relies on, so a concurrent writer shows up as [`StoreError::Conflict`].

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use tracing::{debug, info};

use crate::contract::{
    Document, DocumentStore, NewSourceText, SourceText, SourceTextStore, UpsertDocument,
};
use crate::error::StoreError;

const SCHEMA_VERSION: i32 = 1;

/// Bound parameters per `IN (...)` statement.
const CHUNK: usize = 500;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    source_language TEXT NOT NULL,
    published INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS source_texts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    number INTEGER NOT NULL,
    fingerprint TEXT NOT NULL,
    UNIQUE(document_id, fingerprint),
    UNIQUE(document_id, number)
);

CREATE INDEX IF NOT EXISTS idx_source_texts_document ON source_texts(document_id);
"#;

fn map_error(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => StoreError::Conflict(e.to_string()),
            _ => StoreError::Unavailable(e.to_string()),
        },
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
        _ => StoreError::Unavailable(e.to_string()),
    }
}

fn apply_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    let current: i32 = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i32>>(0)
        })?
        .unwrap_or(0);
    debug!(current, target = SCHEMA_VERSION, "[STORE] Checking migrations");

    if current < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.execute("INSERT INTO schema_migrations (version) VALUES (?1)", [1])?;
        info!(version = 1, "[STORE] Applied schema migration");
    }
    Ok(())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        slug: row.get(1)?,
        owner: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        source_language: row.get(5)?,
        published: row.get(6)?,
    })
}

fn source_text_from_row(row: &Row<'_>) -> rusqlite::Result<SourceText> {
    Ok(SourceText {
        id: row.get(0)?,
        document_id: row.get(1)?,
        text: row.get(2)?,
        number: row.get(3)?,
        fingerprint: row.get(4)?,
    })
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "[STORE] Opening SQLite database");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(map_error)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(map_error)?;
        Self::initialize(conn)
    }

    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_error)?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(map_error)?;
        apply_migrations(&conn).map_err(map_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_connection<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
        .map_err(map_error)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert_document<'a>(&self, doc: UpsertDocument<'a>) -> Result<Document, StoreError> {
        let slug = doc.slug.to_string();
        let owner = doc.owner.to_string();
        let title = doc.title.to_string();
        let content = doc.content.to_string();
        let language = doc.source_language.to_string();
        let published = doc.published;
        self.with_connection(move |conn| {
            conn.query_row(
                "INSERT INTO documents (slug, owner, title, content, source_language, published)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(slug) DO UPDATE SET
                    owner = excluded.owner,
                    title = excluded.title,
                    content = excluded.content,
                    source_language = excluded.source_language,
                    published = excluded.published,
                    updated_at = datetime('now')
                 RETURNING id, slug, owner, title, content, source_language, published",
                params![slug, owner, title, content, language, published],
                document_from_row,
            )
        })
        .await
    }

    async fn find_document<'a>(&self, slug: &'a str) -> Result<Option<Document>, StoreError> {
        let slug = slug.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT id, slug, owner, title, content, source_language, published
                 FROM documents WHERE slug = ?1",
                [slug],
                document_from_row,
            )
            .optional()
        })
        .await
    }
}

#[async_trait]
impl SourceTextStore for SqliteStore {
    async fn find_by_document(&self, document_id: i64) -> Result<Vec<SourceText>, StoreError> {
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, document_id, text, number, fingerprint
                 FROM source_texts WHERE document_id = ?1 ORDER BY number, id",
            )?;
            let units = stmt
                .query_map([document_id], source_text_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(units)
        })
        .await
    }

    async fn delete_by_ids<'a>(
        &self,
        document_id: i64,
        ids: &'a [i64],
    ) -> Result<u64, StoreError> {
        let ids = ids.to_vec();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            for chunk in ids.chunks(CHUNK) {
                let sql = format!(
                    "DELETE FROM source_texts WHERE document_id = ? AND id IN ({})",
                    placeholders(chunk.len())
                );
                let values = std::iter::once(document_id).chain(chunk.iter().copied());
                deleted += tx.execute(&sql, params_from_iter(values))? as u64;
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    async fn shift_numbers<'a>(
        &self,
        document_id: i64,
        ids: &'a [i64],
        offset: i64,
    ) -> Result<u64, StoreError> {
        let ids = ids.to_vec();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let mut shifted = 0;
            for chunk in ids.chunks(CHUNK) {
                let sql = format!(
                    "UPDATE source_texts SET number = number + ? WHERE document_id = ? AND id IN ({})",
                    placeholders(chunk.len())
                );
                let values = [offset, document_id]
                    .into_iter()
                    .chain(chunk.iter().copied());
                shifted += tx.execute(&sql, params_from_iter(values))? as u64;
            }
            tx.commit()?;
            Ok(shifted)
        })
        .await
    }

    async fn update_number(&self, id: i64, number: i64) -> Result<(), StoreError> {
        let changed = self
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE source_texts SET number = ?1 WHERE id = ?2",
                    params![number, id],
                )
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("source text {id}")));
        }
        Ok(())
    }

    async fn insert_skip_duplicates<'a>(
        &self,
        document_id: i64,
        units: &'a [NewSourceText],
    ) -> Result<u64, StoreError> {
        let units = units.to_vec();
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO source_texts (document_id, text, number, fingerprint)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for unit in &units {
                    inserted +=
                        stmt.execute(params![document_id, unit.text, unit.number, unit.fingerprint])?
                            as u64;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn find_by_fingerprints<'a>(
        &self,
        document_id: i64,
        fingerprints: &'a [String],
    ) -> Result<Vec<SourceText>, StoreError> {
        let fingerprints = fingerprints.to_vec();
        self.with_connection(move |conn| {
            let mut found = Vec::with_capacity(fingerprints.len());
            for chunk in fingerprints.chunks(CHUNK) {
                let sql = format!(
                    "SELECT id, document_id, text, number, fingerprint FROM source_texts
                     WHERE document_id = ? AND fingerprint IN ({})",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let values = std::iter::once(rusqlite::types::Value::Integer(document_id)).chain(
                    chunk
                        .iter()
                        .map(|f| rusqlite::types::Value::Text(f.clone())),
                );
                let rows = stmt.query_map(params_from_iter(values), source_text_from_row)?;
                for row in rows {
                    found.push(row?);
                }
            }
            Ok(found)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn document(store: &SqliteStore, slug: &str) -> Document {
        store
            .upsert_document(UpsertDocument {
                slug,
                owner: "owner",
                title: "Title",
                content: "<p>x</p>",
                source_language: "en",
                published: true,
            })
            .await
            .unwrap()
    }

    fn unit(text: &str, number: i64) -> NewSourceText {
        NewSourceText {
            text: text.to_string(),
            number,
            fingerprint: format!("fp-{text}"),
        }
    }

    #[tokio::test]
    async fn upsert_returns_the_same_row_for_a_slug() {
        let store = SqliteStore::memory().unwrap();
        let first = document(&store, "a").await;
        let second = document(&store, "a").await;
        assert_eq!(first.id, second.id);
        assert!(second.published);
        assert_eq!(store.find_document("a").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn duplicate_number_update_is_a_conflict() {
        let store = SqliteStore::memory().unwrap();
        let doc = document(&store, "a").await;
        store
            .insert_skip_duplicates(doc.id, &[unit("A", 0), unit("B", 1)])
            .await
            .unwrap();
        let units = store.find_by_document(doc.id).await.unwrap();
        let err = store.update_number(units[0].id, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "{err:?}");
    }

    #[tokio::test]
    async fn missing_unit_update_is_not_found() {
        let store = SqliteStore::memory().unwrap();
        let err = store.update_number(999, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
