//! In-memory store.
//!
//! Every trait method takes the lock once and either applies all of its
//! changes or none, which is the same transaction shape the SQL adapter has.
//! Uniqueness of `(document, number)` and `(document, fingerprint)` is
//! checked against the state after the whole method, so a batch shift that
//! only collides with itself half-way is accepted.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::contract::{
    Document, DocumentStore, NewSourceText, SourceText, SourceTextStore, UpsertDocument,
};
use crate::error::StoreError;

/// Store methods, for failure injection and write accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    UpsertDocument,
    FindDocument,
    FindByDocument,
    DeleteByIds,
    ShiftNumbers,
    UpdateNumber,
    InsertSkipDuplicates,
    FindByFingerprints,
}

impl Operation {
    fn is_write(self) -> bool {
        matches!(
            self,
            Operation::UpsertDocument
                | Operation::DeleteByIds
                | Operation::ShiftNumbers
                | Operation::UpdateNumber
                | Operation::InsertSkipDuplicates
        )
    }
}

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<i64, Document>,
    units: BTreeMap<i64, SourceText>,
    next_document_id: i64,
    next_unit_id: i64,
    failures: HashMap<Operation, StoreError>,
    calls: HashMap<Operation, usize>,
}

impl State {
    /// Count the call and pop an injected failure for it, if any.
    fn enter(&mut self, op: Operation) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.remove(&op) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn units_of(&self, document_id: i64) -> impl Iterator<Item = &SourceText> {
        self.units.values().filter(move |u| u.document_id == document_id)
    }

    fn check_numbers_unique(
        &self,
        document_id: i64,
        numbers: &HashMap<i64, i64>,
    ) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for unit in self.units_of(document_id) {
            let number = numbers.get(&unit.id).copied().unwrap_or(unit.number);
            if !seen.insert(number) {
                return Err(StoreError::Conflict(format!(
                    "number {number} already used in document {document_id}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `error`. One shot.
    pub fn fail_next(&self, op: Operation, error: StoreError) {
        self.state.lock().failures.insert(op, error);
    }

    /// How many times `op` has been called, failed calls included.
    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Calls of every unit-writing method, document upserts excluded.
    pub fn unit_writes(&self) -> usize {
        let state = self.state.lock();
        state
            .calls
            .iter()
            .filter(|(op, _)| op.is_write() && **op != Operation::UpsertDocument)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Insert a unit row as-is, bypassing every check. For building broken states in tests.
    pub fn seed_unit(&self, unit: SourceText) {
        let mut state = self.state.lock();
        state.next_unit_id = state.next_unit_id.max(unit.id);
        state.units.insert(unit.id, unit);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert_document<'a>(&self, doc: UpsertDocument<'a>) -> Result<Document, StoreError> {
        let mut state = self.state.lock();
        state.enter(Operation::UpsertDocument)?;

        let existing = state
            .documents
            .values()
            .find(|d| d.slug == doc.slug)
            .map(|d| d.id);
        let id = match existing {
            Some(id) => id,
            None => {
                state.next_document_id += 1;
                state.next_document_id
            }
        };
        let row = Document {
            id,
            slug: doc.slug.to_string(),
            owner: doc.owner.to_string(),
            title: doc.title.to_string(),
            content: doc.content.to_string(),
            source_language: doc.source_language.to_string(),
            published: doc.published,
        };
        state.documents.insert(id, row.clone());
        Ok(row)
    }

    async fn find_document<'a>(&self, slug: &'a str) -> Result<Option<Document>, StoreError> {
        let mut state = self.state.lock();
        state.enter(Operation::FindDocument)?;
        Ok(state.documents.values().find(|d| d.slug == slug).cloned())
    }
}

#[async_trait]
impl SourceTextStore for MemoryStore {
    async fn find_by_document(&self, document_id: i64) -> Result<Vec<SourceText>, StoreError> {
        let mut state = self.state.lock();
        state.enter(Operation::FindByDocument)?;
        let mut units: Vec<SourceText> = state.units_of(document_id).cloned().collect();
        units.sort_by_key(|u| (u.number, u.id));
        Ok(units)
    }

    async fn delete_by_ids<'a>(
        &self,
        document_id: i64,
        ids: &'a [i64],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.enter(Operation::DeleteByIds)?;
        let mut deleted = 0;
        for id in ids {
            if state.units.get(id).is_some_and(|u| u.document_id == document_id) {
                state.units.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn shift_numbers<'a>(
        &self,
        document_id: i64,
        ids: &'a [i64],
        offset: i64,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.enter(Operation::ShiftNumbers)?;

        let shifted: HashMap<i64, i64> = state
            .units_of(document_id)
            .filter(|u| ids.contains(&u.id))
            .map(|u| (u.id, u.number + offset))
            .collect();
        state.check_numbers_unique(document_id, &shifted)?;

        for (id, number) in &shifted {
            if let Some(unit) = state.units.get_mut(id) {
                unit.number = *number;
            }
        }
        Ok(shifted.len() as u64)
    }

    async fn update_number(&self, id: i64, number: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.enter(Operation::UpdateNumber)?;

        let document_id = state
            .units
            .get(&id)
            .map(|u| u.document_id)
            .ok_or_else(|| StoreError::NotFound(format!("source text {id}")))?;
        state.check_numbers_unique(document_id, &HashMap::from([(id, number)]))?;
        if let Some(unit) = state.units.get_mut(&id) {
            unit.number = number;
        }
        Ok(())
    }

    async fn insert_skip_duplicates<'a>(
        &self,
        document_id: i64,
        units: &'a [NewSourceText],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock();
        state.enter(Operation::InsertSkipDuplicates)?;

        let mut numbers: HashSet<i64> = state.units_of(document_id).map(|u| u.number).collect();
        let mut fingerprints: HashSet<String> = state
            .units_of(document_id)
            .map(|u| u.fingerprint.clone())
            .collect();

        let mut inserted = 0;
        for unit in units {
            if numbers.contains(&unit.number) || fingerprints.contains(&unit.fingerprint) {
                continue;
            }
            numbers.insert(unit.number);
            fingerprints.insert(unit.fingerprint.clone());
            state.next_unit_id += 1;
            let id = state.next_unit_id;
            state.units.insert(
                id,
                SourceText {
                    id,
                    document_id,
                    text: unit.text.clone(),
                    number: unit.number,
                    fingerprint: unit.fingerprint.clone(),
                },
            );
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn find_by_fingerprints<'a>(
        &self,
        document_id: i64,
        fingerprints: &'a [String],
    ) -> Result<Vec<SourceText>, StoreError> {
        let mut state = self.state.lock();
        state.enter(Operation::FindByFingerprints)?;
        let wanted: HashSet<&str> = fingerprints.iter().map(String::as_str).collect();
        Ok(state
            .units_of(document_id)
            .filter(|u| wanted.contains(u.fingerprint.as_str()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_unit(text: &str, number: i64) -> NewSourceText {
        NewSourceText {
            text: text.to_string(),
            number,
            fingerprint: format!("fp-{text}"),
        }
    }

    async fn document(store: &MemoryStore, slug: &str) -> Document {
        store
            .upsert_document(UpsertDocument {
                slug,
                owner: "owner",
                title: "Title",
                content: "<p>x</p>",
                source_language: "en",
                published: false,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_keeps_the_id_per_slug() {
        let store = MemoryStore::new();
        let first = document(&store, "a").await;
        let again = document(&store, "a").await;
        let other = document(&store, "b").await;
        assert_eq!(first.id, again.id);
        assert_ne!(first.id, other.id);
        assert_eq!(store.find_document("b").await.unwrap(), Some(other));
        assert_eq!(store.find_document("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn insert_skips_fingerprint_and_number_duplicates() {
        let store = MemoryStore::new();
        let doc = document(&store, "a").await;
        let n = store
            .insert_skip_duplicates(doc.id, &[new_unit("A", 0), new_unit("B", 1)])
            .await
            .unwrap();
        assert_eq!(n, 2);

        let clash = NewSourceText {
            text: "C".into(),
            number: 1,
            fingerprint: "fp-C".into(),
        };
        let n = store
            .insert_skip_duplicates(doc.id, &[new_unit("A", 5), clash, new_unit("D", 2)])
            .await
            .unwrap();
        assert_eq!(n, 1);
        let texts: Vec<_> = store
            .find_by_document(doc.id)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.text)
            .collect();
        assert_eq!(texts, vec!["A", "B", "D"]);
    }

    #[tokio::test]
    async fn update_number_rejects_a_taken_number() {
        let store = MemoryStore::new();
        let doc = document(&store, "a").await;
        store
            .insert_skip_duplicates(doc.id, &[new_unit("A", 0), new_unit("B", 1)])
            .await
            .unwrap();
        let units = store.find_by_document(doc.id).await.unwrap();

        let err = store.update_number(units[0].id, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        store.update_number(units[0].id, 0).await.unwrap();
    }

    #[tokio::test]
    async fn shift_is_checked_as_a_whole() {
        let store = MemoryStore::new();
        let doc = document(&store, "a").await;
        store
            .insert_skip_duplicates(doc.id, &[new_unit("A", 0), new_unit("B", 1), new_unit("C", 2)])
            .await
            .unwrap();
        let ids: Vec<i64> = store
            .find_by_document(doc.id)
            .await
            .unwrap()
            .iter()
            .map(|u| u.id)
            .collect();

        // 0,1 -> 1,2 collides with C at 2 but not with each other.
        let err = store.shift_numbers(doc.id, &ids[..2], 1).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.shift_numbers(doc.id, &ids, 1).await.unwrap(), 3);
        let numbers: Vec<i64> = store
            .find_by_document(doc.id)
            .await
            .unwrap()
            .iter()
            .map(|u| u.number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = MemoryStore::new();
        let doc = document(&store, "a").await;
        store.fail_next(Operation::DeleteByIds, StoreError::Unavailable("down".into()));
        assert!(store.delete_by_ids(doc.id, &[1]).await.is_err());
        assert_eq!(store.delete_by_ids(doc.id, &[1]).await.unwrap(), 0);
        assert_eq!(store.calls(Operation::DeleteByIds), 2);
        assert_eq!(store.unit_writes(), 2);
    }
}
