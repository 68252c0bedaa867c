//! Reconciliation: turn the new decomposition of a document into store writes
//! that keep the id of every unit whose fingerprint survived.
//!
//! Writes are issued in a fixed phase order, each phase its own transaction:
//!
//! 1. **delete** units whose fingerprint is gone,
//! 2. **offset** the units that must move out of the `0..N` range,
//! 3. **renumber** those units to their targets, in sequential waves of
//!    concurrent single-row updates,
//! 4. **insert** new fingerprints, skipping rows that already exist,
//! 5. **resolve** the ids of the inserted rows by fingerprint.
//!
//! The order is what keeps `(document, number)` and `(document, fingerprint)`
//! unique at every commit point. A failed phase is not rolled back: every
//! phase is idempotent, so re-running the whole reconciliation against the
//! same input converges to the same end state.
//!
//! Callers must not reconcile the same document concurrently (see
//! [`crate::locks`]).

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use futures::future::try_join_all;
use tracing::{debug, info, warn};

use crate::contract::{NewSourceText, SourceText, SourceTextStore};
use crate::error::{PipelineError, ReconcilePhase, StoreError};
use crate::fingerprint::Candidate;

/// One persisted unit that keeps its id but changes position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Renumber {
    pub id: i64,
    pub from: i64,
    pub to: i64,
}

/// The writes needed to move the persisted unit set to the new decomposition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    pub to_delete: Vec<i64>,
    pub to_renumber: Vec<Renumber>,
    pub to_insert: Vec<NewSourceText>,
    /// Added to every renumbered unit before it takes its target.
    pub offset: i64,
    /// fingerprint -> id for units that survive unchanged.
    pub kept: HashMap<String, i64>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.to_delete.is_empty() && self.to_renumber.is_empty() && self.to_insert.is_empty()
    }
}

/// Outcome of applying a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// fingerprint -> id for every unit the store could account for.
    pub ids: HashMap<String, i64>,
    pub deleted: u64,
    pub renumbered: u64,
    pub inserted: u64,
}

/// Diff `candidates` against `persisted`. Pure.
///
/// Units already at their target number are left alone. The offset is large
/// enough that shifted numbers clear every persisted number and every target,
/// including numbers left in the offset range by an interrupted earlier run.
pub fn plan(
    candidates: &[Candidate],
    persisted: &[SourceText],
    base_offset: i64,
) -> Result<ReconcilePlan, PipelineError> {
    let mut existing: HashMap<&str, &SourceText> = HashMap::with_capacity(persisted.len());
    let mut to_delete = Vec::new();
    for unit in persisted {
        match existing.entry(unit.fingerprint.as_str()) {
            // Store let a duplicate fingerprint through; keep the first row only.
            Entry::Occupied(_) => to_delete.push(unit.id),
            Entry::Vacant(slot) => {
                slot.insert(unit);
            }
        }
    }

    let mut wanted: HashMap<&str, &Candidate> = HashMap::with_capacity(candidates.len());
    for candidate in candidates {
        if wanted.insert(candidate.fingerprint.as_str(), candidate).is_some() {
            return Err(PipelineError::Conflict {
                phase: ReconcilePhase::Plan,
                source: StoreError::Conflict(format!(
                    "fingerprint {} appears twice in one decomposition",
                    candidate.fingerprint
                )),
            });
        }
    }

    for (fingerprint, unit) in &existing {
        if !wanted.contains_key(fingerprint) {
            to_delete.push(unit.id);
        }
    }
    to_delete.sort_unstable();

    let mut to_renumber = Vec::new();
    let mut to_insert = Vec::new();
    let mut kept = HashMap::new();
    for candidate in candidates {
        match existing.get(candidate.fingerprint.as_str()) {
            Some(unit) => {
                kept.insert(candidate.fingerprint.clone(), unit.id);
                if unit.number != candidate.number {
                    to_renumber.push(Renumber {
                        id: unit.id,
                        from: unit.number,
                        to: candidate.number,
                    });
                }
            }
            None => to_insert.push(NewSourceText {
                text: candidate.text.clone(),
                number: candidate.number,
                fingerprint: candidate.fingerprint.clone(),
            }),
        }
    }

    let max_persisted = persisted.iter().map(|u| u.number).max().unwrap_or(-1);
    let offset = base_offset
        .max(max_persisted.saturating_add(1))
        .max(candidates.len() as i64);

    Ok(ReconcilePlan {
        to_delete,
        to_renumber,
        to_insert,
        offset,
        kept,
    })
}

/// Execute `plan` against the store, phase by phase.
pub async fn apply<S>(
    store: &S,
    document_id: i64,
    plan: ReconcilePlan,
    batch_size: usize,
) -> Result<Resolution, PipelineError>
where
    S: SourceTextStore + ?Sized,
{
    let ReconcilePlan {
        to_delete,
        to_renumber,
        to_insert,
        offset,
        kept,
    } = plan;
    let mut resolution = Resolution {
        ids: kept,
        ..Default::default()
    };

    if !to_delete.is_empty() {
        resolution.deleted = store
            .delete_by_ids(document_id, &to_delete)
            .await
            .map_err(|e| PipelineError::from_store(ReconcilePhase::Delete, e))?;
        debug!(document_id, deleted = resolution.deleted, "[SYNC][RECONCILE] Deleted vanished units");
    }

    if !to_renumber.is_empty() {
        let ids: Vec<i64> = to_renumber.iter().map(|r| r.id).collect();
        store
            .shift_numbers(document_id, &ids, offset)
            .await
            .map_err(|e| PipelineError::from_store(ReconcilePhase::Offset, e))?;
        debug!(document_id, moved = ids.len(), offset, "[SYNC][RECONCILE] Offset moving units");

        for (wave, chunk) in to_renumber.chunks(batch_size.max(1)).enumerate() {
            let updates = chunk.iter().map(|r| store.update_number(r.id, r.to));
            try_join_all(updates)
                .await
                .map_err(|e| PipelineError::from_store(ReconcilePhase::Renumber, e))?;
            resolution.renumbered += chunk.len() as u64;
            debug!(document_id, wave, size = chunk.len(), "[SYNC][RECONCILE] Renumber wave done");
        }
    }

    if !to_insert.is_empty() {
        resolution.inserted = store
            .insert_skip_duplicates(document_id, &to_insert)
            .await
            .map_err(|e| PipelineError::from_store(ReconcilePhase::Insert, e))?;
        if resolution.inserted < to_insert.len() as u64 {
            warn!(
                document_id,
                requested = to_insert.len(),
                inserted = resolution.inserted,
                "[SYNC][RECONCILE] Some inserts were skipped as duplicates"
            );
        }

        let fingerprints: Vec<String> = to_insert.into_iter().map(|u| u.fingerprint).collect();
        let created = store
            .find_by_fingerprints(document_id, &fingerprints)
            .await
            .map_err(|e| PipelineError::from_store(ReconcilePhase::Resolve, e))?;
        for unit in created {
            resolution.ids.insert(unit.fingerprint, unit.id);
        }
    }

    Ok(resolution)
}

/// Load the persisted units of `document_id`, plan against `candidates`, apply.
pub async fn reconcile<S>(
    store: &S,
    document_id: i64,
    candidates: &[Candidate],
    base_offset: i64,
    batch_size: usize,
) -> Result<Resolution, PipelineError>
where
    S: SourceTextStore + ?Sized,
{
    let persisted = store
        .find_by_document(document_id)
        .await
        .map_err(|e| PipelineError::from_store(ReconcilePhase::Load, e))?;

    let plan = plan(candidates, &persisted, base_offset)?;
    info!(
        document_id,
        persisted = persisted.len(),
        wanted = candidates.len(),
        delete = plan.to_delete.len(),
        renumber = plan.to_renumber.len(),
        insert = plan.to_insert.len(),
        "[SYNC][RECONCILE] Planned"
    );
    if plan.is_noop() {
        return Ok(Resolution {
            ids: plan.kept,
            ..Default::default()
        });
    }

    apply(store, document_id, plan, batch_size).await
}
