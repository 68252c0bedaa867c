//! Error vocabulary for the source text pipeline.
//!
//! Store adapters map their backend failures into [`StoreError`]. The
//! reconciler and orchestrator lift those into [`PipelineError`], labelled
//! with the [`ReconcilePhase`] that raised them, and the orchestrator wraps
//! the result in a [`SynchroniseError`] carrying the last state reached.

use std::fmt;

use thiserror::Error;

use crate::synchronise::PipelineState;

/// Failure reported by a [`crate::contract::SourceTextStore`] or
/// [`crate::contract::DocumentStore`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("constraint conflict: {0}")]
    Conflict(String),

    /// The transaction could not be committed (connection lost, database busy, IO).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Invalid [`crate::config::PipelineConfig`] values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block tag set must not be empty")]
    NoBlockTags,
    #[error("marker {0} must not be empty")]
    EmptyMarker(&'static str),
    #[error("update batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("renumber offset must be positive, got {0}")]
    NonPositiveOffset(i64),
}

/// Store round-trips issued while reconciling one document, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcilePhase {
    /// Pure diff of the decomposition against the persisted units; no I/O.
    Plan,
    Load,
    Delete,
    Offset,
    Renumber,
    Insert,
    Resolve,
    /// Document row upserts around reconciliation.
    Document,
}

impl fmt::Display for ReconcilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcilePhase::Plan => "plan",
            ReconcilePhase::Load => "load",
            ReconcilePhase::Delete => "delete",
            ReconcilePhase::Offset => "offset",
            ReconcilePhase::Renumber => "renumber",
            ReconcilePhase::Insert => "insert",
            ReconcilePhase::Resolve => "resolve",
            ReconcilePhase::Document => "document",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Input could not be turned into a tree.
    #[error("parse failure: {0}")]
    Parse(String),

    /// A uniqueness violation, typically a concurrent run on the same document.
    /// Re-running the pipeline with the same input converges.
    #[error("reconciliation conflict during {phase}: {source}")]
    Conflict {
        phase: ReconcilePhase,
        #[source]
        source: StoreError,
    },

    /// A transaction could not be committed.
    #[error("store unavailable during {phase}: {source}")]
    StoreUnavailable {
        phase: ReconcilePhase,
        #[source]
        source: StoreError,
    },

    /// The caller cancelled the run before reconciliation began.
    #[error("cancelled after {state}")]
    Cancelled { state: PipelineState },

    #[error("invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Classify a store failure raised during `phase`.
    ///
    /// A unit vanishing while it is offset or renumbered means another run
    /// deleted it, which is the same-document race and counts as a conflict.
    pub fn from_store(phase: ReconcilePhase, source: StoreError) -> Self {
        let conflict = match source {
            StoreError::Conflict(_) => true,
            StoreError::NotFound(_) => {
                matches!(phase, ReconcilePhase::Offset | ReconcilePhase::Renumber)
            }
            StoreError::Unavailable(_) => false,
        };
        if conflict {
            PipelineError::Conflict { phase, source }
        } else {
            PipelineError::StoreUnavailable { phase, source }
        }
    }

    /// Whether resubmitting the identical input is expected to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Conflict { .. })
    }
}

/// Terminal failure of one [`crate::synchronise::synchronise`] run.
#[derive(Error, Debug)]
#[error("synchronise failed after {state}: {error}")]
pub struct SynchroniseError {
    /// Last state the run reached before failing.
    pub state: PipelineState,
    #[source]
    pub error: PipelineError,
}

impl SynchroniseError {
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_retryable_unavailability_is_not() {
        let conflict = PipelineError::from_store(
            ReconcilePhase::Insert,
            StoreError::Conflict("number".into()),
        );
        assert!(conflict.is_retryable());

        let down = PipelineError::from_store(
            ReconcilePhase::Delete,
            StoreError::Unavailable("disk".into()),
        );
        assert!(!down.is_retryable());
        assert_eq!(
            down.to_string(),
            "store unavailable during delete: store unavailable: disk"
        );
    }

    #[test]
    fn vanished_unit_during_renumber_is_a_conflict() {
        let renumber = PipelineError::from_store(
            ReconcilePhase::Renumber,
            StoreError::NotFound("source text 7".into()),
        );
        assert!(matches!(renumber, PipelineError::Conflict { .. }));
        assert!(renumber.is_retryable());

        let document = PipelineError::from_store(
            ReconcilePhase::Document,
            StoreError::NotFound("doc".into()),
        );
        assert!(!document.is_retryable());
    }
}
