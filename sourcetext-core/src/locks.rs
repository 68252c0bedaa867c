//! Per-document serialization.
//!
//! Reconciliation assumes nobody else writes the same document's units while
//! it runs. [`DocumentLocks`] hands out one async mutex per slug so runs for
//! the same document queue up while runs for different documents proceed.

use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::contract::{DocumentStore, SourceTextStore};
use crate::error::SynchroniseError;
use crate::synchronise::{synchronise, SynchroniseReport, SynchroniseRequest};

#[derive(Debug, Default)]
pub struct DocumentLocks {
    slugs: DashMap<String, Arc<Mutex<()>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `slug`. Held until the guard drops.
    pub async fn lock(&self, slug: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .slugs
            .entry(slug.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.slugs.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.slugs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slugs.is_empty()
    }
}

/// [`synchronise`] while holding the lock for the request's slug.
pub async fn synchronise_serialized<D, S>(
    locks: &DocumentLocks,
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
    let _guard = locks.lock(&request.slug).await;
    debug!(slug = %request.slug, "[SYNC] Acquired document lock");
    synchronise(request, documents, units, config, cancel).await
}

/// Synchronise many documents, at most `concurrency` at a time. Requests for
/// the same slug never overlap. Results come back in input order.
pub async fn synchronise_all<D, S>(
    requests: &[SynchroniseRequest],
    documents: &D,
    units: &S,
    config: &PipelineConfig,
    cancel: &CancellationToken,
    concurrency: usize,
) -> Vec<Result<SynchroniseReport, SynchroniseError>>
where
    D: DocumentStore + ?Sized,
    S: SourceTextStore + ?Sized,
{
    let locks = DocumentLocks::new();
    info!(documents = requests.len(), concurrency, "[SYNC] Starting bulk synchronisation");

    let mut results: Vec<(usize, Result<SynchroniseReport, SynchroniseError>)> =
        stream::iter(requests.iter().enumerate())
            .map(|(index, request)| {
                let locks = &locks;
                async move {
                    let result =
                        synchronise_serialized(locks, request, documents, units, config, cancel)
                            .await;
                    (index, result)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

    results.sort_by_key(|(index, _)| *index);
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    info!(
        documents = requests.len(),
        failed, "[SYNC] Bulk synchronisation finished"
    );
    results.into_iter().map(|(_, result)| result).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_slug_waits_other_slug_does_not() {
        let locks = DocumentLocks::new();
        let held = locks.lock("a").await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("b")).await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(Duration::from_millis(50), locks.lock("a")).await;
        assert!(same.is_err());

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.lock("a")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn prune_forgets_idle_slugs() {
        let locks = DocumentLocks::new();
        let held = locks.lock("busy").await;
        drop(locks.lock("idle").await);
        assert_eq!(locks.len(), 2);

        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
