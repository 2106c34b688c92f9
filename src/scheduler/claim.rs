//! Backlog claiming.
//!
//! A claim moves every `pending` item to `processing` in one store
//! transaction. Concurrent workers therefore partition the backlog: each
//! pending item ends up in exactly one worker's batch. Claimed items are never
//! handed back; whatever happens to them afterwards is recorded as
//! `inferred` or `error`.

use std::sync::Arc;

use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::storage::{DocumentStore, ItemStatus, WorkItem};

/// Default minimum number of pending items before a claim is attempted.
pub const DEFAULT_MIN_BACKLOG: u64 = 100;

/// Claims batches of pending work for this process.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn DocumentStore>,
    min_backlog: u64,
    metrics: MetricsCollector,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            min_backlog: DEFAULT_MIN_BACKLOG,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_min_backlog(mut self, min_backlog: u64) -> Self {
        self.min_backlog = min_backlog;
        self
    }

    pub fn min_backlog(&self) -> u64 {
        self.min_backlog
    }

    /// Whether the pending backlog currently reaches `min_backlog`.
    ///
    /// Callers use it to skip expensive setup; the claim itself checks again.
    pub async fn has_backlog(&self) -> Result<bool, StoreError> {
        let pending = self.store.count_by_status(ItemStatus::Pending).await?;
        Ok(pending >= self.min_backlog)
    }

    /// Claims the pending backlog if it has at least `min_backlog` items.
    ///
    /// Returns the items as they were before the claim. A backlog below the
    /// threshold yields an empty batch and leaves the store untouched.
    ///
    /// # Errors
    ///
    /// Store failures other than transaction contention, which the store
    /// retries itself.
    pub async fn claim_pending_batch(&self) -> Result<Vec<WorkItem>, StoreError> {
        let pending = self.store.count_by_status(ItemStatus::Pending).await?;
        if pending < self.min_backlog {
            tracing::info!(
                pending,
                min_backlog = self.min_backlog,
                "Backlog below threshold, nothing claimed"
            );
            return Ok(Vec::new());
        }

        let claimed = self.store.claim_pending().await?;
        self.metrics.record_claimed(claimed.len());
        tracing::info!(pending, claimed = claimed.len(), "Claimed pending items");
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteDocumentStore;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    async fn seed(store: &SqliteDocumentStore, count: usize) {
        for i in 0..count {
            store
                .upsert_item(&WorkItem::new(format!("twitter/{i:04}.png")))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_below_threshold_claims_nothing() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteDocumentStore::open(dir.path().join("db.sqlite")).await.unwrap());
        seed(&store, 99).await;

        let coordinator = ClaimCoordinator::new(store.clone());
        let claimed = coordinator.claim_pending_batch().await.unwrap();

        assert!(claimed.is_empty());
        assert!(!coordinator.has_backlog().await.unwrap());
        assert!(coordinator.clone().with_min_backlog(99).has_backlog().await.unwrap());
        assert_eq!(store.count_by_status(ItemStatus::Pending).await.unwrap(), 99);
        assert_eq!(store.count_by_status(ItemStatus::Processing).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_flips_backlog_and_returns_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteDocumentStore::open(dir.path().join("db.sqlite")).await.unwrap());
        seed(&store, 5).await;

        let coordinator = ClaimCoordinator::new(store.clone()).with_min_backlog(5);
        let claimed = coordinator.claim_pending_batch().await.unwrap();

        assert_eq!(claimed.len(), 5);
        assert!(claimed.iter().all(|item| item.status == ItemStatus::Pending));
        assert_eq!(store.count_by_status(ItemStatus::Processing).await.unwrap(), 5);

        let again = coordinator.claim_pending_batch().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_partition_backlog() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        let first = Arc::new(SqliteDocumentStore::open(&path).await.unwrap());
        let second = Arc::new(SqliteDocumentStore::open(&path).await.unwrap());
        seed(&first, 150).await;

        let a = ClaimCoordinator::new(first.clone());
        let b = ClaimCoordinator::new(second.clone());
        let (claimed_a, claimed_b) = tokio::join!(a.claim_pending_batch(), b.claim_pending_batch());

        let ids_a: BTreeSet<String> = claimed_a.unwrap().into_iter().map(|i| i.id).collect();
        let ids_b: BTreeSet<String> = claimed_b.unwrap().into_iter().map(|i| i.id).collect();

        assert!(ids_a.is_disjoint(&ids_b));
        assert_eq!(ids_a.len() + ids_b.len(), 150);
        assert_eq!(first.count_by_status(ItemStatus::Pending).await.unwrap(), 0);
        assert_eq!(second.count_by_status(ItemStatus::Processing).await.unwrap(), 150);
    }
}
