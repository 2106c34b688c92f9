//! Chunked batch writes.
//!
//! Mutations are buffered and committed in transactions of at most
//! [`MAX_BATCH_MUTATIONS`], so a long run persists its progress incrementally
//! and a failure only loses the chunk in flight.

use super::{DocumentStore, Mutation};
use crate::error::StoreError;

/// Upper bound on mutations committed in a single transaction.
pub const MAX_BATCH_MUTATIONS: usize = 500;

/// Buffers mutations and commits them in bounded chunks.
pub struct WriteBatch<'a> {
    store: &'a dyn DocumentStore,
    chunk_size: usize,
    buffer: Vec<Mutation>,
    committed: usize,
    chunks: usize,
}

impl<'a> WriteBatch<'a> {
    pub fn new(store: &'a dyn DocumentStore) -> Self {
        Self::with_chunk_size(store, MAX_BATCH_MUTATIONS)
    }

    /// Chunk sizes are clamped to `1..=MAX_BATCH_MUTATIONS`.
    pub fn with_chunk_size(store: &'a dyn DocumentStore, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.clamp(1, MAX_BATCH_MUTATIONS);
        Self {
            store,
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            committed: 0,
            chunks: 0,
        }
    }

    /// Queues a mutation, committing the buffer once it reaches the chunk size.
    pub async fn push(&mut self, mutation: Mutation) -> Result<(), StoreError> {
        self.buffer.push(mutation);
        if self.buffer.len() >= self.chunk_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Commits whatever is buffered. Returns the number of mutations committed.
    pub async fn flush(&mut self) -> Result<usize, StoreError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        self.store.apply(&self.buffer).await?;

        let n = self.buffer.len();
        self.buffer.clear();
        self.committed += n;
        self.chunks += 1;
        tracing::debug!(
            mutations = n,
            total = self.committed,
            chunk = self.chunks,
            "Committed write batch"
        );
        Ok(n)
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ItemStatus, SqliteDocumentStore, WorkItem};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_commits_in_chunks() {
        let dir = tempdir().unwrap();
        let store = SqliteDocumentStore::open(dir.path().join("batch.db"))
            .await
            .unwrap();

        let mut batch = WriteBatch::with_chunk_size(&store, 4);
        for i in 0..10 {
            batch
                .push(Mutation::Upsert(WorkItem::new(format!("twitter/{i}.png"))))
                .await
                .unwrap();
        }
        assert_eq!(batch.committed(), 8);
        assert_eq!(batch.pending(), 2);
        // committed chunks are already visible
        assert_eq!(store.count_by_status(ItemStatus::Pending).await.unwrap(), 8);

        assert_eq!(batch.flush().await.unwrap(), 2);
        assert_eq!(batch.chunks(), 3);
        assert_eq!(store.count_by_status(ItemStatus::Pending).await.unwrap(), 10);
        assert_eq!(batch.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chunk_size_is_capped() {
        let dir = tempdir().unwrap();
        let store = SqliteDocumentStore::open(dir.path().join("batch.db"))
            .await
            .unwrap();

        let batch = WriteBatch::with_chunk_size(&store, 10_000);
        assert_eq!(batch.chunk_size, MAX_BATCH_MUTATIONS);
        let batch = WriteBatch::with_chunk_size(&store, 0);
        assert_eq!(batch.chunk_size, 1);
    }
}
