//! Persistent storage for work items and source assets.
//!
//! # Overview
//!
//! - **DocumentStore**: work items keyed by encoded asset key, with a status
//!   and one result slot per inference stage. [`SqliteDocumentStore`] is the
//!   concrete implementation.
//! - **WriteBatch**: chunked, incrementally committed multi-item writes.
//! - **AssetStore**: read access to source image bytes.
//!
//! Result slots are merge-only: writing a record under a model key that is
//! already present leaves the existing record untouched.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vlm_worker::storage::{DocumentStore, SqliteDocumentStore, WorkItem};
//!
//! let store = SqliteDocumentStore::open("worker.db").await?;
//! store.upsert_item(&WorkItem::new("twitter/abc.png")).await?;
//! let claimed = store.claim_pending().await?;
//! ```

pub mod assets;
pub mod document;
pub mod sqlite;
pub mod write_batch;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::StoreError;

pub use assets::{image_data_uri, AssetStore, LocalAssetStore};
pub use document::{ItemStatus, RecordMetadata, ResultRecord, Slot, SlotMap, WorkItem};
pub use sqlite::SqliteDocumentStore;
pub use write_batch::{WriteBatch, MAX_BATCH_MUTATIONS};

/// Filter for listing work items.
#[derive(Debug, Clone, Default)]
pub struct CandidateQuery {
    /// Accepted statuses. Empty means any status.
    pub statuses: Vec<ItemStatus>,
    /// Only items whose `slot[model].metadata.createdAt` is at or after the
    /// given instant.
    pub created_after: Option<CreatedAfter>,
    /// Only items whose id sorts after this one, for paging.
    pub after_id: Option<String>,
    pub limit: Option<usize>,
}

/// Range filter on a nested result timestamp.
#[derive(Debug, Clone)]
pub struct CreatedAfter {
    pub slot: Slot,
    pub model_key: String,
    pub since: DateTime<Utc>,
}

impl CandidateQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = ItemStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_created_after(
        mut self,
        slot: Slot,
        model_key: impl Into<String>,
        since: DateTime<Utc>,
    ) -> Self {
        self.created_after = Some(CreatedAfter {
            slot,
            model_key: model_key.into(),
            since,
        });
        self
    }

    pub fn with_after_id(mut self, id: impl Into<String>) -> Self {
        self.after_id = Some(id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One write inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Insert the item if absent, otherwise only fill missing identity fields.
    Upsert(WorkItem),
    SetStatus { id: String, status: ItemStatus },
    MergeResult {
        id: String,
        slot: Slot,
        model_key: String,
        record: ResultRecord,
    },
}

/// Document store holding the work backlog and its inference results.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts the item if it does not exist. Existing items keep their
    /// status and slots. Returns whether a new item was created.
    async fn upsert_item(&self, item: &WorkItem) -> Result<bool, StoreError>;

    async fn get_item(&self, id: &str) -> Result<Option<WorkItem>, StoreError>;

    async fn count_by_status(&self, status: ItemStatus) -> Result<u64, StoreError>;

    async fn status_counts(&self) -> Result<BTreeMap<ItemStatus, u64>, StoreError>;

    /// Lists items matching `query`, ordered by id.
    async fn list_items(&self, query: &CandidateQuery) -> Result<Vec<WorkItem>, StoreError>;

    /// Atomically moves every pending item to processing and returns the
    /// pre-update snapshot of the items this call moved. Contention with
    /// concurrent claimers is retried internally.
    async fn claim_pending(&self) -> Result<Vec<WorkItem>, StoreError>;

    async fn set_status(&self, id: &str, status: ItemStatus) -> Result<(), StoreError>;

    /// Stores `record` under `slot[model_key]` unless a record is already
    /// present. Returns whether the record was written.
    async fn merge_result(
        &self,
        id: &str,
        slot: Slot,
        model_key: &str,
        record: &ResultRecord,
    ) -> Result<bool, StoreError>;

    /// Adds `field` to an existing record unless the field is already set.
    async fn merge_addendum(
        &self,
        id: &str,
        slot: Slot,
        model_key: &str,
        field: &str,
        value: &Value,
    ) -> Result<bool, StoreError>;

    /// Applies all mutations in a single transaction.
    async fn apply(&self, mutations: &[Mutation]) -> Result<(), StoreError>;
}
