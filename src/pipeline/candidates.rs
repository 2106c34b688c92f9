//! Candidate selection for backfill stages.
//!
//! The store can filter by status but not by "slot lacks this model key", so
//! selection over-fetches a page of items and filters it here. Pages are
//! walked with an id cursor, so items already looked at are not fetched again
//! within a run.

use crate::error::StoreError;
use crate::storage::{CandidateQuery, DocumentStore, ItemStatus, Slot, WorkItem};

/// Items fetched per wanted candidate.
pub const OVER_FETCH_FACTOR: usize = 3;

/// Which items a backfill stage applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillSelection {
    pub statuses: Vec<ItemStatus>,
    /// Result that must already exist.
    pub upstream: (Slot, String),
    /// Result this stage produces; items that have it are skipped.
    pub target: (Slot, String),
}

/// One page of selection results.
#[derive(Debug, Clone, Default)]
pub struct CandidatePage {
    pub candidates: Vec<WorkItem>,
    /// Number of items fetched from the store for this page.
    pub scanned: usize,
    /// Cursor for the next page.
    pub last_id: Option<String>,
    /// True when the store has no items past this page.
    pub exhausted: bool,
}

impl BackfillSelection {
    /// Curated or captioned items that have a caption from `caption_model` but
    /// no age estimate from `age_model`.
    pub fn age_estimation(caption_model: impl Into<String>, age_model: impl Into<String>) -> Self {
        Self {
            statuses: vec![ItemStatus::Liked, ItemStatus::Inferred],
            upstream: (Slot::Captions, caption_model.into()),
            target: (Slot::AgeEstimations, age_model.into()),
        }
    }

    /// Has non-empty upstream output and lacks the target result.
    pub fn needs_backfill(&self, item: &WorkItem) -> bool {
        let (upstream_slot, upstream_model) = &self.upstream;
        let (target_slot, target_model) = &self.target;

        let has_upstream = item
            .result(*upstream_slot, upstream_model)
            .is_some_and(|record| !record.raw_output.trim().is_empty());
        has_upstream && !item.has_result(*target_slot, target_model)
    }

    /// Fetches up to `limit * OVER_FETCH_FACTOR` items after `after_id` and
    /// keeps at most `limit` that need the backfill.
    pub async fn next_page(
        &self,
        store: &dyn DocumentStore,
        limit: usize,
        after_id: Option<&str>,
    ) -> Result<CandidatePage, StoreError> {
        let fetch_limit = limit.max(1).saturating_mul(OVER_FETCH_FACTOR);
        let mut query = CandidateQuery::new()
            .with_statuses(self.statuses.iter().copied())
            .with_limit(fetch_limit);
        if let Some(id) = after_id {
            query = query.with_after_id(id);
        }

        let items = store.list_items(&query).await?;
        let scanned = items.len();
        let exhausted = scanned < fetch_limit;

        let mut page = CandidatePage {
            scanned,
            exhausted,
            last_id: after_id.map(str::to_string),
            ..CandidatePage::default()
        };
        for item in items {
            page.last_id = Some(item.id.clone());
            if self.needs_backfill(&item) {
                page.candidates.push(item);
                if page.candidates.len() >= limit {
                    // Unexamined items remain in this page.
                    page.exhausted = false;
                    break;
                }
            }
        }

        tracing::debug!(
            scanned,
            candidates = page.candidates.len(),
            exhausted = page.exhausted,
            "Selected backfill candidates"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RecordMetadata, ResultRecord, SqliteDocumentStore};
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(raw: &str) -> ResultRecord {
        ResultRecord::new(
            RecordMetadata {
                model: "Test".to_string(),
                backend: "llama.cpp".to_string(),
                language_repository: None,
                vision_repository: None,
                language_file: None,
                vision_file: None,
                prompt: "p".to_string(),
                caption_source: None,
                created_at: Utc::now(),
            },
            raw,
        )
    }

    fn item(key: &str, caption: Option<&str>, aged: bool) -> WorkItem {
        let mut item = WorkItem::new(key).with_status(ItemStatus::Liked);
        if let Some(caption) = caption {
            item.captions.insert("minicpm".to_string(), record(caption));
        }
        if aged {
            item.age_estimations.insert("qwen3".to_string(), record("{}"));
        }
        item
    }

    #[test]
    fn test_needs_backfill() {
        let selection = BackfillSelection::age_estimation("minicpm", "qwen3");
        assert!(selection.needs_backfill(&item("a/1.png", Some("A cat."), false)));
        assert!(!selection.needs_backfill(&item("a/2.png", Some("A cat."), true)));
        assert!(!selection.needs_backfill(&item("a/3.png", None, false)));
        assert!(!selection.needs_backfill(&item("a/4.png", Some("  "), false)));
    }

    async fn seeded_store(dir: &TempDir) -> SqliteDocumentStore {
        let store = SqliteDocumentStore::open(dir.path().join("db.sqlite")).await.unwrap();
        for i in 0..10 {
            let key = format!("twitter/{i:02}.png");
            let caption = (i % 2 == 0).then_some("A caption.");
            let item = item(&key, caption, i == 4);
            store.upsert_item(&item).await.unwrap();
            for (model, record) in &item.captions {
                store
                    .merge_result(&item.id, Slot::Captions, model, record)
                    .await
                    .unwrap();
            }
            for (model, record) in &item.age_estimations {
                store
                    .merge_result(&item.id, Slot::AgeEstimations, model, record)
                    .await
                    .unwrap();
            }
        }
        store
    }

    #[tokio::test]
    async fn test_pages_walk_the_whole_store() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        let selection = BackfillSelection::age_estimation("minicpm", "qwen3");

        let first = selection.next_page(&store, 1, None).await.unwrap();
        assert_eq!(first.scanned, 3);
        assert_eq!(first.candidates.len(), 1);
        assert_eq!(first.candidates[0].key, "twitter/00.png");
        assert!(!first.exhausted);

        let mut keys = vec![first.candidates[0].key.clone()];
        let mut cursor = first.last_id;
        loop {
            let page = selection
                .next_page(&store, 1, cursor.as_deref())
                .await
                .unwrap();
            keys.extend(page.candidates.iter().map(|i| i.key.clone()));
            cursor = page.last_id;
            if page.exhausted {
                break;
            }
        }
        assert_eq!(
            keys,
            vec!["twitter/00.png", "twitter/02.png", "twitter/06.png", "twitter/08.png"]
        );
    }

    #[tokio::test]
    async fn test_status_filter() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir).await;
        store
            .set_status(&WorkItem::id_for_key("twitter/00.png"), ItemStatus::Error)
            .await
            .unwrap();

        let selection = BackfillSelection::age_estimation("minicpm", "qwen3");
        let page = selection.next_page(&store, 10, None).await.unwrap();
        let keys: Vec<_> = page.candidates.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["twitter/02.png", "twitter/06.png", "twitter/08.png"]);
        assert!(page.exhausted);
    }
}
