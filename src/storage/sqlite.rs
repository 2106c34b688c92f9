//! SQLite-backed document store.
//!
//! One row per work item. Each result slot is a JSON object column keyed by
//! model key; merges go through SQLite's JSON functions so an existing record
//! is never replaced.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use super::document::{validate_model_key, ItemStatus, ResultRecord, Slot, SlotMap, WorkItem};
use super::{CandidateQuery, DocumentStore, Mutation};
use crate::error::StoreError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id              TEXT PRIMARY KEY,
    key             TEXT NOT NULL,
    type            TEXT,
    post_id         TEXT,
    status          TEXT NOT NULL DEFAULT 'pending',

    -- Result slots: JSON objects of model key -> result record
    captions        TEXT NOT NULL DEFAULT '{}',
    moderations     TEXT NOT NULL DEFAULT '{}',
    age_estimations TEXT NOT NULL DEFAULT '{}',
    tags            TEXT NOT NULL DEFAULT '{}',

    created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);
"#;

const NOW_SQL: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Attempts made for a transaction that keeps hitting SQLITE_BUSY/LOCKED.
const MAX_CONTENTION_ATTEMPTS: u32 = 10;

/// Backoff unit between contended attempts; multiplied by the attempt number.
const CONTENTION_BACKOFF: Duration = Duration::from_millis(25);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Document store persisted in a single SQLite file.
///
/// Several processes may open the same file; claims are coordinated through
/// SQLite transactions.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = %path.display(), "Document store opened");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn try_claim_pending(&self) -> Result<Vec<WorkItem>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("SELECT * FROM documents WHERE status = ?1 ORDER BY id")
            .bind(ItemStatus::Pending.as_str())
            .fetch_all(&mut *tx)
            .await?;

        let update = format!(
            "UPDATE documents SET status = ?1, updated_at = {NOW_SQL} WHERE id = ?2 AND status = ?3"
        );
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let item = row_to_item(row)?;
            let result = sqlx::query(&update)
                .bind(ItemStatus::Processing.as_str())
                .bind(&item.id)
                .bind(ItemStatus::Pending.as_str())
                .execute(&mut *tx)
                .await?;
            // Rows flipped by a concurrent claimer are not ours.
            if result.rows_affected() == 1 {
                claimed.push(item);
            }
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn try_apply(&self, mutations: &[Mutation]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for mutation in mutations {
            match mutation {
                Mutation::Upsert(item) => {
                    upsert_item(&mut *tx, item).await?;
                }
                Mutation::SetStatus { id, status } => {
                    set_status(&mut *tx, id, *status).await?;
                }
                Mutation::MergeResult {
                    id,
                    slot,
                    model_key,
                    record,
                } => {
                    merge_result(&mut *tx, id, *slot, model_key, record).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn upsert_item(&self, item: &WorkItem) -> Result<bool, StoreError> {
        retry_on_contention("upsert_item", move || async move {
            let mut conn = self.pool.acquire().await?;
            upsert_item(&mut *conn, item).await
        })
        .await
    }

    async fn get_item(&self, id: &str) -> Result<Option<WorkItem>, StoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn count_by_status(&self, status: ItemStatus) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn status_counts(&self) -> Result<BTreeMap<ItemStatus, u64>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: BTreeMap<ItemStatus, u64> =
            ItemStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.parse::<ItemStatus>() {
                Ok(status) => {
                    counts.insert(status, n as u64);
                }
                Err(_) => {
                    tracing::warn!(status = %status, count = n, "Ignoring unknown status in store");
                }
            }
        }
        Ok(counts)
    }

    async fn list_items(&self, query: &CandidateQuery) -> Result<Vec<WorkItem>, StoreError> {
        let mut clauses = Vec::new();
        if !query.statuses.is_empty() {
            let placeholders = vec!["?"; query.statuses.len()].join(", ");
            clauses.push(format!("status IN ({placeholders})"));
        }
        if let Some(filter) = &query.created_after {
            validate_model_key(&filter.model_key)?;
            clauses.push(format!(
                "julianday(json_extract({}, ?)) >= julianday(?)",
                filter.slot.column()
            ));
        }
        if query.after_id.is_some() {
            clauses.push("id > ?".to_string());
        }

        let mut sql = String::from("SELECT * FROM documents");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id");
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql);
        for status in &query.statuses {
            q = q.bind(status.as_str());
        }
        if let Some(filter) = &query.created_after {
            q = q
                .bind(format!("{}.metadata.createdAt", json_path(&filter.model_key)))
                .bind(filter.since.to_rfc3339());
        }
        if let Some(after_id) = &query.after_id {
            q = q.bind(after_id);
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn claim_pending(&self) -> Result<Vec<WorkItem>, StoreError> {
        retry_on_contention("claim_pending", move || self.try_claim_pending()).await
    }

    async fn set_status(&self, id: &str, status: ItemStatus) -> Result<(), StoreError> {
        retry_on_contention("set_status", move || async move {
            let mut conn = self.pool.acquire().await?;
            set_status(&mut *conn, id, status).await
        })
        .await
    }

    async fn merge_result(
        &self,
        id: &str,
        slot: Slot,
        model_key: &str,
        record: &ResultRecord,
    ) -> Result<bool, StoreError> {
        let written = retry_on_contention("merge_result", move || async move {
            let mut conn = self.pool.acquire().await?;
            merge_result(&mut *conn, id, slot, model_key, record).await
        })
        .await?;

        if !written && !self.exists(id).await? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(written)
    }

    async fn merge_addendum(
        &self,
        id: &str,
        slot: Slot,
        model_key: &str,
        field: &str,
        value: &Value,
    ) -> Result<bool, StoreError> {
        validate_model_key(model_key)?;
        validate_model_key(field)?;

        let column = slot.column();
        let record_path = json_path(model_key);
        let field_path = format!("{record_path}.{field}");
        let payload = serde_json::to_string(value)?;
        let sql = format!(
            "UPDATE documents SET {column} = json_set({column}, ?1, json(?2)), updated_at = {NOW_SQL} \
             WHERE id = ?3 AND json_type({column}, ?4) = 'object' AND json_type({column}, ?1) IS NULL"
        );

        let (sql, field_path, payload, record_path) = (
            sql.as_str(),
            field_path.as_str(),
            payload.as_str(),
            record_path.as_str(),
        );
        let written = retry_on_contention("merge_addendum", move || async move {
            let result = sqlx::query(sql)
                .bind(field_path)
                .bind(payload)
                .bind(id)
                .bind(record_path)
                .execute(&self.pool)
                .await?;
            Ok::<_, StoreError>(result.rows_affected() == 1)
        })
        .await?;

        if !written && !self.exists(id).await? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(written)
    }

    async fn apply(&self, mutations: &[Mutation]) -> Result<(), StoreError> {
        if mutations.is_empty() {
            return Ok(());
        }
        retry_on_contention("apply", move || self.try_apply(mutations)).await
    }
}

// =============================================================================
// Statement helpers shared by single writes and batched transactions
// =============================================================================

async fn upsert_item(conn: &mut SqliteConnection, item: &WorkItem) -> Result<bool, StoreError> {
    let inserted = sqlx::query(
        "INSERT INTO documents (id, key, type, post_id, status, captions, moderations, age_estimations, tags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(&item.id)
    .bind(&item.key)
    .bind(&item.item_type)
    .bind(&item.post_id)
    .bind(item.status.as_str())
    .bind(serde_json::to_string(&item.captions)?)
    .bind(serde_json::to_string(&item.moderations)?)
    .bind(serde_json::to_string(&item.age_estimations)?)
    .bind(serde_json::to_string(&item.tags)?)
    .execute(&mut *conn)
    .await?
    .rows_affected()
        == 1;

    if !inserted {
        sqlx::query(
            "UPDATE documents SET type = COALESCE(type, ?2), post_id = COALESCE(post_id, ?3) WHERE id = ?1",
        )
        .bind(&item.id)
        .bind(&item.item_type)
        .bind(&item.post_id)
        .execute(&mut *conn)
        .await?;
    }
    Ok(inserted)
}

async fn set_status(
    conn: &mut SqliteConnection,
    id: &str,
    status: ItemStatus,
) -> Result<(), StoreError> {
    let sql = format!("UPDATE documents SET status = ?1, updated_at = {NOW_SQL} WHERE id = ?2");
    let result = sqlx::query(&sql)
        .bind(status.as_str())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

async fn merge_result(
    conn: &mut SqliteConnection,
    id: &str,
    slot: Slot,
    model_key: &str,
    record: &ResultRecord,
) -> Result<bool, StoreError> {
    validate_model_key(model_key)?;

    let column = slot.column();
    let sql = format!(
        "UPDATE documents SET {column} = json_insert({column}, ?1, json(?2)), updated_at = {NOW_SQL} \
         WHERE id = ?3 AND json_type({column}, ?1) IS NULL"
    );
    let result = sqlx::query(&sql)
        .bind(json_path(model_key))
        .bind(serde_json::to_string(record)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// JSON path addressing `model_key` at the top level of a slot object.
fn json_path(model_key: &str) -> String {
    format!("$.\"{model_key}\"")
}

fn row_to_item(row: &SqliteRow) -> Result<WorkItem, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(WorkItem {
        id: row.try_get("id")?,
        key: row.try_get("key")?,
        item_type: row.try_get("type")?,
        post_id: row.try_get("post_id")?,
        status: status.parse()?,
        captions: slot_from_row(row, Slot::Captions)?,
        moderations: slot_from_row(row, Slot::Moderations)?,
        age_estimations: slot_from_row(row, Slot::AgeEstimations)?,
        tags: slot_from_row(row, Slot::Tags)?,
    })
}

fn slot_from_row(row: &SqliteRow, slot: Slot) -> Result<SlotMap, StoreError> {
    let raw: String = row.try_get(slot.column())?;
    Ok(serde_json::from_str(&raw)?)
}

// =============================================================================
// Contention handling
// =============================================================================

/// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let by_code = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false);
            by_code || db_err.message().contains("database is locked")
        }
        _ => false,
    }
}

/// Re-runs `attempt` while it fails on store contention.
async fn retry_on_contention<T, F, Fut>(operation: &str, mut attempt: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Err(StoreError::Database(err)) if is_contention(&err) => {
                if tries >= MAX_CONTENTION_ATTEMPTS {
                    return Err(StoreError::ContentionExhausted {
                        attempts: tries,
                        message: err.to_string(),
                    });
                }
                tracing::debug!(operation, attempt = tries, error = %err, "Store contended, retrying");
                tokio::time::sleep(CONTENTION_BACKOFF * tries).await;
                tries += 1;
            }
            other => return other,
        }
    }
}
