//! Durable queue of local mutations awaiting push.
//!
//! Every local write produces one [`OutboxEntry`]. Entries are appended to
//! SQLite at enqueue time, so a crash between the local write and the push
//! loses nothing. An entry leaves the outbox in exactly two ways:
//!
//! - the server acknowledges it ([`Outbox::acknowledge`]), or
//! - it exceeds the retry ceiling and is dead-lettered ([`Outbox::mark_failed`]),
//!   where it stays visible through [`Outbox::failed_mutations`] until the
//!   application discards it.
//!
//! # Ordering
//!
//! Entries carry an autoincrement `seq` assigned at insert. `pull()` returns
//! pending entries in `seq` order, which is enqueue order, so the mutations
//! for one document always come out in the order they were made. A requeued
//! entry keeps its `seq` and therefore its place at the head of the queue.
//!
//! # Enqueue Notifications
//!
//! `enqueue()` publishes the collection path on a broadcast channel. The
//! coordinator listens and schedules a push for that collection.

use crate::error::{ReplicationError, Result};
use crate::local_store::Fields;
use crate::storage::execute_with_retry;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const ENQUEUE_CHANNEL_CAPACITY: usize = 256;

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Client-generated unique id.
    pub mutation_id: String,
    pub collection_path: String,
    pub operation: OperationKind,
    pub document_id: String,
    /// Field snapshot at the time of the write. `None` for deletes.
    pub payload: Option<Fields>,
    /// Unix millis.
    pub enqueued_at: i64,
    /// Failed deliveries so far.
    pub retry_count: u32,
}

impl OutboxEntry {
    /// New entry with a fresh v4 mutation id, stamped now.
    pub fn new(
        collection_path: impl Into<String>,
        operation: OperationKind,
        document_id: impl Into<String>,
        payload: Option<Fields>,
    ) -> Self {
        Self {
            mutation_id: uuid::Uuid::new_v4().to_string(),
            collection_path: collection_path.into(),
            operation,
            document_id: document_id.into(),
            payload,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
        }
    }

    pub fn create(collection_path: impl Into<String>, document_id: impl Into<String>, fields: Fields) -> Self {
        Self::new(collection_path, OperationKind::Create, document_id, Some(fields))
    }

    pub fn update(collection_path: impl Into<String>, document_id: impl Into<String>, fields: Fields) -> Self {
        Self::new(collection_path, OperationKind::Update, document_id, Some(fields))
    }

    pub fn delete(collection_path: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self::new(collection_path, OperationKind::Delete, document_id, None)
    }

    /// Override the generated mutation id.
    pub fn with_mutation_id(mut self, mutation_id: impl Into<String>) -> Self {
        self.mutation_id = mutation_id.into();
        self
    }
}

/// A dead-lettered mutation: retries exhausted, kept for the application to inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMutation {
    pub entry: OutboxEntry,
    /// Last rejection reason.
    pub reason: String,
    /// Unix millis.
    pub failed_at: i64,
}

type EntryRow = (String, String, String, String, Option<String>, i64, i64);
type FailedRow = (String, String, String, String, Option<String>, i64, i64, Option<String>, i64);

const ENTRY_COLUMNS: &str =
    "mutation_id, collection, operation, document_id, payload, enqueued_at, retry_count";

fn entry_from_row(row: EntryRow) -> Result<OutboxEntry> {
    let (mutation_id, collection_path, operation, document_id, payload, enqueued_at, retry_count) = row;

    let operation = OperationKind::parse(&operation).ok_or_else(|| {
        ReplicationError::Internal(format!("Unknown outbox operation '{}' for {}", operation, mutation_id))
    })?;

    let payload = match payload {
        Some(text) => Some(serde_json::from_str::<Fields>(&text).map_err(|e| {
            ReplicationError::Internal(format!("Corrupt outbox payload for {}: {}", mutation_id, e))
        })?),
        None => None,
    };

    Ok(OutboxEntry {
        mutation_id,
        collection_path,
        operation,
        document_id,
        payload,
        enqueued_at,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
    })
}

fn failed_from_row(row: FailedRow) -> Result<FailedMutation> {
    let (mutation_id, collection, operation, document_id, payload, enqueued_at, retry_count, last_error, failed_at) =
        row;
    let entry = entry_from_row((mutation_id, collection, operation, document_id, payload, enqueued_at, retry_count))?;
    Ok(FailedMutation {
        entry,
        reason: last_error.unwrap_or_default(),
        failed_at,
    })
}

/// SQLite-backed outbox shared by every collection.
pub struct Outbox {
    pool: SqlitePool,
    enqueued_tx: broadcast::Sender<String>,
}

impl Outbox {
    /// Build an outbox on an existing pool, creating the table if needed.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                mutation_id TEXT NOT NULL UNIQUE,
                collection TEXT NOT NULL,
                operation TEXT NOT NULL,
                document_id TEXT NOT NULL,
                payload TEXT,
                enqueued_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                failed_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS outbox_pending ON outbox (collection, failed_at, seq)")
            .execute(&pool)
            .await?;

        let (pending,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE failed_at IS NULL")
            .fetch_one(&pool)
            .await?;
        if pending > 0 {
            info!(pending, "Restored pending outbox entries from previous run");
        }

        let (enqueued_tx, _) = broadcast::channel(ENQUEUE_CHANNEL_CAPACITY);
        Ok(Self { pool, enqueued_tx })
    }

    /// Subscribe to enqueue notifications (payload: collection path).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.enqueued_tx.subscribe()
    }

    /// Append an entry durably.
    ///
    /// Enqueuing a mutation id that is already present is a no-op, so a
    /// caller retrying after a crash cannot create duplicates.
    pub async fn enqueue(&self, entry: OutboxEntry) -> Result<()> {
        let payload = entry
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ReplicationError::Internal(format!("Unserializable payload: {}", e)))?;
        let pool = &self.pool;

        let result = execute_with_retry("outbox_enqueue", || async {
            sqlx::query(
                r#"
                INSERT INTO outbox (mutation_id, collection, operation, document_id, payload, enqueued_at, retry_count)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(mutation_id) DO NOTHING
                "#,
            )
            .bind(&entry.mutation_id)
            .bind(&entry.collection_path)
            .bind(entry.operation.as_str())
            .bind(&entry.document_id)
            .bind(payload.as_deref())
            .bind(entry.enqueued_at)
            .bind(i64::from(entry.retry_count))
            .execute(pool)
            .await
        })
        .await?;

        if result.rows_affected() == 0 {
            debug!(mutation_id = %entry.mutation_id, "Mutation already enqueued");
            return Ok(());
        }

        debug!(
            collection = %entry.collection_path,
            mutation_id = %entry.mutation_id,
            operation = %entry.operation,
            document_id = %entry.document_id,
            "Mutation enqueued"
        );
        crate::metrics::record_outbox_enqueued(&entry.collection_path);

        // No receivers just means nobody is replicating this collection yet.
        let _ = self.enqueued_tx.send(entry.collection_path);
        Ok(())
    }

    /// Snapshot of up to `max_batch` pending entries, oldest first.
    ///
    /// Does not remove anything.
    pub async fn pull(&self, collection: &str, max_batch: usize) -> Result<Vec<OutboxEntry>> {
        let limit = i64::try_from(max_batch).unwrap_or(i64::MAX);
        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM outbox WHERE collection = ? AND failed_at IS NULL ORDER BY seq LIMIT ?",
            ENTRY_COLUMNS
        ))
        .bind(collection)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Look up a single entry, pending or failed.
    pub async fn get(&self, mutation_id: &str) -> Result<Option<OutboxEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM outbox WHERE mutation_id = ?",
            ENTRY_COLUMNS
        ))
        .bind(mutation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(entry_from_row).transpose()
    }

    /// Remove acknowledged entries. Unknown and dead-lettered ids are ignored.
    ///
    /// Returns how many rows were actually removed.
    pub async fn acknowledge(&self, mutation_ids: &[String]) -> Result<usize> {
        if mutation_ids.is_empty() {
            return Ok(0);
        }
        let pool = &self.pool;

        let removed = execute_with_retry("outbox_acknowledge", || async {
            let mut tx = pool.begin().await?;
            let mut removed = 0u64;
            for id in mutation_ids {
                removed += sqlx::query("DELETE FROM outbox WHERE mutation_id = ? AND failed_at IS NULL")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            tx.commit().await?;
            Ok::<u64, sqlx::Error>(removed)
        })
        .await?;

        debug!(requested = mutation_ids.len(), removed, "Acknowledged outbox entries");
        Ok(removed as usize)
    }

    /// Record a failed delivery and leave the entry in place.
    ///
    /// Returns the new retry count, or `None` if the entry is no longer pending.
    pub async fn requeue_on_failure(&self, mutation_id: &str, reason: &str) -> Result<Option<u32>> {
        let pool = &self.pool;

        let row: Option<(i64,)> = execute_with_retry("outbox_requeue", || async {
            sqlx::query_as(
                r#"
                UPDATE outbox
                SET retry_count = retry_count + 1, last_error = ?
                WHERE mutation_id = ? AND failed_at IS NULL
                RETURNING retry_count
                "#,
            )
            .bind(reason)
            .bind(mutation_id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        Ok(row.map(|(count,)| u32::try_from(count).unwrap_or(u32::MAX)))
    }

    /// Move an entry to the dead-letter state.
    pub async fn mark_failed(&self, mutation_id: &str, reason: &str) -> Result<Option<FailedMutation>> {
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let row: Option<FailedRow> = execute_with_retry("outbox_mark_failed", || async {
            sqlx::query_as(&format!(
                r#"
                UPDATE outbox
                SET failed_at = ?, last_error = ?
                WHERE mutation_id = ? AND failed_at IS NULL
                RETURNING {}, last_error, failed_at
                "#,
                ENTRY_COLUMNS
            ))
            .bind(now)
            .bind(reason)
            .bind(mutation_id)
            .fetch_optional(pool)
            .await
        })
        .await?;

        let failed = row.map(failed_from_row).transpose()?;
        if let Some(ref failed) = failed {
            error!(
                collection = %failed.entry.collection_path,
                mutation_id = %mutation_id,
                retry_count = failed.entry.retry_count,
                reason = %reason,
                "Mutation dead-lettered after exhausting retries"
            );
        }
        Ok(failed)
    }

    /// Dead-lettered mutations for a collection, oldest first.
    pub async fn failed_mutations(&self, collection: &str) -> Result<Vec<FailedMutation>> {
        let rows: Vec<FailedRow> = sqlx::query_as(&format!(
            "SELECT {}, last_error, failed_at FROM outbox WHERE collection = ? AND failed_at IS NOT NULL ORDER BY seq",
            ENTRY_COLUMNS
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(failed_from_row).collect()
    }

    /// Permanently drop dead-lettered mutations. Pending entries are untouched.
    pub async fn discard_failed(&self, mutation_ids: &[String]) -> Result<usize> {
        let pool = &self.pool;
        let mut removed = 0u64;
        for id in mutation_ids {
            removed += execute_with_retry("outbox_discard", || async {
                sqlx::query("DELETE FROM outbox WHERE mutation_id = ? AND failed_at IS NOT NULL")
                    .bind(id)
                    .execute(pool)
                    .await
            })
            .await?
            .rows_affected();
        }
        if removed > 0 {
            info!(removed, "Discarded dead-lettered mutations");
        }
        Ok(removed as usize)
    }

    /// Number of pending (not dead-lettered) entries for a collection.
    pub async fn pending_count(&self, collection: &str) -> Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE collection = ? AND failed_at IS NULL")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    /// Number of dead-lettered entries for a collection.
    pub async fn failed_count(&self, collection: &str) -> Result<usize> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM outbox WHERE collection = ? AND failed_at IS NOT NULL")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }
}
