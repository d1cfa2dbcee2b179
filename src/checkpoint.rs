// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull checkpoint persistence.
//!
//! Stores the last-applied server checkpoint for each collection in SQLite,
//! so a restarted client resumes pulling where it left off instead of
//! re-downloading the collection.
//!
//! # Write-Through
//!
//! `set()` persists the row first and only then updates the in-memory cache.
//! If the write fails the cache keeps the previous value: a checkpoint that
//! never reached disk is never handed out by `get()`, so a restart cannot
//! skip changes that were reported as applied but never recorded.
//!
//! Writers are serialized by holding the cache write lock across the
//! database write. Combined with the coordinator's one-pull-per-collection
//! rule this gives a single writer per collection.
//!
//! ## Checkpoint Semantics
//!
//! The stored value is the checkpoint of the **last cleanly applied** change.
//! The next pull asks for changes strictly newer than it.
//!
//! ```text
//! fetch (cp > 10) → apply 11, 12, 13 → persist 13
//!                   (crash here = re-fetch 11..13, upserts are idempotent)
//! ```

use crate::config::StorageConfig;
use crate::error::{ReplicationError, Result};
use crate::storage::{execute_with_retry, open_pool, wal_checkpoint};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::sqlite::SqlitePool;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Opaque, ordered pull cursor issued by the server.
///
/// Servers hand out either integers (timestamps, sequence numbers) or
/// sortable strings. All-digit values compare numerically, with any length;
/// everything else compares byte-wise and sorts after the numeric values.
/// This keeps the order total even if a server mixes both forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Checkpoint(String);

impl Checkpoint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` is strictly newer than `other`.
    pub fn is_after(&self, other: &Checkpoint) -> bool {
        self > other
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Checkpoint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Checkpoint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<u64> for Checkpoint {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for Checkpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Unsigned(u64),
            Signed(i64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Unsigned(n) => Checkpoint(n.to_string()),
            Raw::Signed(n) => Checkpoint(n.to_string()),
            Raw::Text(s) => Checkpoint(s),
        })
    }
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Compare two raw checkpoint strings.
pub fn compare_checkpoints(a: &str, b: &str) -> Ordering {
    match (is_numeric(a), is_numeric(b)) {
        (true, true) => {
            let a_digits = a.trim_start_matches('0');
            let b_digits = b.trim_start_matches('0');
            a_digits
                .len()
                .cmp(&b_digits.len())
                .then_with(|| a_digits.cmp(b_digits))
                // "007" and "7" are the same position; keep Ord consistent with Eq
                .then_with(|| a.cmp(b))
        }
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.cmp(b),
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_checkpoints(&self.0, &other.0)
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Persistent checkpoint storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    /// In-memory cache for fast reads. Only ever holds persisted values.
    cache: RwLock<HashMap<String, Checkpoint>>,
    path: String,
}

impl CheckpointStore {
    /// Open (or create) a checkpoint store at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let config = StorageConfig::at_path(path);
        let pool = open_pool(&config).await?;
        Self::with_pool(pool, config.sqlite_path).await
    }

    /// Build a store on an existing pool (shared with the outbox).
    ///
    /// Creates the table if needed and loads existing checkpoints.
    pub async fn with_pool(pool: SqlitePool, path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        info!(path = %path, "Initializing checkpoint store");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                collection TEXT PRIMARY KEY,
                checkpoint TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT collection, checkpoint FROM checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (collection, checkpoint) in rows {
            debug!(collection = %collection, checkpoint = %checkpoint, "Loaded checkpoint from disk");
            cache.insert(collection, Checkpoint(checkpoint));
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            path,
        })
    }

    /// Last persisted checkpoint for a collection.
    ///
    /// Returns `None` before the first successful pull.
    pub async fn get(&self, collection: &str) -> Option<Checkpoint> {
        self.cache.read().await.get(collection).cloned()
    }

    /// Persist a new checkpoint for a collection.
    ///
    /// The checkpoint only moves forward: setting an older value is rejected,
    /// setting the current value is a no-op. On error nothing changes.
    pub async fn set(&self, collection: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut cache = self.cache.write().await;

        if let Some(current) = cache.get(collection) {
            match checkpoint.cmp(current) {
                Ordering::Equal => return Ok(()),
                Ordering::Less => {
                    return Err(ReplicationError::InvalidState {
                        expected: format!("checkpoint >= {}", current),
                        actual: checkpoint.to_string(),
                    });
                }
                Ordering::Greater => {}
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let result = execute_with_retry("checkpoint_set", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (collection, checkpoint, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(collection) DO UPDATE SET
                    checkpoint = excluded.checkpoint,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(collection)
            .bind(checkpoint.as_str())
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        match result {
            Ok(_) => {
                cache.insert(collection.to_string(), checkpoint.clone());
                crate::metrics::record_checkpoint_persist(collection, true);
                debug!(collection = %collection, checkpoint = %checkpoint, "Checkpoint persisted");
                Ok(())
            }
            Err(e) => {
                crate::metrics::record_checkpoint_persist(collection, false);
                warn!(collection = %collection, error = %e, "Failed to persist checkpoint");
                Err(e.into())
            }
        }
    }

    /// Forget the checkpoint for a collection; the next pull starts from scratch.
    pub async fn delete(&self, collection: &str) -> Result<()> {
        let mut cache = self.cache.write().await;
        let pool = &self.pool;

        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE collection = ?")
                .bind(collection)
                .execute(pool)
                .await
        })
        .await?;

        cache.remove(collection);
        info!(collection = %collection, "Deleted checkpoint");
        Ok(())
    }

    /// All checkpoints (for diagnostics).
    pub async fn get_all(&self) -> HashMap<String, Checkpoint> {
        self.cache.read().await.clone()
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint_wal(&self) -> Result<()> {
        wal_checkpoint(&self.pool).await
    }

    /// Checkpoint WAL and close the underlying pool.
    ///
    /// The pool is shared with the outbox; close this last.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}
