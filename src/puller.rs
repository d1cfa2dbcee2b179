//! Checkpoint-based pulling of remote changes.
//!
//! One pull pass drains the server's backlog for a collection:
//!
//! ```text
//! loop:
//!   fetch(cp, batch_size) ─► validate ─► apply each change ─► persist next cp
//!   stop when the batch is short, empty, or something failed to apply
//! ```
//!
//! # Partial Application
//!
//! A change the local store refuses is skipped and reported, and the rest of
//! the batch is still applied. The checkpoint then only advances to the last
//! clean change *before* the first failure (and strictly below the failed
//! change's position), so the next pass re-fetches from the failure onward.
//! Changes after the failure are applied twice; upserts are idempotent.
//!
//! # Errors
//!
//! Transport errors and malformed batches abort the pass without touching
//! the checkpoint. A checkpoint that fails to persist also aborts the pass.

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{ReplicationError, Result};
use crate::local_store::LocalStore;
use crate::metrics;
use crate::remote::{PullBatch, RemoteChange, RemoteClient};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A change the local store failed to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyFailure {
    pub document_id: String,
    pub checkpoint: Checkpoint,
    pub error: String,
}

/// Outcome of one pull pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullReport {
    /// Changes written to the local store.
    pub applied: usize,
    pub failures: Vec<ApplyFailure>,
    /// Batches fetched.
    pub batches: usize,
    /// Checkpoint after the pass (persisted).
    pub checkpoint: Option<Checkpoint>,
}

impl PullReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Fetches and applies remote changes for collections.
pub struct Puller {
    remote: Arc<dyn RemoteClient>,
    store: Arc<dyn LocalStore>,
    checkpoints: Arc<CheckpointStore>,
    batch_size: usize,
}

impl Puller {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        store: Arc<dyn LocalStore>,
        checkpoints: Arc<CheckpointStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            remote,
            store,
            checkpoints,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Pull from the collection's persisted checkpoint.
    pub async fn pull_collection(&self, collection: &str) -> Result<PullReport> {
        let checkpoint = self.checkpoints.get(collection).await;
        self.pull_changes(collection, checkpoint).await
    }

    /// Pull everything newer than `checkpoint`, persisting progress per batch.
    pub async fn pull_changes(&self, collection: &str, checkpoint: Option<Checkpoint>) -> Result<PullReport> {
        let start = Instant::now();
        let mut report = PullReport {
            checkpoint: checkpoint.clone(),
            ..Default::default()
        };
        let mut current = checkpoint;

        loop {
            let batch = self
                .remote
                .fetch_changes(collection, current.as_ref(), self.batch_size)
                .await?;
            report.batches += 1;

            validate_batch(collection, current.as_ref(), &batch)?;

            let fetched = batch.changes.len();
            if fetched == 0 {
                debug!(collection = %collection, "Pull caught up");
                break;
            }

            let outcome = self.apply_batch(collection, &batch.changes).await;
            report.applied += outcome.applied;

            let next = match outcome.failures.first() {
                None => Some(trailing_checkpoint(&batch)),
                Some(first) => outcome
                    .clean_before_failure
                    .filter(|cp| cp < &first.checkpoint),
            };

            if let Some(next) = next {
                if current.as_ref().map_or(true, |cur| next.is_after(cur)) {
                    self.checkpoints.set(collection, &next).await?;
                    current = Some(next);
                }
            }

            let failed = !outcome.failures.is_empty();
            report.failures.extend(outcome.failures);

            if failed {
                warn!(
                    collection = %collection,
                    failures = report.failures.len(),
                    checkpoint = ?current,
                    "Pull pass stopped at a document that failed to apply"
                );
                break;
            }
            if fetched < self.batch_size {
                break;
            }
            debug!(collection = %collection, fetched, "Full batch, pulling again");
        }

        report.checkpoint = current;
        metrics::record_pull_pass(collection, report.applied, report.failures.len(), start.elapsed());

        if report.applied > 0 || !report.failures.is_empty() {
            info!(
                collection = %collection,
                applied = report.applied,
                failed = report.failures.len(),
                batches = report.batches,
                checkpoint = ?report.checkpoint,
                "Pull pass complete"
            );
        }

        Ok(report)
    }

    async fn apply_batch(&self, collection: &str, changes: &[RemoteChange]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for change in changes {
            let result = if change.deleted {
                self.store.apply_delete(collection, &change.document_id).await
            } else {
                self.store
                    .upsert(collection, &change.document_id, change.fields.clone())
                    .await
            };

            match result {
                Ok(()) => {
                    outcome.applied += 1;
                    if outcome.failures.is_empty() {
                        outcome.clean_before_failure = Some(change.server_checkpoint.clone());
                    }
                }
                Err(e) => {
                    metrics::record_apply_failure(collection);
                    warn!(
                        collection = %collection,
                        document_id = %change.document_id,
                        checkpoint = %change.server_checkpoint,
                        error = %e,
                        "Failed to apply remote change"
                    );
                    outcome.failures.push(ApplyFailure {
                        document_id: change.document_id.clone(),
                        checkpoint: change.server_checkpoint.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        outcome
    }
}

#[derive(Default)]
struct BatchOutcome {
    applied: usize,
    failures: Vec<ApplyFailure>,
    /// Checkpoint of the last change applied before the first failure.
    clean_before_failure: Option<Checkpoint>,
}

/// Highest position covered by a non-empty, validated batch.
fn trailing_checkpoint(batch: &PullBatch) -> Checkpoint {
    let last = batch.changes.last().map(|c| c.server_checkpoint.clone());
    match (batch.next_checkpoint.clone(), last) {
        (Some(next), Some(last)) => next.max(last),
        (Some(next), None) => next,
        (None, Some(last)) => last,
        (None, None) => Checkpoint::new(""),
    }
}

/// Reject batches that would move the checkpoint backwards or mix collections.
pub(crate) fn validate_batch(collection: &str, current: Option<&Checkpoint>, batch: &PullBatch) -> Result<()> {
    let mut previous: Option<&Checkpoint> = None;

    for change in &batch.changes {
        if change.collection_path != collection {
            return Err(ReplicationError::Protocol(format!(
                "Pull for '{}' returned document '{}' of collection '{}'",
                collection, change.document_id, change.collection_path
            )));
        }
        if let Some(cur) = current {
            if !change.server_checkpoint.is_after(cur) {
                return Err(ReplicationError::Protocol(format!(
                    "Change '{}' at checkpoint {} is not newer than {}",
                    change.document_id, change.server_checkpoint, cur
                )));
            }
        }
        if let Some(prev) = previous {
            if change.server_checkpoint < *prev {
                return Err(ReplicationError::Protocol(format!(
                    "Changes out of order: {} after {}",
                    change.server_checkpoint, prev
                )));
            }
        }
        previous = Some(&change.server_checkpoint);
    }

    if let (Some(next), Some(last)) = (&batch.next_checkpoint, previous) {
        if next < last {
            return Err(ReplicationError::Protocol(format!(
                "Batch cursor {} is behind its last change {}",
                next, last
            )));
        }
    }

    Ok(())
}
