//! Outbox draining and mutation delivery.
//!
//! A push pass reads pending entries in enqueue order, sends them in one
//! request per batch and reconciles the answer:
//!
//! | Server answer | Outbox effect |
//! |---------------|---------------|
//! | accepted | entry acknowledged (removed) |
//! | rejected | retry count + 1, entry stays at the head of the queue |
//! | neither | retry count + 1, same as a rejection |
//! | transport failure | batch left as is, resent after backoff |
//! | retry count > ceiling | entry dead-lettered and reported |
//!
//! # Per-Document Order
//!
//! A request carries at most one mutation per document. If the first
//! mutation of a document is rejected, the later ones wait behind it instead
//! of overtaking it in the same request.
//!
//! # Conflicts
//!
//! Last write wins. The engine never merges fields; a pushed mutation
//! overwrites whatever the server had, and documents the server sends back
//! as its own state overwrite the local copy.

use crate::error::{ReplicationError, Result};
use crate::local_store::LocalStore;
use crate::metrics;
use crate::outbox::{FailedMutation, Outbox, OutboxEntry};
use crate::remote::{PushResponse, Rejection, RemoteClient};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const FAILURE_CHANNEL_CAPACITY: usize = 256;

const UNANSWERED_REASON: &str = "no response from server";

/// Outcome of pushing one or more batches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReport {
    /// Mutation ids acknowledged.
    pub accepted: Vec<String>,
    pub rejected: Vec<Rejection>,
    /// Entries moved to the dead-letter set during this push.
    pub dead_lettered: Vec<FailedMutation>,
    /// Server-state documents written to the local store.
    pub reconciled: usize,
    /// Entries the server neither accepted nor rejected. They count against
    /// the retry ceiling like rejections.
    pub unresolved: usize,
}

impl PushReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.unresolved == 0
    }

    fn merge(&mut self, other: PushReport) {
        self.accepted.extend(other.accepted);
        self.rejected.extend(other.rejected);
        self.dead_lettered.extend(other.dead_lettered);
        self.reconciled += other.reconciled;
        self.unresolved += other.unresolved;
    }
}

/// Keep the first pending mutation of each document, preserving order.
pub fn partition_for_delivery(entries: Vec<OutboxEntry>) -> Vec<OutboxEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.document_id.clone()))
        .collect()
}

/// Sends outbox entries to the remote authority.
pub struct Pusher {
    remote: Arc<dyn RemoteClient>,
    outbox: Arc<Outbox>,
    store: Arc<dyn LocalStore>,
    batch_size: usize,
    max_retries: u32,
    failed_tx: broadcast::Sender<FailedMutation>,
}

impl Pusher {
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        outbox: Arc<Outbox>,
        store: Arc<dyn LocalStore>,
        batch_size: usize,
        max_retries: u32,
    ) -> Self {
        let (failed_tx, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            remote,
            outbox,
            store,
            batch_size: batch_size.max(1),
            max_retries,
            failed_tx,
        }
    }

    /// Notices for every dead-lettered mutation.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailedMutation> {
        self.failed_tx.subscribe()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Drain a collection's outbox until it is empty or a batch is not fully accepted.
    pub async fn push_pending(&self, collection: &str) -> Result<PushReport> {
        let start = Instant::now();
        let mut report = PushReport::default();

        let result = loop {
            let pending = match self.outbox.pull(collection, self.batch_size).await {
                Ok(pending) => pending,
                Err(e) => break Err(e),
            };
            if pending.is_empty() {
                break Ok(());
            }

            let pulled = pending.len();
            let batch = partition_for_delivery(pending);
            let deferred = pulled - batch.len();

            let part = match self.push_changes(collection, &batch).await {
                Ok(part) => part,
                Err(e) => break Err(e),
            };

            let progressed = !part.accepted.is_empty() && part.is_clean();
            report.merge(part);

            if !progressed || (pulled < self.batch_size && deferred == 0) {
                break Ok(());
            }
            debug!(collection = %collection, pulled, deferred, "Pushing next outbox batch");
        };

        metrics::record_push_pass(collection, report.accepted.len(), report.rejected.len(), start.elapsed());
        if let Ok(depth) = self.outbox.pending_count(collection).await {
            metrics::set_outbox_depth(collection, depth);
        }

        result?;

        if !report.accepted.is_empty() || !report.rejected.is_empty() {
            info!(
                collection = %collection,
                accepted = report.accepted.len(),
                rejected = report.rejected.len(),
                dead_lettered = report.dead_lettered.len(),
                "Push pass complete"
            );
        }
        Ok(report)
    }

    /// Send one batch as a single request and reconcile the response.
    ///
    /// On a transport failure the entries stay queued untouched and the error
    /// is returned; the caller's backoff paces the resend. Retry counts only
    /// move on a server answer.
    pub async fn push_changes(&self, collection: &str, entries: &[OutboxEntry]) -> Result<PushReport> {
        if entries.is_empty() {
            return Ok(PushReport::default());
        }

        let response = match self.remote.send_mutations(collection, entries).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    collection = %collection,
                    entries = entries.len(),
                    error = %e,
                    "Push request failed, batch stays queued"
                );
                return Err(e);
            }
        };

        self.reconcile(collection, entries, response).await
    }

    async fn reconcile(&self, collection: &str, entries: &[OutboxEntry], response: PushResponse) -> Result<PushReport> {
        let sent: HashSet<&str> = entries.iter().map(|e| e.mutation_id.as_str()).collect();
        let mut report = PushReport::default();

        let accepted: Vec<String> = response
            .accepted
            .into_iter()
            .filter(|id| {
                let known = sent.contains(id.as_str());
                if !known {
                    warn!(collection = %collection, mutation_id = %id, "Server accepted a mutation that was not sent");
                }
                known
            })
            .collect();
        self.outbox.acknowledge(&accepted).await?;

        for rejection in &response.rejected {
            if !sent.contains(rejection.mutation_id.as_str()) {
                warn!(collection = %collection, mutation_id = %rejection.mutation_id, "Server rejected a mutation that was not sent");
                continue;
            }
            let err = ReplicationError::ServerRejection {
                mutation_id: rejection.mutation_id.clone(),
                reason: rejection.reason.clone(),
            };
            warn!(collection = %collection, error = %err, "Mutation rejected");

            if let Some(failed) = self.record_failure(&rejection.mutation_id, &rejection.reason).await? {
                report.dead_lettered.push(failed);
            }
            report.rejected.push(rejection.clone());
        }

        let resolved: HashSet<&str> = accepted
            .iter()
            .map(String::as_str)
            .chain(report.rejected.iter().map(|r| r.mutation_id.as_str()))
            .collect();
        let mut unresolved: Vec<&str> = sent.difference(&resolved).copied().collect();
        unresolved.sort_unstable();
        report.unresolved = unresolved.len();
        if report.unresolved > 0 {
            warn!(collection = %collection, unresolved = report.unresolved, "Push response left mutations unanswered");
        }
        for id in unresolved {
            if let Some(failed) = self.record_failure(id, UNANSWERED_REASON).await? {
                report.dead_lettered.push(failed);
            }
        }

        for change in response.server_state {
            let applied = if change.deleted {
                self.store.apply_delete(collection, &change.document_id).await
            } else {
                self.store.upsert(collection, &change.document_id, change.fields).await
            };
            match applied {
                Ok(()) => report.reconciled += 1,
                Err(e) => {
                    metrics::record_apply_failure(collection);
                    warn!(
                        collection = %collection,
                        document_id = %change.document_id,
                        error = %e,
                        "Failed to apply server state"
                    );
                }
            }
        }

        self.publish_dead(collection, &report.dead_lettered);
        report.accepted = accepted;
        Ok(report)
    }

    /// Bump the retry count; dead-letter once it passes the ceiling.
    async fn record_failure(&self, mutation_id: &str, reason: &str) -> Result<Option<FailedMutation>> {
        match self.outbox.requeue_on_failure(mutation_id, reason).await? {
            Some(count) if count > self.max_retries => self.outbox.mark_failed(mutation_id, reason).await,
            Some(count) => {
                debug!(mutation_id = %mutation_id, retry_count = count, "Mutation requeued");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn publish_dead(&self, collection: &str, dead: &[FailedMutation]) {
        if dead.is_empty() {
            return;
        }
        metrics::record_dead_lettered(collection, dead.len());
        for failed in dead {
            // No subscribers is fine; failures stay queryable in the outbox.
            let _ = self.failed_tx.send(failed.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use crate::config::StorageConfig;
    use crate::local_store::{Fields, MemoryStore};
    use crate::remote::{PullBatch, RemoteChange, RemoteFuture};
    use crate::storage::open_pool;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    /// Replays scripted push responses and records each request's mutation ids.
    #[derive(Default)]
    struct ScriptedRemote {
        responses: Mutex<VecDeque<Result<PushResponse>>>,
        sent: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRemote {
        fn new(responses: Vec<Result<PushResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Vec<String>> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl RemoteClient for ScriptedRemote {
        fn fetch_changes<'a>(
            &'a self,
            _collection: &'a str,
            _checkpoint: Option<&'a Checkpoint>,
            _max_batch: usize,
        ) -> RemoteFuture<'a, PullBatch> {
            Box::pin(async { Ok(PullBatch::default()) })
        }

        fn send_mutations<'a>(&'a self, _collection: &'a str, entries: &'a [OutboxEntry]) -> RemoteFuture<'a, PushResponse> {
            let ids: Vec<String> = entries.iter().map(|e| e.mutation_id.clone()).collect();
            self.sent.lock().unwrap().push(ids.clone());
            // Accept everything unless scripted otherwise
            let next = self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(PushResponse {
                    accepted: ids,
                    ..Default::default()
                })
            });
            Box::pin(async move { next })
        }
    }

    async fn outbox() -> Arc<Outbox> {
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        Arc::new(Outbox::with_pool(pool).await.unwrap())
    }

    fn accepted(ids: &[&str]) -> Result<PushResponse> {
        Ok(PushResponse {
            accepted: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_accepted_push_empties_outbox() {
        let outbox = outbox().await;
        outbox
            .enqueue(OutboxEntry::create("users", "5", fields(json!({"name": "A"}))).with_mutation_id("m1"))
            .await
            .unwrap();
        let remote = ScriptedRemote::new(vec![]);
        let pusher = Pusher::new(remote.clone(), outbox.clone(), Arc::new(MemoryStore::new()), 100, 5);

        let report = pusher.push_pending("users").await.unwrap();

        assert_eq!(report.accepted, vec!["m1".to_string()]);
        assert!(report.is_clean());
        assert_eq!(outbox.pending_count("users").await.unwrap(), 0);
        assert_eq!(remote.sent(), vec![vec!["m1".to_string()]]);
    }

    #[tokio::test]
    async fn test_partial_rejection_requeues_rejected_only() {
        let outbox = outbox().await;
        outbox
            .enqueue(OutboxEntry::create("users", "1", fields(json!({"n": 1}))).with_mutation_id("m1"))
            .await
            .unwrap();
        outbox
            .enqueue(OutboxEntry::create("users", "2", fields(json!({"n": 2}))).with_mutation_id("m2"))
            .await
            .unwrap();
        let remote = ScriptedRemote::new(vec![Ok(PushResponse {
            accepted: vec!["m1".to_string()],
            rejected: vec![Rejection {
                mutation_id: "m2".to_string(),
                reason: "conflict".to_string(),
            }],
            server_state: vec![],
        })]);
        let pusher = Pusher::new(remote, outbox.clone(), Arc::new(MemoryStore::new()), 100, 5);

        let report = pusher.push_pending("users").await.unwrap();

        assert_eq!(report.rejected.len(), 1);
        let remaining = outbox.pull("users", 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].mutation_id, "m2");
        assert_eq!(remaining[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_batch_untouched() {
        let outbox = outbox().await;
        for (id, doc) in [("m1", "1"), ("m2", "2")] {
            outbox.enqueue(OutboxEntry::delete("users", doc).with_mutation_id(id)).await.unwrap();
        }
        let failures: Vec<Result<PushResponse>> = (0..10)
            .map(|_| Err(ReplicationError::transport_msg("push", "HTTP 502")))
            .collect();
        let remote = ScriptedRemote::new(failures);
        let pusher = Pusher::new(remote, outbox.clone(), Arc::new(MemoryStore::new()), 100, 1);

        for _ in 0..10 {
            assert!(pusher.push_pending("users").await.is_err());
        }

        let remaining = outbox.pull("users", 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e.retry_count == 0));
        assert_eq!(outbox.failed_count("users").await.unwrap(), 0);

        // Transport back: the whole batch goes through.
        let report = pusher.push_pending("users").await.unwrap();
        assert_eq!(report.accepted.len(), 2);
        assert_eq!(outbox.pending_count("users").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_mutation_counts_toward_ceiling() {
        let outbox = outbox().await;
        outbox
            .enqueue(OutboxEntry::update("users", "1", fields(json!({"n": 1}))).with_mutation_id("m1"))
            .await
            .unwrap();
        let silent: Vec<Result<PushResponse>> = (0..20).map(|_| Ok(PushResponse::default())).collect();
        let remote = ScriptedRemote::new(silent);
        let pusher = Pusher::new(remote.clone(), outbox.clone(), Arc::new(MemoryStore::new()), 100, 2);
        let mut failures = pusher.subscribe_failures();

        let first = pusher.push_pending("users").await.unwrap();
        assert_eq!(first.unresolved, 1);
        assert_eq!(outbox.get("m1").await.unwrap().unwrap().retry_count, 1);

        pusher.push_pending("users").await.unwrap();
        let report = pusher.push_pending("users").await.unwrap();

        assert_eq!(report.dead_lettered.len(), 1);
        assert_eq!(report.dead_lettered[0].reason, "no response from server");
        assert_eq!(outbox.pending_count("users").await.unwrap(), 0);
        assert_eq!(failures.try_recv().unwrap().entry.mutation_id, "m1");

        // Dead-lettered: later passes send nothing.
        pusher.push_pending("users").await.unwrap();
        assert_eq!(remote.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling_dead_letters() {
        let outbox = outbox().await;
        outbox
            .enqueue(OutboxEntry::update("users", "1", fields(json!({"n": 1}))).with_mutation_id("m1"))
            .await
            .unwrap();
        let reject = || -> Result<PushResponse> {
            Ok(PushResponse {
                rejected: vec![Rejection {
                    mutation_id: "m1".to_string(),
                    reason: "forbidden".to_string(),
                }],
                ..Default::default()
            })
        };
        let remote = ScriptedRemote::new(vec![reject(), reject(), reject()]);
        let pusher = Pusher::new(remote, outbox.clone(), Arc::new(MemoryStore::new()), 100, 2);
        let mut failures = pusher.subscribe_failures();

        assert!(pusher.push_pending("users").await.unwrap().dead_lettered.is_empty());
        assert!(pusher.push_pending("users").await.unwrap().dead_lettered.is_empty());
        let report = pusher.push_pending("users").await.unwrap();

        assert_eq!(report.dead_lettered.len(), 1);
        assert_eq!(report.dead_lettered[0].reason, "forbidden");
        assert_eq!(outbox.pending_count("users").await.unwrap(), 0);
        assert_eq!(outbox.failed_mutations("users").await.unwrap().len(), 1);
        assert_eq!(failures.try_recv().unwrap().entry.mutation_id, "m1");
    }

    #[tokio::test]
    async fn test_one_mutation_per_document_per_request() {
        let outbox = outbox().await;
        outbox
            .enqueue(OutboxEntry::create("users", "5", fields(json!({"v": 1}))).with_mutation_id("a1"))
            .await
            .unwrap();
        outbox
            .enqueue(OutboxEntry::update("users", "5", fields(json!({"v": 2}))).with_mutation_id("a2"))
            .await
            .unwrap();
        outbox
            .enqueue(OutboxEntry::create("users", "6", fields(json!({"v": 1}))).with_mutation_id("b1"))
            .await
            .unwrap();
        let remote = ScriptedRemote::new(vec![]);
        let pusher = Pusher::new(remote.clone(), outbox.clone(), Arc::new(MemoryStore::new()), 100, 5);

        pusher.push_pending("users").await.unwrap();

        assert_eq!(
            remote.sent(),
            vec![
                vec!["a1".to_string(), "b1".to_string()],
                vec!["a2".to_string()]
            ]
        );
        assert_eq!(outbox.pending_count("users").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rejected_head_blocks_later_mutation_of_same_document() {
        let outbox = outbox().await;
        outbox.enqueue(OutboxEntry::delete("users", "5").with_mutation_id("a1")).await.unwrap();
        outbox
            .enqueue(OutboxEntry::create("users", "5", fields(json!({"v": 2}))).with_mutation_id("a2"))
            .await
            .unwrap();
        let remote = ScriptedRemote::new(vec![Ok(PushResponse {
            rejected: vec![Rejection {
                mutation_id: "a1".to_string(),
                reason: "busy".to_string(),
            }],
            ..Default::default()
        })]);
        let pusher = Pusher::new(remote.clone(), outbox.clone(), Arc::new(MemoryStore::new()), 100, 5);

        pusher.push_pending("users").await.unwrap();

        assert_eq!(remote.sent(), vec![vec!["a1".to_string()]]);
        assert_eq!(outbox.pending_count("users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_server_state_overwrites_local() {
        let outbox = outbox().await;
        outbox
            .enqueue(OutboxEntry::update("users", "5", fields(json!({"name": "mine"}))).with_mutation_id("m1"))
            .await
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        store.upsert("users", "5", fields(json!({"name": "mine"}))).await.unwrap();
        let remote = ScriptedRemote::new(vec![Ok(PushResponse {
            rejected: vec![Rejection {
                mutation_id: "m1".to_string(),
                reason: "conflict".to_string(),
            }],
            server_state: vec![RemoteChange {
                document_id: "5".to_string(),
                collection_path: "users".to_string(),
                fields: fields(json!({"name": "theirs"})),
                deleted: false,
                server_checkpoint: Checkpoint::from(4u64),
            }],
            ..Default::default()
        })]);
        let pusher = Pusher::new(remote, outbox, store.clone(), 100, 5);

        let report = pusher.push_pending("users").await.unwrap();

        assert_eq!(report.reconciled, 1);
        assert_eq!(store.get("users", "5").await, Some(fields(json!({"name": "theirs"}))));
    }

    #[tokio::test]
    async fn test_empty_outbox_sends_nothing() {
        let remote = ScriptedRemote::new(vec![accepted(&["x"])]);
        let pusher = Pusher::new(remote.clone(), outbox().await, Arc::new(MemoryStore::new()), 100, 5);

        let report = pusher.push_pending("users").await.unwrap();
        assert_eq!(report, PushReport::default());
        assert!(remote.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_ids_in_response_are_ignored() {
        let outbox = outbox().await;
        outbox.enqueue(OutboxEntry::delete("users", "1").with_mutation_id("m1")).await.unwrap();
        let remote = ScriptedRemote::new(vec![accepted(&["m1", "ghost"])]);
        let pusher = Pusher::new(remote, outbox.clone(), Arc::new(MemoryStore::new()), 100, 5);

        let report = pusher.push_pending("users").await.unwrap();
        assert_eq!(report.accepted, vec!["m1".to_string()]);
    }

    #[test]
    fn test_partition_for_delivery() {
        let entries = vec![
            OutboxEntry::delete("users", "1").with_mutation_id("a"),
            OutboxEntry::delete("users", "2").with_mutation_id("b"),
            OutboxEntry::delete("users", "1").with_mutation_id("c"),
        ];
        let ids: Vec<String> = partition_for_delivery(entries).into_iter().map(|e| e.mutation_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
