//! Scripted remote authority for integration tests.
//!
//! Keeps a per-collection document table with a global version counter, so
//! pulls behave like a real change feed: every write bumps the document's
//! version and `fetch_changes` returns documents newer than the checkpoint in
//! version order.
//!
//! Failure injection:
//! - `fail_next_fetches(n)` / `fail_next_pushes(n)`: transport errors
//! - `reject_document(id, reason)`: every push for that document is rejected
//! - `script_push(response)`: hand back an exact response once
//! - `set_fetch_delay` / `set_push_delay`: slow requests, for races

use replica_sync::remote::RemoteFuture;
use replica_sync::{
    Checkpoint, Fields, OperationKind, OutboxEntry, PullBatch, PushResponse, Rejection, RemoteChange, RemoteClient,
    ReplicationError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct ServerDoc {
    fields: Fields,
    deleted: bool,
    version: u64,
}

#[derive(Default)]
struct ServerState {
    version: u64,
    collections: HashMap<String, HashMap<String, ServerDoc>>,
    rejections: HashMap<String, String>,
    scripted_pushes: VecDeque<PushResponse>,
    pushed: Vec<OutboxEntry>,
    fail_fetches: usize,
    fail_pushes: usize,
    fetch_delay: Duration,
    push_delay: Duration,
}

impl ServerState {
    fn write(&mut self, collection: &str, document_id: &str, fields: Fields, deleted: bool) -> u64 {
        self.version += 1;
        let version = self.version;
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(document_id.to_string(), ServerDoc { fields, deleted, version });
        version
    }
}

/// In-memory stand-in for the replication endpoints.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<ServerState>,
    fetches: AtomicUsize,
    pushes: AtomicUsize,
    in_flight_fetches: AtomicUsize,
    max_concurrent_fetches: AtomicUsize,
    /// Signalled when a push request arrives (before any delay).
    pub push_started: Notify,
    /// Signalled when a fetch request arrives (before any delay).
    pub fetch_started: Notify,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }

    /// A write by some other client. Returns the new version.
    pub fn server_put(&self, collection: &str, document_id: &str, fields: Fields) -> u64 {
        self.state().write(collection, document_id, fields, false)
    }

    /// A write that lands at an exact version. Later writes continue from it.
    pub fn server_put_at(&self, collection: &str, document_id: &str, fields: Fields, version: u64) {
        let mut state = self.state();
        state.version = version.saturating_sub(1);
        state.write(collection, document_id, fields, false);
    }

    pub fn server_delete(&self, collection: &str, document_id: &str) -> u64 {
        self.state().write(collection, document_id, Fields::new(), true)
    }

    /// Current server copy of a live document.
    pub fn document(&self, collection: &str, document_id: &str) -> Option<Fields> {
        self.state()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(document_id))
            .filter(|doc| !doc.deleted)
            .map(|doc| doc.fields.clone())
    }

    pub fn reject_document(&self, document_id: &str, reason: &str) {
        self.state().rejections.insert(document_id.to_string(), reason.to_string());
    }

    pub fn clear_rejections(&self) {
        self.state().rejections.clear();
    }

    pub fn script_push(&self, response: PushResponse) {
        self.state().scripted_pushes.push_back(response);
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.state().fail_fetches = n;
    }

    pub fn fail_next_pushes(&self, n: usize) {
        self.state().fail_pushes = n;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state().fetch_delay = delay;
    }

    pub fn set_push_delay(&self, delay: Duration) {
        self.state().push_delay = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches.load(Ordering::SeqCst)
    }

    /// Every mutation received, in arrival order.
    pub fn pushed(&self) -> Vec<OutboxEntry> {
        self.state().pushed.clone()
    }

    fn changes_since(&self, collection: &str, checkpoint: Option<&Checkpoint>, max_batch: usize) -> PullBatch {
        let since: u64 = checkpoint.and_then(|cp| cp.as_str().parse().ok()).unwrap_or(0);
        let state = self.state();
        let mut changes: Vec<RemoteChange> = state
            .collections
            .get(collection)
            .into_iter()
            .flat_map(|docs| docs.iter())
            .filter(|(_, doc)| doc.version > since)
            .map(|(id, doc)| RemoteChange {
                document_id: id.clone(),
                collection_path: collection.to_string(),
                fields: doc.fields.clone(),
                deleted: doc.deleted,
                server_checkpoint: Checkpoint::from(doc.version),
            })
            .collect();
        changes.sort_by_key(|c| c.server_checkpoint.as_str().parse::<u64>().unwrap_or(0));
        changes.truncate(max_batch);

        let next_checkpoint = changes.last().map(|c| c.server_checkpoint.clone());
        PullBatch { changes, next_checkpoint }
    }

    fn accept(&self, collection: &str, entries: &[OutboxEntry]) -> PushResponse {
        let mut state = self.state();
        state.pushed.extend(entries.iter().cloned());

        if let Some(scripted) = state.scripted_pushes.pop_front() {
            return scripted;
        }

        let mut response = PushResponse::default();
        for entry in entries {
            if let Some(reason) = state.rejections.get(&entry.document_id).cloned() {
                response.rejected.push(Rejection {
                    mutation_id: entry.mutation_id.clone(),
                    reason,
                });
                continue;
            }
            let deleted = entry.operation == OperationKind::Delete;
            let fields = entry.payload.clone().unwrap_or_default();
            state.write(collection, &entry.document_id, fields, deleted);
            response.accepted.push(entry.mutation_id.clone());
        }
        response
    }
}

impl RemoteClient for MockRemote {
    fn fetch_changes<'a>(
        &'a self,
        collection: &'a str,
        checkpoint: Option<&'a Checkpoint>,
        max_batch: usize,
    ) -> RemoteFuture<'a, PullBatch> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.fetch_started.notify_waiters();
            let in_flight = self.in_flight_fetches.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_fetches.fetch_max(in_flight, Ordering::SeqCst);

            let (fail, delay) = {
                let mut state = self.state();
                let fail = state.fail_fetches > 0;
                if fail {
                    state.fail_fetches -= 1;
                }
                (fail, state.fetch_delay)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result = if fail {
                Err(ReplicationError::transport_msg("pull", "connection reset"))
            } else {
                Ok(self.changes_since(collection, checkpoint, max_batch))
            };
            self.in_flight_fetches.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn send_mutations<'a>(&'a self, collection: &'a str, entries: &'a [OutboxEntry]) -> RemoteFuture<'a, PushResponse> {
        Box::pin(async move {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            self.push_started.notify_waiters();

            let (fail, delay) = {
                let mut state = self.state();
                let fail = state.fail_pushes > 0;
                if fail {
                    state.fail_pushes -= 1;
                }
                (fail, state.push_delay)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if fail {
                return Err(ReplicationError::transport_msg("push", "503 Service Unavailable"));
            }
            Ok(self.accept(collection, entries))
        })
    }
}
