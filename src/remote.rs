//! Remote authority interface.
//!
//! The engine talks to the server through two traits:
//!
//! - [`RemoteClient`]: request/response pull and push
//! - [`EventSource`] / [`EventStream`]: the long-lived notification session
//!
//! [`crate::http::HttpRemoteClient`] and [`crate::realtime::SseEventSource`]
//! are the production implementations; tests script their own.
//!
//! All methods return boxed futures so the traits stay object safe and can
//! be shared as `Arc<dyn RemoteClient>` across collection tasks.

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::local_store::Fields;
use crate::outbox::OutboxEntry;
use crate::realtime::RealtimeEvent;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Boxed future type for trait object safety.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One server-side document state returned by a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub document_id: String,
    pub collection_path: String,
    pub fields: Fields,
    /// Tombstone: remove the document locally.
    #[serde(default)]
    pub deleted: bool,
    /// Position of this change in the collection's change feed.
    pub server_checkpoint: Checkpoint,
}

/// A page of changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullBatch {
    /// Changes in checkpoint order.
    pub changes: Vec<RemoteChange>,
    /// Trailing cursor for the page. `None` when the page is empty and the
    /// server has nothing to report.
    pub next_checkpoint: Option<Checkpoint>,
}

/// Per-mutation rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub mutation_id: String,
    pub reason: String,
}

/// Server answer to a push request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: Vec<String>,
    pub rejected: Vec<Rejection>,
    /// Authoritative document states the server sent back (e.g. the winning
    /// version for a conflict). Applied locally as upserts.
    #[serde(default)]
    pub server_state: Vec<RemoteChange>,
}

/// Request/response side of the wire client.
pub trait RemoteClient: Send + Sync + 'static {
    /// Fetch up to `max_batch` changes strictly newer than `checkpoint`.
    fn fetch_changes<'a>(
        &'a self,
        collection: &'a str,
        checkpoint: Option<&'a Checkpoint>,
        max_batch: usize,
    ) -> RemoteFuture<'a, PullBatch>;

    /// Send a batch of mutations in one request.
    fn send_mutations<'a>(&'a self, collection: &'a str, entries: &'a [OutboxEntry]) -> RemoteFuture<'a, PushResponse>;
}

/// Opens notification sessions.
pub trait EventSource: Send + Sync + 'static {
    /// Open a session. Resolves once the connection is established.
    fn open<'a>(&'a self, scope: &'a str) -> RemoteFuture<'a, Box<dyn EventStream>>;
}

/// One open notification session.
///
/// A session that ends (`Ok(None)`) or errors has dropped; the listener
/// reconnects with a fresh [`EventSource::open`].
pub trait EventStream: Send {
    /// Subscribe to change notifications for `scope`. Must be issued on every
    /// new session; subscriptions do not survive a reconnect.
    fn subscribe<'a>(&'a mut self, scope: &'a str) -> RemoteFuture<'a, ()>;

    /// Next notification, in arrival order.
    fn next_event(&mut self) -> RemoteFuture<'_, Option<RealtimeEvent>>;

    /// Tear the session down.
    fn close(&mut self) -> RemoteFuture<'_, ()>;
}
