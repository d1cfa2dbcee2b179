//! Local document store interface.
//!
//! The replication engine does not own document storage; the application
//! passes in something implementing [`LocalStore`]. Pulled changes are
//! written through it, and pushed mutations that the server answered with
//! its own state are reconciled through it.
//!
//! # Contract
//!
//! Both operations must be idempotent: repeating an upsert with identical
//! fields, or deleting an already-deleted document, must leave nothing
//! observably different. Pulls are at-least-once, so the engine relies on this
//! after a crash between applying a batch and persisting its checkpoint.
//!
//! # Implementation
//!
//! ```rust,ignore
//! use replica_sync::local_store::{Fields, LocalStore, StoreFuture};
//!
//! impl LocalStore for MyDatabase {
//!     fn upsert<'a>(&'a self, collection: &'a str, document_id: &'a str, fields: Fields) -> StoreFuture<'a, ()> {
//!         Box::pin(async move {
//!             self.write(collection, document_id, fields).await.map_err(|e| e.into())
//!         })
//!     }
//!     // ...
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

/// Document body: a flat JSON object.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Error from the local store.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LocalStoreError {
    pub message: String,
}

impl LocalStoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl From<String> for LocalStoreError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for LocalStoreError {
    fn from(message: &str) -> Self {
        Self { message: message.to_string() }
    }
}

/// Result type for local store operations.
pub type StoreResult<T> = std::result::Result<T, LocalStoreError>;

/// Boxed future type for trait object safety.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Trait the application's document store implements.
pub trait LocalStore: Send + Sync + 'static {
    /// Insert or replace a document.
    fn upsert<'a>(&'a self, collection: &'a str, document_id: &'a str, fields: Fields) -> StoreFuture<'a, ()>;

    /// Remove a document. Deleting a missing document succeeds.
    fn apply_delete<'a>(&'a self, collection: &'a str, document_id: &'a str) -> StoreFuture<'a, ()>;
}

/// In-memory store, used for tests and as a cache-only mode.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<(String, String), Fields>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a document.
    pub async fn get(&self, collection: &str, document_id: &str) -> Option<Fields> {
        self.documents
            .read()
            .await
            .get(&(collection.to_string(), document_id.to_string()))
            .cloned()
    }

    /// All documents of a collection, keyed by id.
    pub async fn snapshot(&self, collection: &str) -> HashMap<String, Fields> {
        self.documents
            .read()
            .await
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, id), fields)| (id.clone(), fields.clone()))
            .collect()
    }

    /// Number of documents across all collections.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn upsert<'a>(&'a self, collection: &'a str, document_id: &'a str, fields: Fields) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.documents
                .write()
                .await
                .insert((collection.to_string(), document_id.to_string()), fields);
            Ok(())
        })
    }

    fn apply_delete<'a>(&'a self, collection: &'a str, document_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.documents
                .write()
                .await
                .remove(&(collection.to_string(), document_id.to_string()));
            Ok(())
        })
    }
}
