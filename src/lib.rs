//! # Replica Sync
//!
//! A client-side replication engine that keeps local collections in step
//! with a remote authority.
//!
//! ## Architecture
//!
//! The engine sits between the application's local store and the remote
//! REST/SSE endpoints, moving changes in both directions:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          ReplicationCoordinator                           │
//! │                                                                           │
//! │  ┌──────────────────┐   trigger   ┌────────┐   apply   ┌──────────────┐   │
//! │  │ RealtimeListener │────────────►│ Puller │──────────►│  LocalStore  │   │
//! │  │ (SSE, per coll.) │             └────────┘           └──────────────┘   │
//! │  └──────────────────┘                 │                       ▲           │
//! │                                       ▼                       │ server    │
//! │  ┌──────────────────┐          ┌─────────────────┐            │ state     │
//! │  │ Outbox (SQLite)  │─────────►│     Pusher      │────────────┘           │
//! │  └──────────────────┘  drain   └─────────────────┘                        │
//! │           ▲                                                               │
//! │           │ enqueue         ┌─────────────────────┐                       │
//! │      application            │ CheckpointStore     │ (SQLite, same file)   │
//! │                             └─────────────────────┘                       │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Directions
//!
//! 1. **Pull**: checkpointed, batched reads of remote changes, applied to the
//!    local store. Triggered by realtime events, reconnects and a fallback timer.
//! 2. **Push**: local mutations are durably queued in the outbox and drained in
//!    batches; rejected ones are retried and eventually dead-lettered.
//!
//! Conflicts resolve last-writer-wins at the server. Concurrent edits to the
//! same document from two clients keep only the later write.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replica_sync::{HttpRemoteClient, MemoryStore, ReplicationConfig, ReplicationCoordinator, SessionContext, SseEventSource};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replica_sync::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let session = Arc::new(SessionContext::with_token("token"));
//!     let remote = HttpRemoteClient::new(&config.remote, Arc::clone(&session))?;
//!     let events = SseEventSource::new(&config.remote.base_url, reqwest::Client::new(), session);
//!
//!     let coordinator = ReplicationCoordinator::open(
//!         config,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(remote),
//!         Some(Arc::new(events) as Arc<dyn replica_sync::EventSource>),
//!     )
//!     .await?;
//!
//!     coordinator.start("users").await?;
//!     // ... application runs ...
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod local_store;
pub mod metrics;
pub mod outbox;
pub mod puller;
pub mod pusher;
pub mod realtime;
pub mod remote;
pub mod resilience;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{PullConfig, PushConfig, RealtimeConfig, RemoteConfig, ReplicationConfig, ReplicationSettings, ScheduleConfig, StorageConfig};
pub use coordinator::{CollectionHealth, Lane, ReplicationCoordinator, ReplicationState};
pub use error::{ReplicationError, Result};
pub use http::HttpRemoteClient;
pub use local_store::{Fields, LocalStore, LocalStoreError, MemoryStore};
pub use outbox::{FailedMutation, OperationKind, Outbox, OutboxEntry};
pub use puller::{PullReport, Puller};
pub use pusher::{PushReport, Pusher};
pub use realtime::{ListenerNotice, ListenerState, RealtimeEvent, RealtimeListener, SseEventSource};
pub use remote::{EventSource, EventStream, PullBatch, PushResponse, Rejection, RemoteChange, RemoteClient};
pub use session::{SessionContext, TokenRefresher};
