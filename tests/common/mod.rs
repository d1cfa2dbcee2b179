//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Scripted `MockRemote` (pull/push endpoints)
//! - Controllable `MockEventSource` (realtime sessions)
//! - A `Harness` wiring both into a coordinator over in-memory SQLite

#![allow(dead_code)]

pub mod mock_events;
pub mod mock_remote;

pub use mock_events::*;
pub use mock_remote::*;

use replica_sync::{
    EventSource, Fields, MemoryStore, ReplicationConfig, ReplicationCoordinator, ReplicationState,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Build a field map from a JSON object literal.
pub fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().expect("fields must be a JSON object")
}

/// Poll `check` until it returns true, failing the test after 5 seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

/// A coordinator wired to mocks.
pub struct Harness {
    pub coordinator: ReplicationCoordinator,
    pub remote: Arc<MockRemote>,
    pub events: Arc<MockEventSource>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(ReplicationConfig::for_testing()).await
    }

    pub async fn with_config(config: ReplicationConfig) -> Self {
        let remote = Arc::new(MockRemote::new());
        let events = Arc::new(MockEventSource::new());
        let store = Arc::new(MemoryStore::new());
        let coordinator = ReplicationCoordinator::open(
            config,
            store.clone(),
            remote.clone(),
            Some(events.clone() as Arc<dyn EventSource>),
        )
        .await
        .expect("coordinator should open");

        Self {
            coordinator,
            remote,
            events,
            store,
        }
    }

    /// Wait for a collection to reach `state`.
    pub async fn wait_for_state(&self, collection: &str, state: ReplicationState) {
        let mut rx = self.coordinator.state_receiver(collection);
        let reached = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state)).await;
        assert!(
            matches!(reached, Ok(Ok(_))),
            "{} never reached {} (now {})",
            collection,
            state,
            self.coordinator.state(collection)
        );
    }

    /// Start a collection and wait for the initial pull and push to settle.
    pub async fn start_idle(&self, collection: &str) {
        self.coordinator.start(collection).await.expect("start should succeed");
        self.wait_for_state(collection, ReplicationState::Idle).await;
    }

    pub async fn pending(&self, collection: &str) -> usize {
        self.coordinator
            .outbox()
            .pending_count(collection)
            .await
            .expect("pending count")
    }
}
