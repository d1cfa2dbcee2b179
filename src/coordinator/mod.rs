// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication coordinator.
//!
//! The orchestrator that ties together:
//! - Pulling via [`crate::puller::Puller`]
//! - Pushing via [`crate::pusher::Pusher`]
//! - Change notifications via [`crate::realtime::RealtimeListener`]
//! - Persistence via [`crate::checkpoint::CheckpointStore`] and [`crate::outbox::Outbox`]
//!
//! # Architecture
//!
//! Collections are independent. `start(path)` registers the collection and
//! spawns its tasks:
//!
//! ```text
//!  RealtimeListener ── notices ──► forward_notices ──► pull trigger ──► pull lane
//!  Outbox::enqueue ─── broadcast ► forward_enqueues ─► push trigger ──► push lane
//!                                                      fallback timer ─┘
//! ```
//!
//! Each lane runs at most one pass at a time; see [`lane`] for the
//! scheduling rules and [`collection`] for how `stop()` fences in-flight
//! passes.
//!
//! 1. `start()` sets `syncing`, connects the listener, runs one pull pass
//!    then one push pass, and settles in `idle` (or `error`)
//! 2. Triggers re-enter `syncing`
//! 3. `stop()` cancels waits immediately, lets in-flight passes drain, and
//!    ignores their results

mod collection;
mod lane;
mod types;

pub use types::{CollectionHealth, Lane, ReplicationState};

use crate::checkpoint::CheckpointStore;
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::local_store::LocalStore;
use crate::outbox::{FailedMutation, OperationKind, Outbox, OutboxEntry};
use crate::puller::Puller;
use crate::pusher::Pusher;
use crate::realtime::RealtimeListener;
use crate::remote::{EventSource, RemoteClient};
use crate::resilience::RateLimiter;
use crate::storage::open_pool;
use collection::{CollectionReplica, ReplicaSession};
use dashmap::DashMap;
use lane::{forward_enqueues, forward_notices, run_lane, LaneContext, LaneWork};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tracing::{debug, info, info_span, warn, Instrument};

/// Client-side replication engine.
///
/// Shares one [`Puller`], one [`Pusher`] and the SQLite-backed stores among
/// every started collection.
pub struct ReplicationCoordinator {
    config: ReplicationConfig,
    store: Arc<dyn LocalStore>,
    events: Option<Arc<dyn EventSource>>,
    checkpoints: Arc<CheckpointStore>,
    outbox: Arc<Outbox>,
    puller: Arc<Puller>,
    pusher: Arc<Pusher>,
    rate_limiter: Option<Arc<RateLimiter>>,
    /// Keyed by collection path.
    replicas: DashMap<String, Arc<CollectionReplica>>,
}

impl ReplicationCoordinator {
    /// Open the SQLite stores named by the config and build the coordinator.
    ///
    /// `events` is optional: without it collections sync on enqueues and the
    /// fallback interval only.
    pub async fn open(
        config: ReplicationConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        events: Option<Arc<dyn EventSource>>,
    ) -> Result<Self> {
        let pool = open_pool(&config.storage).await?;
        let checkpoints = Arc::new(CheckpointStore::with_pool(pool.clone(), config.storage.sqlite_path.clone()).await?);
        let outbox = Arc::new(Outbox::with_pool(pool).await?);

        info!(path = %config.storage.sqlite_path, "Replication stores opened");
        Ok(Self::with_stores(config, store, remote, events, checkpoints, outbox))
    }

    /// Build on already-open stores.
    pub fn with_stores(
        config: ReplicationConfig,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        events: Option<Arc<dyn EventSource>>,
        checkpoints: Arc<CheckpointStore>,
        outbox: Arc<Outbox>,
    ) -> Self {
        let settings = &config.settings;
        let puller = Arc::new(Puller::new(
            Arc::clone(&remote),
            Arc::clone(&store),
            Arc::clone(&checkpoints),
            settings.pull.effective_batch_size(),
        ));
        let pusher = Arc::new(Pusher::new(
            remote,
            Arc::clone(&outbox),
            Arc::clone(&store),
            settings.push.batch_size,
            settings.push.max_retries,
        ));
        let rate_limiter = settings
            .pull
            .rate_limit_config()
            .map(|limit| Arc::new(RateLimiter::new(limit)));

        Self {
            config,
            store,
            events,
            checkpoints,
            outbox,
            puller,
            pusher,
            rate_limiter,
            replicas: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    fn replica(&self, collection: &str) -> Arc<CollectionReplica> {
        self.replicas
            .entry(collection.to_string())
            .or_insert_with(|| Arc::new(CollectionReplica::new(collection)))
            .value()
            .clone()
    }

    fn existing_replica(&self, collection: &str) -> Option<Arc<CollectionReplica>> {
        self.replicas.get(collection).map(|entry| entry.value().clone())
    }

    /// Start replicating a collection.
    ///
    /// Returns immediately; the initial pull and push run in the background.
    /// Fails with `InvalidState` if the collection is already running.
    pub async fn start(&self, collection: &str) -> Result<()> {
        if collection.is_empty() {
            return Err(ReplicationError::Config("collection path must not be empty".to_string()));
        }

        let replica = self.replica(collection);
        let _lifecycle = replica.lifecycle.lock().await;
        if replica.session.lock().await.is_some() {
            return Err(ReplicationError::InvalidState {
                expected: "stopped".to_string(),
                actual: replica.state().to_string(),
            });
        }

        let epoch = replica.begin();
        info!(collection = %collection, epoch, "Starting replication");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pull_trigger = Arc::new(Notify::new());
        let push_trigger = Arc::new(Notify::new());
        let (initial_pull_tx, initial_pull_rx) = oneshot::channel();
        let schedule = self.config.settings.schedule.clone();
        let mut tasks = Vec::with_capacity(4);

        // Subscribe before the lanes run so no enqueue slips between them.
        let enqueued = self.outbox.subscribe();
        tasks.push(tokio::spawn(
            forward_enqueues(collection.to_string(), enqueued, Arc::clone(&push_trigger), shutdown_rx.clone())
                .instrument(info_span!("replication", collection = %collection)),
        ));

        let pull_ctx = LaneContext {
            collection: collection.to_string(),
            epoch,
            replica: Arc::clone(&replica),
            trigger: Arc::clone(&pull_trigger),
            schedule: schedule.clone(),
        };
        tasks.push(tokio::spawn(
            run_lane(
                pull_ctx,
                LaneWork::Pull(Arc::clone(&self.puller)),
                None,
                Some(initial_pull_tx),
                shutdown_rx.clone(),
            )
            .instrument(info_span!("replication", collection = %collection, lane = "pull")),
        ));

        let push_ctx = LaneContext {
            collection: collection.to_string(),
            epoch,
            replica: Arc::clone(&replica),
            trigger: Arc::clone(&push_trigger),
            schedule,
        };
        tasks.push(tokio::spawn(
            run_lane(
                push_ctx,
                LaneWork::Push(Arc::clone(&self.pusher)),
                Some(initial_pull_rx),
                None,
                shutdown_rx.clone(),
            )
            .instrument(info_span!("replication", collection = %collection, lane = "push")),
        ));

        let listener = match (&self.events, self.config.settings.realtime.enabled) {
            (Some(source), true) => {
                let (listener, notices) = RealtimeListener::new(
                    collection,
                    Arc::clone(source),
                    self.config.settings.realtime.retry_config(),
                );
                let listener = Arc::new(listener);
                listener.connect().await;
                tasks.push(tokio::spawn(
                    forward_notices(
                        collection.to_string(),
                        notices,
                        Arc::clone(&pull_trigger),
                        self.rate_limiter.clone(),
                        shutdown_rx,
                    )
                    .instrument(info_span!("replication", collection = %collection)),
                ));
                Some(listener)
            }
            _ => {
                debug!(collection = %collection, "Realtime disabled, relying on fallback interval");
                None
            }
        };

        *replica.session.lock().await = Some(ReplicaSession {
            shutdown_tx,
            pull_trigger,
            push_trigger,
            tasks,
            listener,
        });
        Ok(())
    }

    /// Stop replicating a collection.
    ///
    /// Pending waits are cancelled at once. In-flight passes may finish their
    /// I/O, up to the configured drain timeout, but their outcome is ignored.
    /// Stopping a collection that is not running is a no-op.
    pub async fn stop(&self, collection: &str) -> Result<()> {
        let Some(replica) = self.existing_replica(collection) else {
            return Ok(());
        };
        let _lifecycle = replica.lifecycle.lock().await;
        let Some(session) = replica.session.lock().await.take() else {
            return Ok(());
        };

        info!(collection = %collection, "Stopping replication");

        // Fence first: from here on no pass outcome is acted upon.
        replica.halt();
        let _ = session.shutdown_tx.send(true);

        if let Some(listener) = &session.listener {
            listener.disconnect().await;
        }

        let drain_timeout = self.config.settings.schedule.stop_drain_timeout_duration();
        for (i, mut handle) in session.tasks.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => debug!(collection = %collection, task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(collection = %collection, task = i + 1, error = %e, "Task panicked during stop"),
                Err(_) => {
                    warn!(collection = %collection, task = i + 1, "Task did not drain in time, aborting");
                    handle.abort();
                }
            }
        }

        replica.mark_stopped();
        info!(collection = %collection, "Replication stopped");
        Ok(())
    }

    /// Stop every collection and close the stores.
    pub async fn shutdown(&self) {
        let collections: Vec<String> = self.replicas.iter().map(|entry| entry.key().clone()).collect();
        info!(collections = collections.len(), "Shutting down replication");

        for collection in &collections {
            if let Err(e) = self.stop(collection).await {
                warn!(collection = %collection, error = %e, "Failed to stop collection");
            }
        }

        self.checkpoints.close().await;
        info!("Replication shut down");
    }

    /// Current state; `Stopped` for collections never started.
    pub fn state(&self, collection: &str) -> ReplicationState {
        self.existing_replica(collection)
            .map(|replica| replica.state())
            .unwrap_or(ReplicationState::Stopped)
    }

    /// Watch a collection's state across restarts.
    ///
    /// A collection that was never started gets a receiver fixed at
    /// `Stopped`; subscribe after `start()` to follow it.
    pub fn state_receiver(&self, collection: &str) -> watch::Receiver<ReplicationState> {
        match self.existing_replica(collection) {
            Some(replica) => replica.subscribe(),
            None => watch::channel(ReplicationState::Stopped).1,
        }
    }

    /// Collections currently running.
    pub fn running_collections(&self) -> Vec<String> {
        let mut running: Vec<String> = self
            .replicas
            .iter()
            .filter(|entry| entry.value().state().is_running())
            .map(|entry| entry.key().clone())
            .collect();
        running.sort();
        running
    }

    /// Queue a local mutation for push.
    pub async fn enqueue(&self, entry: OutboxEntry) -> Result<()> {
        self.outbox.enqueue(entry).await
    }

    /// Apply a local write to the store, then queue it for push.
    ///
    /// The store is written first so reads see the change at once; if the
    /// store refuses it nothing is queued.
    pub async fn apply_local_write(&self, entry: OutboxEntry) -> Result<()> {
        let applied = match entry.operation {
            OperationKind::Delete => self.store.apply_delete(&entry.collection_path, &entry.document_id).await,
            OperationKind::Create | OperationKind::Update => {
                self.store
                    .upsert(
                        &entry.collection_path,
                        &entry.document_id,
                        entry.payload.clone().unwrap_or_default(),
                    )
                    .await
            }
        };
        applied.map_err(|e| ReplicationError::LocalStore(e.to_string()))?;
        self.outbox.enqueue(entry).await
    }

    /// Ask a running collection to pull and push now.
    ///
    /// Returns `false` if the collection is not running.
    pub async fn sync_now(&self, collection: &str) -> bool {
        let Some(replica) = self.existing_replica(collection) else {
            return false;
        };
        let slot = replica.session.lock().await;
        match slot.as_ref() {
            Some(session) => {
                crate::metrics::record_trigger(collection, "pull", "manual");
                crate::metrics::record_trigger(collection, "push", "manual");
                session.pull_trigger.notify_one();
                session.push_trigger.notify_one();
                true
            }
            None => false,
        }
    }

    /// Dead-lettered mutations awaiting the application.
    pub async fn failed_mutations(&self, collection: &str) -> Result<Vec<FailedMutation>> {
        self.outbox.failed_mutations(collection).await
    }

    /// Drop dead-lettered mutations the application has dealt with.
    pub async fn discard_failed(&self, mutation_ids: &[String]) -> Result<usize> {
        self.outbox.discard_failed(mutation_ids).await
    }

    /// Notice for every mutation that gets dead-lettered.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FailedMutation> {
        self.pusher.subscribe_failures()
    }

    /// Health snapshot of one collection. No network I/O.
    pub async fn health(&self, collection: &str) -> Result<CollectionHealth> {
        let listener_state = match self.existing_replica(collection) {
            Some(replica) => replica
                .session
                .lock()
                .await
                .as_ref()
                .and_then(|session| session.listener.as_ref().map(|listener| listener.state())),
            None => None,
        };

        Ok(CollectionHealth {
            collection: collection.to_string(),
            state: self.state(collection),
            pending_mutations: self.outbox.pending_count(collection).await?,
            failed_mutations: self.outbox.failed_count(collection).await?,
            checkpoint: self.checkpoints.get(collection).await,
            listener_state,
        })
    }
}
