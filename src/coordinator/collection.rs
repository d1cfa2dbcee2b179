//! Per-collection replication state.
//!
//! A [`CollectionReplica`] lives in the coordinator's registry for as long as
//! the coordinator does; start/stop cycles reuse it so state subscribers
//! survive restarts.
//!
//! # Stop Fencing
//!
//! Every `start()` bumps an epoch. Lanes carry the epoch they were spawned
//! with and must pass `begin_pass`/`finish_pass`, which check the epoch and
//! the stopped flag under one lock. Once `halt()` has run, a pass that is
//! still in flight can finish its I/O but `finish_pass` refuses it: its
//! outcome changes no state and the lane schedules nothing further.

use super::types::{Lane, ReplicationState};
use crate::metrics;
use crate::realtime::RealtimeListener;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Default, Clone, Copy)]
struct LaneStatus {
    running: bool,
    failed: bool,
}

#[derive(Debug)]
struct Status {
    epoch: u64,
    stopped: bool,
    /// Set from start until the first push pass completes.
    initial: bool,
    pull: LaneStatus,
    push: LaneStatus,
}

impl Status {
    fn lane_mut(&mut self, lane: Lane) -> &mut LaneStatus {
        match lane {
            Lane::Pull => &mut self.pull,
            Lane::Push => &mut self.push,
        }
    }

    fn aggregate(&self) -> ReplicationState {
        if self.stopped {
            ReplicationState::Stopped
        } else if self.initial || self.pull.running || self.push.running {
            ReplicationState::Syncing
        } else if self.pull.failed || self.push.failed {
            ReplicationState::Error
        } else {
            ReplicationState::Idle
        }
    }
}

/// Handles of a running replication session.
pub(crate) struct ReplicaSession {
    pub shutdown_tx: watch::Sender<bool>,
    pub pull_trigger: Arc<Notify>,
    pub push_trigger: Arc<Notify>,
    pub tasks: Vec<JoinHandle<()>>,
    pub listener: Option<Arc<RealtimeListener>>,
}

pub(crate) struct CollectionReplica {
    path: String,
    state_tx: watch::Sender<ReplicationState>,
    status: Mutex<Status>,
    /// Held across start/stop so the two never interleave.
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
    /// Live tasks and triggers. Only held briefly, never across a drain.
    pub(crate) session: tokio::sync::Mutex<Option<ReplicaSession>>,
}

impl CollectionReplica {
    pub fn new(path: impl Into<String>) -> Self {
        let (state_tx, _) = watch::channel(ReplicationState::Stopped);
        Self {
            path: path.into(),
            state_tx,
            status: Mutex::new(Status {
                epoch: 0,
                stopped: true,
                initial: false,
                pull: LaneStatus::default(),
                push: LaneStatus::default(),
            }),
            lifecycle: tokio::sync::Mutex::new(()),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ReplicationState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplicationState> {
        self.state_tx.subscribe()
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, Status> {
        // A poisoned lock only means a panic elsewhere; the status is plain data.
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, status: &Status) {
        let state = status.aggregate();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        metrics::set_replication_state(&self.path, &state.to_string());
    }

    /// Open a new epoch and enter `Syncing`.
    pub fn begin(&self) -> u64 {
        let mut status = self.lock_status();
        status.epoch += 1;
        status.stopped = false;
        status.initial = true;
        status.pull = LaneStatus::default();
        status.push = LaneStatus::default();
        self.publish(&status);
        status.epoch
    }

    /// Claim the lane for a pass. `false` means the session is over.
    pub fn begin_pass(&self, epoch: u64, lane: Lane) -> bool {
        let mut status = self.lock_status();
        if status.stopped || status.epoch != epoch {
            return false;
        }
        status.lane_mut(lane).running = true;
        self.publish(&status);
        true
    }

    /// Record a pass outcome. `false` means stop won the race and the
    /// outcome must be dropped.
    pub fn finish_pass(&self, epoch: u64, lane: Lane, ok: bool) -> bool {
        let mut status = self.lock_status();
        if status.stopped || status.epoch != epoch {
            return false;
        }
        let lane_status = status.lane_mut(lane);
        lane_status.running = false;
        lane_status.failed = !ok;
        if lane == Lane::Push {
            status.initial = false;
        }
        self.publish(&status);
        true
    }

    /// Fence off the current epoch. State is published by `mark_stopped`.
    pub fn halt(&self) {
        self.lock_status().stopped = true;
    }

    pub fn mark_stopped(&self) {
        let status = self.lock_status();
        self.publish(&status);
    }
}
