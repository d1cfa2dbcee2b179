//! Replication state types.
//!
//! Each started collection has its own state machine:
//!
//! # State Transitions
//!
//! ```text
//!            start()
//! Stopped ───────────→ Syncing ←─────────────────┐
//!    ↑                   │                        │
//!    │             pass  │  pass                  │ trigger (event,
//!    │              ok   │  failed                │ enqueue, timer)
//!    │                   ↓                        │
//!    │       ┌──────── Idle / Error ──────────────┘
//!    │       │
//!    └───────┘ stop()
//! ```
//!
//! # State Descriptions
//!
//! - **Stopped**: Not replicating. Initial state, and the state after `stop()`.
//! - **Syncing**: A pull or push pass is running.
//! - **Idle**: The last passes succeeded; waiting for the next trigger.
//! - **Error**: A pass failed; the next attempt is scheduled under backoff.

use crate::checkpoint::Checkpoint;
use crate::realtime::ListenerState;
use std::fmt;

/// Replication state of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    Stopped,
    Syncing,
    Idle,
    Error,
}

impl ReplicationState {
    pub fn is_running(&self) -> bool {
        !matches!(self, ReplicationState::Stopped)
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationState::Stopped => write!(f, "stopped"),
            ReplicationState::Syncing => write!(f, "syncing"),
            ReplicationState::Idle => write!(f, "idle"),
            ReplicationState::Error => write!(f, "error"),
        }
    }
}

/// Which kind of pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Pull,
    Push,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Pull => write!(f, "pull"),
            Lane::Push => write!(f, "push"),
        }
    }
}

/// Point-in-time health of one collection.
///
/// Built from local state only; never touches the network.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionHealth {
    pub collection: String,
    pub state: ReplicationState,
    /// Outbox entries waiting to be pushed.
    pub pending_mutations: usize,
    /// Dead-lettered entries awaiting the application.
    pub failed_mutations: usize,
    pub checkpoint: Option<Checkpoint>,
    /// `None` when realtime is disabled or the collection is stopped.
    pub listener_state: Option<ListenerState>,
}

impl CollectionHealth {
    /// Running, not in error, and nothing dead-lettered.
    pub fn is_healthy(&self) -> bool {
        self.state.is_running() && self.state != ReplicationState::Error && self.failed_mutations == 0
    }
}
