// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime change notifications.
//!
//! A [`RealtimeListener`] keeps one notification session open for a scope
//! (a collection path) and reports what happens on a typed channel:
//!
//! ```text
//!           ┌──────────────┐  open+subscribe   ┌───────────┐
//!  connect ─► Connecting   ├──────────────────►│ Connected │── Event ──► notices
//!           └──────▲───────┘                   └─────┬─────┘
//!                  │ backoff (RetryConfig)           │ session drops
//!                  └─────────────────────────────────┘
//! ```
//!
//! Notifications are only hints that something changed; the coordinator
//! reacts by pulling. A reconnect after a drop is reported as
//! `Connected { resumed: true }` so the coordinator can catch up on anything
//! missed while the session was down.

mod frame;
mod sse;

pub use frame::{collection_of, decode_frame, ChangeKind, RealtimeEvent, ServerFrame, SseDecoder};
pub use sse::SseEventSource;

use crate::metrics;
use crate::remote::{EventSource, EventStream};
use crate::resilience::RetryConfig;
use crate::error::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long `disconnect` waits for the session task before aborting it.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Disconnected => write!(f, "disconnected"),
            ListenerState::Connecting => write!(f, "connecting"),
            ListenerState::Connected => write!(f, "connected"),
        }
    }
}

/// What the listener reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerNotice {
    /// Session established and subscribed. `resumed` is true for every
    /// session after the first.
    Connected { resumed: bool },
    /// Session lost (or a connect attempt failed); a reconnect follows.
    Dropped { reason: String },
    /// A change notification.
    Event(RealtimeEvent),
}

/// Keeps a notification session alive for one scope.
pub struct RealtimeListener {
    scope: String,
    source: Arc<dyn EventSource>,
    retry: RetryConfig,
    state_tx: Arc<watch::Sender<ListenerState>>,
    notice_tx: mpsc::UnboundedSender<ListenerNotice>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeListener {
    /// Create a listener and the receiving end of its notices.
    pub fn new(
        scope: impl Into<String>,
        source: Arc<dyn EventSource>,
        retry: RetryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ListenerNotice>) {
        let (state_tx, _) = watch::channel(ListenerState::Disconnected);
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let listener = Self {
            scope: scope.into(),
            source,
            retry,
            state_tx: Arc::new(state_tx),
            notice_tx,
            shutdown_tx: Mutex::new(None),
            task: Mutex::new(None),
        };
        (listener, notice_rx)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    /// Start the session task. Calling it while already running does nothing.
    pub async fn connect(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(scope = %self.scope, "Listener already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        let session = ListenerSession {
            scope: self.scope.clone(),
            source: Arc::clone(&self.source),
            retry: self.retry.clone(),
            state_tx: Arc::clone(&self.state_tx),
            notice_tx: self.notice_tx.clone(),
        };
        session.set_state(ListenerState::Connecting);
        *task = Some(tokio::spawn(session.run(shutdown_rx)));
    }

    /// Stop the session task and close the session.
    pub async fn disconnect(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.send(true);
        }

        if let Some(mut handle) = self.task.lock().await.take() {
            match timeout(DISCONNECT_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!(scope = %self.scope, "Listener stopped"),
                Ok(Err(e)) => warn!(scope = %self.scope, error = %e, "Listener task panicked"),
                Err(_) => {
                    warn!(scope = %self.scope, "Listener did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.state_tx.send_replace(ListenerState::Disconnected);
        metrics::set_listener_state(&self.scope, "disconnected");
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

/// State moved into the spawned session task.
struct ListenerSession {
    scope: String,
    source: Arc<dyn EventSource>,
    retry: RetryConfig,
    state_tx: Arc<watch::Sender<ListenerState>>,
    notice_tx: mpsc::UnboundedSender<ListenerNotice>,
}

impl ListenerSession {
    fn set_state(&self, state: ListenerState) {
        self.state_tx.send_replace(state);
        metrics::set_listener_state(&self.scope, &state.to_string());
    }

    async fn establish(&self) -> Result<Box<dyn EventStream>> {
        let mut stream = self.source.open(&self.scope).await?;
        if let Err(e) = stream.subscribe(&self.scope).await {
            let _ = stream.close().await;
            return Err(e);
        }
        Ok(stream)
    }

    async fn receive(&self, stream: &mut dyn EventStream, shutdown_rx: &mut watch::Receiver<bool>) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return SessionEnd::Shutdown,
                next = stream.next_event() => next,
            };

            match next {
                Ok(Some(event)) => {
                    metrics::record_realtime_event(&event.collection_path);
                    if self.notice_tx.send(ListenerNotice::Event(event)).is_err() {
                        // Owner is gone; nobody to notify.
                        return SessionEnd::Shutdown;
                    }
                }
                Ok(None) => return SessionEnd::Dropped("stream ended".to_string()),
                Err(e) => return SessionEnd::Dropped(e.to_string()),
            }
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut attempt: usize = 0;
        let mut has_connected = false;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            self.set_state(ListenerState::Connecting);

            let opened = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                opened = timeout(self.retry.connection_timeout, self.establish()) => opened,
            };

            let end = match opened {
                Ok(Ok(mut stream)) => {
                    if attempt > 0 {
                        info!(scope = %self.scope, attempt, "Realtime session re-established");
                    } else {
                        info!(scope = %self.scope, "Realtime session established");
                    }
                    attempt = 0;
                    self.set_state(ListenerState::Connected);
                    let _ = self.notice_tx.send(ListenerNotice::Connected { resumed: has_connected });
                    has_connected = true;

                    let end = self.receive(stream.as_mut(), &mut shutdown_rx).await;
                    if let Err(e) = stream.close().await {
                        debug!(scope = %self.scope, error = %e, "Error closing realtime session");
                    }
                    end
                }
                Ok(Err(e)) => SessionEnd::Dropped(e.to_string()),
                Err(_) => SessionEnd::Dropped(format!(
                    "connect timed out after {}ms",
                    self.retry.connection_timeout.as_millis()
                )),
            };

            let reason = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Dropped(reason) => reason,
            };

            attempt += 1;
            self.set_state(ListenerState::Disconnected);
            metrics::record_realtime_reconnect(&self.scope);
            let _ = self.notice_tx.send(ListenerNotice::Dropped { reason: reason.clone() });

            if !self.retry.allows_attempt(attempt) {
                warn!(scope = %self.scope, attempt, reason = %reason, "Giving up on realtime session");
                break;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            warn!(
                scope = %self.scope,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Realtime session dropped, reconnecting"
            );

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ListenerState::Disconnected);
        debug!(scope = %self.scope, "Realtime session task exiting");
    }
}
