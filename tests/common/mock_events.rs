//! Controllable notification source.
//!
//! Each `open()` creates a fresh session for its scope, backed by a channel.
//! Tests push events into a scope's live session with `emit()` and end it
//! with `drop_session()`; a session with nothing queued stays silent.

use replica_sync::realtime::{ChangeKind, RealtimeEvent};
use replica_sync::remote::RemoteFuture;
use replica_sync::{EventSource, EventStream, ReplicationError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// `None` ends the session.
type SessionTx = mpsc::UnboundedSender<Option<RealtimeEvent>>;

#[derive(Default)]
pub struct MockEventSource {
    live: Mutex<HashMap<String, SessionTx>>,
    opens: AtomicUsize,
    subscriptions: Arc<Mutex<Vec<String>>>,
    fail_opens: AtomicUsize,
}

impl MockEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Scopes subscribed, one per established session.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Push an event into the collection's live session. Returns false if
    /// none is open.
    pub fn emit(&self, collection: &str, kind: ChangeKind) -> bool {
        match self.live.lock().unwrap().get(collection) {
            Some(tx) => tx.send(Some(RealtimeEvent::new(collection, kind))).is_ok(),
            None => false,
        }
    }

    /// End the scope's live session as if the connection dropped.
    pub fn drop_session(&self, scope: &str) -> bool {
        match self.live.lock().unwrap().remove(scope) {
            Some(tx) => tx.send(None).is_ok(),
            None => false,
        }
    }

    /// Wait until `n` sessions have subscribed.
    pub async fn wait_for_subscriptions(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.subscriptions.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for realtime subscription");
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Option<RealtimeEvent>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
}

impl EventSource for MockEventSource {
    fn open<'a>(&'a self, scope: &'a str) -> RemoteFuture<'a, Box<dyn EventStream>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fail_opens
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ReplicationError::transport_msg("realtime", "connection refused"));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            self.live.lock().unwrap().insert(scope.to_string(), tx);
            Ok(Box::new(MockStream {
                rx,
                subscriptions: Arc::clone(&self.subscriptions),
            }) as Box<dyn EventStream>)
        })
    }
}

impl EventStream for MockStream {
    fn subscribe<'a>(&'a mut self, scope: &'a str) -> RemoteFuture<'a, ()> {
        self.subscriptions.lock().unwrap().push(scope.to_string());
        Box::pin(async { Ok(()) })
    }

    fn next_event(&mut self) -> RemoteFuture<'_, Option<RealtimeEvent>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Some(event)) => Ok(Some(event)),
                Some(None) | None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> RemoteFuture<'_, ()> {
        self.rx.close();
        Box::pin(async { Ok(()) })
    }
}
