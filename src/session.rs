//! Authentication session shared by the transport layer.
//!
//! A [`SessionContext`] holds the current bearer token and knows how to get
//! a new one. It is created by the application and handed to the HTTP client
//! and the SSE event source; there is no global auth state.
//!
//! # Single-Flight Refresh
//!
//! When a token expires, every in-flight request sees a 401 at roughly the
//! same time. Only the first caller of [`SessionContext::refresh`] actually
//! calls the [`TokenRefresher`]; everyone who arrives while that call is
//! running awaits the same shared future and gets the same result.
//!
//! ```text
//! request A ─401─► refresh() ──► refresher.refresh() ──┐
//! request B ─401─► refresh() ──► (joins shared future) ├─► token v2 to both
//! ```

use crate::error::{ReplicationError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Source of fresh tokens (login endpoint, refresh-token exchange, ...).
pub trait TokenRefresher: Send + Sync + 'static {
    fn refresh(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'static>>;
}

type SharedRefresh = Shared<BoxFuture<'static, std::result::Result<String, String>>>;

/// Explicit session state passed to the transport.
pub struct SessionContext {
    token: RwLock<Option<String>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    in_flight: Mutex<Option<SharedRefresh>>,
}

impl SessionContext {
    /// Session with no credentials (anonymous access).
    pub fn anonymous() -> Self {
        Self {
            token: RwLock::new(None),
            refresher: None,
            in_flight: Mutex::new(None),
        }
    }

    /// Session with a fixed token and no way to refresh it.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            refresher: None,
            in_flight: Mutex::new(None),
        }
    }

    /// Session that can refresh its token.
    pub fn with_refresher(initial_token: Option<String>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            token: RwLock::new(initial_token),
            refresher: Some(refresher),
            in_flight: Mutex::new(None),
        }
    }

    /// Current token, if any.
    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Replace the token (e.g. after an interactive login).
    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    /// Drop the token (logout).
    pub async fn clear(&self) {
        *self.token.write().await = None;
        info!("Session cleared");
    }

    /// Whether a refresher is configured.
    pub fn can_refresh(&self) -> bool {
        self.refresher.is_some()
    }

    /// Obtain a new token, sharing one refresh among concurrent callers.
    pub async fn refresh(&self) -> Result<String> {
        let refresher = self
            .refresher
            .clone()
            .ok_or_else(|| ReplicationError::Session("no token refresher configured".to_string()))?;

        let shared = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    debug!("Starting token refresh");
                    let fut: SharedRefresh = async move {
                        refresher.refresh().await.map_err(|e| e.to_string())
                    }
                    .boxed()
                    .shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let outcome = shared.await;

        {
            let mut slot = self.in_flight.lock().await;
            // A refresh started after ours completed is still pending; leave it.
            if slot.as_ref().is_some_and(|pending| pending.peek().is_some()) {
                *slot = None;
            }
        }

        match outcome {
            Ok(token) => {
                *self.token.write().await = Some(token.clone());
                crate::metrics::record_session_refresh(true);
                Ok(token)
            }
            Err(message) => {
                crate::metrics::record_session_refresh(false);
                warn!(error = %message, "Token refresh failed");
                Err(ReplicationError::Session(message))
            }
        }
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRefresher {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl TokenRefresher for CountingRefresher {
        fn refresh(&self) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'static>> {
            let calls = Arc::clone(&self.calls);
            let fail = self.fail;
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
                if fail {
                    Err(ReplicationError::transport_msg("refresh", "HTTP 500"))
                } else {
                    Ok(format!("token-{}", n))
                }
            })
        }
    }

    fn session(fail: bool) -> (Arc<SessionContext>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = Arc::new(CountingRefresher { calls: Arc::clone(&calls), fail });
        (Arc::new(SessionContext::with_refresher(None, refresher)), calls)
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_collapse() {
        let (session, calls) = session(false);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.refresh().await }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.token().await.as_deref(), Some("token-1"));
    }

    #[tokio::test]
    async fn test_sequential_refreshes_each_call_refresher() {
        let (session, calls) = session(false);

        assert_eq!(session.refresh().await.unwrap(), "token-1");
        assert_eq!(session.refresh().await.unwrap(), "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_reaches_all_waiters() {
        let (session, calls) = session(true);

        let a = Arc::clone(&session);
        let b = Arc::clone(&session);
        let (ra, rb) = tokio::join!(a.refresh(), b.refresh());

        assert!(matches!(ra, Err(ReplicationError::Session(_))));
        assert!(matches!(rb, Err(ReplicationError::Session(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(session.token().await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_refresher() {
        let session = SessionContext::with_token("static");
        assert!(!session.can_refresh());
        assert!(matches!(session.refresh().await, Err(ReplicationError::Session(_))));
        assert_eq!(session.token().await.as_deref(), Some("static"));

        session.clear().await;
        assert!(session.token().await.is_none());
    }
}
