//! Server-Sent Events notification source.
//!
//! `GET /v1/realtime?collection=<scope>` with `Accept: text/event-stream`.
//! Each SSE record carries one JSON frame (see [`super::frame`]). A 401 on
//! open refreshes the session once before giving up.

use super::frame::{decode_frame, RealtimeEvent, ServerFrame, SseDecoder};
use crate::error::{ReplicationError, Result};
use crate::http::{classify_status, send_authorized};
use crate::remote::{EventSource, EventStream, RemoteFuture};
use crate::session::SessionContext;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

const REALTIME_PATH: &str = "/v1/realtime";

type ByteStream = BoxStream<'static, reqwest::Result<Vec<u8>>>;

/// Opens SSE sessions against the realtime endpoint.
pub struct SseEventSource {
    base_url: String,
    client: reqwest::Client,
    session: Arc<SessionContext>,
}

impl SseEventSource {
    /// The client must not carry a total request timeout; the stream is
    /// long-lived. Connect timeouts are applied by the listener.
    pub fn new(base_url: &str, client: reqwest::Client, session: Arc<SessionContext>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            session,
        }
    }

    async fn connect(&self, scope: &str) -> Result<Box<dyn EventStream>> {
        let url = format!("{}{}", self.base_url, REALTIME_PATH);
        let response = send_authorized("realtime", &self.session, || {
            self.client
                .get(&url)
                .query(&[("collection", scope)])
                .header(ACCEPT, "text/event-stream")
        })
        .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("realtime", status, &body));
        }

        debug!(scope = %scope, "Realtime stream opened");
        let body: ByteStream = response.bytes_stream().map(|chunk| chunk.map(|b| b.to_vec())).boxed();
        Ok(Box::new(SseStream::new(body)))
    }
}

impl EventSource for SseEventSource {
    fn open<'a>(&'a self, scope: &'a str) -> RemoteFuture<'a, Box<dyn EventStream>> {
        Box::pin(self.connect(scope))
    }
}

/// One open SSE response body.
pub(crate) struct SseStream {
    body: ByteStream,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    scope: Option<String>,
}

impl SseStream {
    pub(crate) fn new(body: ByteStream) -> Self {
        Self {
            body,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            scope: None,
        }
    }

    /// Events outside the subscribed scope are dropped.
    fn in_scope(&self, event: &RealtimeEvent) -> bool {
        match &self.scope {
            Some(scope) => &event.collection_path == scope,
            None => true,
        }
    }

    async fn next(&mut self) -> Result<Option<RealtimeEvent>> {
        loop {
            while let Some(record) = self.pending.pop_front() {
                match decode_frame(&record) {
                    Ok(ServerFrame::Event(event)) if self.in_scope(&event) => return Ok(Some(event)),
                    Ok(ServerFrame::Event(event)) => {
                        debug!(collection = %event.collection_path, "Ignoring event outside subscription");
                    }
                    Ok(ServerFrame::Error { code, message }) => {
                        warn!(code = %code, message = %message, "Realtime server reported an error");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Skipping undecodable realtime frame"),
                }
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.decoder.feed(&chunk)),
                Some(Err(e)) => return Err(ReplicationError::transport("realtime", e)),
                None => return Ok(None),
            }
        }
    }
}

impl EventStream for SseStream {
    fn subscribe<'a>(&'a mut self, scope: &'a str) -> RemoteFuture<'a, ()> {
        // The scope travels in the open request; remember it for filtering.
        self.scope = Some(scope.to_string());
        Box::pin(async { Ok(()) })
    }

    fn next_event(&mut self) -> RemoteFuture<'_, Option<RealtimeEvent>> {
        Box::pin(self.next())
    }

    fn close(&mut self) -> RemoteFuture<'_, ()> {
        self.body = stream::empty().boxed();
        self.pending.clear();
        Box::pin(async { Ok(()) })
    }
}
