//! HTTP implementation of [`RemoteClient`].
//!
//! Talks to the replication REST endpoints:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | pull | `GET /v1/replication/pull?collection=&checkpoint=&limit=` |
//! | push | `POST /v1/replication/push` with `{collection, changes: [{action, document}]}` |
//!
//! Documents on the wire are flat JSON objects. `id` holds the full path
//! (`users/5`). The reserved `_updated_at` (or `_version`) field is the
//! change-feed position and `deleted: true` marks a tombstone.
//!
//! # Response Mapping
//!
//! | Status | Error |
//! |--------|-------|
//! | network failure, 408, 429, 5xx | `Transport` (retried under backoff) |
//! | 401 / 403 after one session refresh | `Session` |
//! | other 4xx, undecodable body | `Protocol` |
//!
//! A push response may list `conflicts`: the server's winning versions of
//! documents it refused. Each one rejects the mutation for that document with
//! reason `"conflict"` and is handed back as server state.

use crate::checkpoint::Checkpoint;
use crate::config::RemoteConfig;
use crate::error::{ReplicationError, Result};
use crate::local_store::Fields;
use crate::outbox::OutboxEntry;
use crate::remote::{PullBatch, PushResponse, Rejection, RemoteChange, RemoteClient, RemoteFuture};
use crate::session::SessionContext;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

const PULL_PATH: &str = "/v1/replication/pull";
const PUSH_PATH: &str = "/v1/replication/push";

const RESERVED_ID: &str = "id";
const RESERVED_UPDATED_AT: &str = "_updated_at";
const RESERVED_VERSION: &str = "_version";
const RESERVED_DELETED: &str = "deleted";

#[derive(Debug, Deserialize)]
pub(crate) struct PullWire {
    #[serde(default)]
    documents: Option<Vec<Fields>>,
    #[serde(default)]
    checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Serialize)]
struct PushChangeWire<'a> {
    action: &'a str,
    document: Fields,
}

#[derive(Debug, Serialize)]
struct PushRequestWire<'a> {
    collection: &'a str,
    changes: Vec<PushChangeWire<'a>>,
}

#[derive(Debug, Deserialize)]
struct RejectionWire {
    id: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PushWire {
    #[serde(default)]
    accepted: Option<Vec<String>>,
    #[serde(default)]
    rejected: Option<Vec<RejectionWire>>,
    #[serde(default)]
    conflicts: Option<Vec<Fields>>,
}

/// Attach the session's bearer token, if any.
pub(crate) async fn authorize(builder: RequestBuilder, session: &SessionContext) -> RequestBuilder {
    match session.token().await {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

/// Map a non-success status to the error taxonomy.
pub(crate) fn classify_status(operation: &str, status: StatusCode, body: &str) -> ReplicationError {
    let snippet: String = body.chars().take(200).collect();
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ReplicationError::transport_msg(operation, format!("HTTP {}: {}", status.as_u16(), snippet))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ReplicationError::Session(format!("{} rejected credentials (HTTP {})", operation, status.as_u16()))
    } else {
        ReplicationError::Protocol(format!("{} failed with HTTP {}: {}", operation, status.as_u16(), snippet))
    }
}

/// Send a request, refreshing the session once on 401.
///
/// `build` is called again for the retry since a `RequestBuilder` is consumed by `send`.
pub(crate) async fn send_authorized<F>(operation: &str, session: &SessionContext, build: F) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let response = authorize(build(), session)
        .await
        .send()
        .await
        .map_err(|e| ReplicationError::transport(operation, e))?;

    if response.status() == StatusCode::UNAUTHORIZED && session.can_refresh() {
        debug!(operation, "Got 401, refreshing session");
        session.refresh().await?;
        return authorize(build(), session)
            .await
            .send()
            .await
            .map_err(|e| ReplicationError::transport(operation, e));
    }

    Ok(response)
}

/// Read the body, turning non-success statuses into errors.
async fn read_body(operation: &str, response: Response) -> Result<String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ReplicationError::transport(operation, e))?;

    if !status.is_success() {
        return Err(classify_status(operation, status, &body));
    }
    Ok(body)
}

fn checkpoint_field(doc: &Fields) -> Option<Checkpoint> {
    [RESERVED_UPDATED_AT, RESERVED_VERSION]
        .iter()
        .find_map(|key| match doc.get(*key) {
            Some(serde_json::Value::Number(n)) => Some(Checkpoint::new(n.to_string())),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(Checkpoint::new(s.clone())),
            _ => None,
        })
}

/// Strip the `collection/` prefix from a wire id.
fn local_document_id<'a>(collection: &str, id: &'a str) -> &'a str {
    id.strip_prefix(collection)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(id)
}

/// Convert a wire document into a [`RemoteChange`].
pub(crate) fn document_to_change(collection: &str, mut doc: Fields, require_checkpoint: bool) -> Result<RemoteChange> {
    let id = match doc.remove(RESERVED_ID) {
        Some(serde_json::Value::String(id)) if !id.is_empty() => id,
        other => {
            return Err(ReplicationError::Protocol(format!(
                "Document in '{}' has no usable id: {:?}",
                collection, other
            )))
        }
    };

    let server_checkpoint = match checkpoint_field(&doc) {
        Some(cp) => cp,
        None if require_checkpoint => {
            return Err(ReplicationError::Protocol(format!(
                "Document '{}' has neither {} nor {}",
                id, RESERVED_UPDATED_AT, RESERVED_VERSION
            )))
        }
        None => Checkpoint::new("0"),
    };

    let deleted = matches!(doc.remove(RESERVED_DELETED), Some(serde_json::Value::Bool(true)));

    Ok(RemoteChange {
        document_id: local_document_id(collection, &id).to_string(),
        collection_path: collection.to_string(),
        fields: doc,
        deleted,
        server_checkpoint,
    })
}

/// Convert a pull response body.
pub(crate) fn interpret_pull_response(collection: &str, wire: PullWire) -> Result<PullBatch> {
    let changes = wire
        .documents
        .unwrap_or_default()
        .into_iter()
        .map(|doc| document_to_change(collection, doc, true))
        .collect::<Result<Vec<_>>>()?;

    let next_checkpoint = wire.checkpoint.filter(|cp| !cp.as_str().is_empty());

    Ok(PullBatch { changes, next_checkpoint })
}

/// Convert a push response body, matching conflicts back to mutations.
pub(crate) fn interpret_push_response(collection: &str, entries: &[OutboxEntry], wire: PushWire) -> Result<PushResponse> {
    let mut rejected: Vec<Rejection> = wire
        .rejected
        .unwrap_or_default()
        .into_iter()
        .map(|r| Rejection {
            mutation_id: r.id,
            reason: if r.reason.is_empty() { "rejected".to_string() } else { r.reason },
        })
        .collect();

    let mut server_state = Vec::new();
    for doc in wire.conflicts.unwrap_or_default() {
        let change = document_to_change(collection, doc, false)?;
        match entries.iter().find(|e| e.document_id == change.document_id) {
            Some(entry) if !rejected.iter().any(|r| r.mutation_id == entry.mutation_id) => {
                rejected.push(Rejection {
                    mutation_id: entry.mutation_id.clone(),
                    reason: "conflict".to_string(),
                });
            }
            Some(_) => {}
            None => {
                warn!(collection = %collection, document_id = %change.document_id, "Conflict for a document not in this push");
            }
        }
        server_state.push(change);
    }

    let rejected_ids: HashSet<&str> = rejected.iter().map(|r| r.mutation_id.as_str()).collect();
    let accepted = match wire.accepted {
        Some(accepted) => accepted,
        None => entries
            .iter()
            .filter(|e| !rejected_ids.contains(e.mutation_id.as_str()))
            .map(|e| e.mutation_id.clone())
            .collect(),
    };

    Ok(PushResponse {
        accepted,
        rejected,
        server_state,
    })
}

fn push_document(entry: &OutboxEntry) -> Fields {
    let mut document = entry.payload.clone().unwrap_or_default();
    document.insert(
        RESERVED_ID.to_string(),
        serde_json::Value::String(format!("{}/{}", entry.collection_path, entry.document_id)),
    );
    document
}

/// reqwest-backed wire client.
pub struct HttpRemoteClient {
    base_url: String,
    client: reqwest::Client,
    session: Arc<SessionContext>,
}

impl HttpRemoteClient {
    /// Build a client from config.
    pub fn new(config: &RemoteConfig, session: Arc<SessionContext>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout_duration())
            .build()
            .map_err(|e| ReplicationError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(&config.base_url, client, session))
    }

    /// Build on an existing reqwest client.
    pub fn with_client(base_url: &str, client: reqwest::Client, session: Arc<SessionContext>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            session,
        }
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    async fn pull(&self, collection: &str, checkpoint: Option<&Checkpoint>, max_batch: usize) -> Result<PullBatch> {
        let url = format!("{}{}", self.base_url, PULL_PATH);
        let mut params: Vec<(&str, String)> = vec![
            ("collection", collection.to_string()),
            ("limit", max_batch.to_string()),
        ];
        if let Some(cp) = checkpoint {
            params.push(("checkpoint", cp.to_string()));
        }

        let response = send_authorized("pull", &self.session, || self.client.get(&url).query(&params)).await?;
        let body = read_body("pull", response).await?;
        let wire: PullWire = serde_json::from_str(&body)
            .map_err(|e| ReplicationError::Protocol(format!("Invalid pull response: {}", e)))?;

        interpret_pull_response(collection, wire)
    }

    async fn push(&self, collection: &str, entries: &[OutboxEntry]) -> Result<PushResponse> {
        let url = format!("{}{}", self.base_url, PUSH_PATH);
        let request = PushRequestWire {
            collection,
            changes: entries
                .iter()
                .map(|entry| PushChangeWire {
                    action: entry.operation.as_str(),
                    document: push_document(entry),
                })
                .collect(),
        };

        let response = send_authorized("push", &self.session, || self.client.post(&url).json(&request)).await?;
        let body = read_body("push", response).await?;
        let wire: PushWire = serde_json::from_str(&body)
            .map_err(|e| ReplicationError::Protocol(format!("Invalid push response: {}", e)))?;

        interpret_push_response(collection, entries, wire)
    }
}

impl RemoteClient for HttpRemoteClient {
    fn fetch_changes<'a>(
        &'a self,
        collection: &'a str,
        checkpoint: Option<&'a Checkpoint>,
        max_batch: usize,
    ) -> RemoteFuture<'a, PullBatch> {
        Box::pin(self.pull(collection, checkpoint, max_batch))
    }

    fn send_mutations<'a>(&'a self, collection: &'a str, entries: &'a [OutboxEntry]) -> RemoteFuture<'a, PushResponse> {
        Box::pin(self.push(collection, entries))
    }
}
