// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realtime wire format.
//!
//! Every server message is a JSON envelope:
//!
//! ```json
//! {"id": "sub-1", "type": "event", "payload": { ... }}
//! ```
//!
//! Only `event` and `error` frames matter to replication. An event's
//! `delta.path` is the full document path (`users/5`), from which the
//! collection is derived. The document body is ignored: notifications only
//! trigger pulls, they are never a data source.
//!
//! Over SSE the envelopes arrive in `data:` lines; [`SseDecoder`] reassembles
//! records from arbitrary byte chunks.

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Create => write!(f, "create"),
            ChangeKind::Update => write!(f, "update"),
            ChangeKind::Delete => write!(f, "delete"),
        }
    }
}

/// A change notification. Carries no document body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub collection_path: String,
    pub change_kind: ChangeKind,
    /// Full document path, when the server sends one.
    #[serde(default)]
    pub document_path: Option<String>,
}

impl RealtimeEvent {
    pub fn new(collection_path: impl Into<String>, change_kind: ChangeKind) -> Self {
        Self {
            collection_path: collection_path.into(),
            change_kind,
            document_path: None,
        }
    }
}

/// Decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    AuthAck,
    Event(RealtimeEvent),
    Error { code: String, message: String },
    /// Any frame type replication does not act on (snapshots, stream, acks).
    Ignored(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct EventPayload {
    delta: Delta,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    path: String,
    #[serde(default)]
    document: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: serde_json::Value,
    #[serde(default)]
    message: String,
}

/// Collection part of a document path: everything before the last `/`.
pub fn collection_of(path: &str) -> Option<&str> {
    match path.rsplit_once('/') {
        Some((collection, id)) if !collection.is_empty() && !id.is_empty() => Some(collection),
        _ => None,
    }
}

/// Decode one JSON envelope.
pub fn decode_frame(text: &str) -> Result<ServerFrame> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| ReplicationError::Protocol(format!("Invalid realtime frame: {}", e)))?;

    match envelope.kind.as_str() {
        "auth_ack" => Ok(ServerFrame::AuthAck),
        "event" => {
            let payload = envelope
                .payload
                .ok_or_else(|| ReplicationError::Protocol("Event frame without payload".to_string()))?;
            let payload: EventPayload = serde_json::from_value(payload)
                .map_err(|e| ReplicationError::Protocol(format!("Invalid event payload: {}", e)))?;

            // Prefer the path; fall back to a "collection" field in the document.
            let collection = collection_of(&payload.delta.path)
                .map(str::to_string)
                .or_else(|| {
                    payload
                        .delta
                        .document
                        .as_ref()
                        .and_then(|doc| doc.get("collection"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .ok_or_else(|| {
                    ReplicationError::Protocol(format!("Event without collection (path '{}')", payload.delta.path))
                })?;

            Ok(ServerFrame::Event(RealtimeEvent {
                collection_path: collection,
                change_kind: payload.delta.kind,
                document_path: (!payload.delta.path.is_empty()).then_some(payload.delta.path),
            }))
        }
        "error" => {
            let payload: ErrorPayload = envelope
                .payload
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ReplicationError::Protocol(format!("Invalid error payload: {}", e)))?
                .unwrap_or(ErrorPayload {
                    code: serde_json::Value::Null,
                    message: String::new(),
                });
            let code = match payload.code {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            Ok(ServerFrame::Error {
                code,
                message: payload.message,
            })
        }
        other => Ok(ServerFrame::Ignored(other.to_string())),
    }
}

/// Incremental Server-Sent Events parser.
///
/// Feed it raw body chunks; it returns the `data` of every completed record.
/// Multi-line data is joined with `\n`, comments and other fields are skipped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning completed record payloads in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut records = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let decoded = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = decoded.strip_suffix('\r').unwrap_or(&*decoded);

            if line.is_empty() {
                if let Some(data) = self.data.take() {
                    records.push(data);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            if field == "data" {
                match self.data.as_mut() {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.data = Some(value.to_string()),
                }
            }
        }

        records
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_event_frame() {
        let frame = r#"{"id":"sub-1","type":"event","payload":{"subId":"sub-1","delta":{"type":"update","document":{"name":"B"},"path":"users/5","timestamp":1700000000}}}"#;
        match decode_frame(frame).unwrap() {
            ServerFrame::Event(event) => {
                assert_eq!(event.collection_path, "users");
                assert_eq!(event.change_kind, ChangeKind::Update);
                assert_eq!(event.document_path.as_deref(), Some("users/5"));
            }
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_nested_collection_path() {
        let frame = r#"{"type":"event","payload":{"delta":{"type":"delete","path":"rooms/1/messages/9"}}}"#;
        match decode_frame(frame).unwrap() {
            ServerFrame::Event(event) => {
                assert_eq!(event.collection_path, "rooms/1/messages");
                assert_eq!(event.change_kind, ChangeKind::Delete);
            }
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_event_collection_from_document() {
        let frame = r#"{"type":"event","payload":{"delta":{"type":"create","document":{"collection":"users"}}}}"#;
        match decode_frame(frame).unwrap() {
            ServerFrame::Event(event) => {
                assert_eq!(event.collection_path, "users");
                assert!(event.document_path.is_none());
            }
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_event_without_collection_is_protocol_error() {
        let frame = r#"{"type":"event","payload":{"delta":{"type":"create","path":"orphan"}}}"#;
        assert!(matches!(decode_frame(frame), Err(ReplicationError::Protocol(_))));
    }

    #[test]
    fn test_decode_error_frame() {
        let frame = r#"{"type":"error","payload":{"code":"unauthorized","message":"token expired"}}"#;
        assert_eq!(
            decode_frame(frame).unwrap(),
            ServerFrame::Error {
                code: "unauthorized".to_string(),
                message: "token expired".to_string()
            }
        );

        let numeric = r#"{"type":"error","payload":{"code":401,"message":"nope"}}"#;
        assert!(matches!(decode_frame(numeric).unwrap(), ServerFrame::Error { code, .. } if code == "401"));
    }

    #[test]
    fn test_decode_other_frames() {
        assert_eq!(decode_frame(r#"{"type":"auth_ack"}"#).unwrap(), ServerFrame::AuthAck);
        assert_eq!(
            decode_frame(r#"{"type":"snapshot","payload":{}}"#).unwrap(),
            ServerFrame::Ignored("snapshot".to_string())
        );
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode_frame("").is_err());
        assert!(decode_frame("not json").is_err());
        assert!(decode_frame(r#"{"payload":{}}"#).is_err());
        assert!(decode_frame(r#"{"type":"event"}"#).is_err());
        assert!(decode_frame(r#"{"type":"event","payload":{"delta":{"type":"explode","path":"a/b"}}}"#).is_err());
    }

    #[test]
    fn test_collection_of() {
        assert_eq!(collection_of("users/5"), Some("users"));
        assert_eq!(collection_of("a/b/c/d"), Some("a/b/c"));
        assert_eq!(collection_of("users"), None);
        assert_eq!(collection_of("/5"), None);
        assert_eq!(collection_of("users/"), None);
    }

    #[test]
    fn test_sse_decoder_single_record() {
        let mut decoder = SseDecoder::new();
        let records = decoder.feed(b"data: {\"type\":\"auth_ack\"}\n\n");
        assert_eq!(records, vec!["{\"type\":\"auth_ack\"}".to_string()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_sse_decoder_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hel").is_empty());
        assert!(decoder.feed(b"lo\r\n").is_empty());
        assert_eq!(decoder.feed(b"\r\n"), vec!["hello".to_string()]);
    }

    #[test]
    fn test_sse_decoder_multiline_and_comments() {
        let mut decoder = SseDecoder::new();
        let records = decoder.feed(b": keepalive\n\nevent: message\ndata: a\ndata: b\nid: 7\n\ndata:c\n\n");
        assert_eq!(records, vec!["a\nb".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_sse_decoder_blank_lines_without_data() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"\n\n\n").is_empty());
    }
}
