// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they come from (wire, local SQLite,
//! server response shape) and carry enough context to be logged on their own.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Network errors, timeouts, 5xx responses |
//! | `Session` | Yes | Token refresh failed or credentials rejected |
//! | `Persistence` | Yes | Local SQLite failure; the pass aborts, the next scheduled pass retries |
//! | `LocalStore` | Yes | Local document store refused a write |
//! | `ServerRejection` | No | Business-rule rejection of one mutation, bounded by the retry ceiling |
//! | `Protocol` | No | Malformed server response; checkpoint is not advanced |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle misuse (e.g. starting a collection twice) |
//! | `Shutdown` | No | Collection or coordinator is stopping |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! The coordinator retries *every* failed pass on its backoff schedule; a
//! pass failure never escapes the scheduling loop. [`ReplicationError::is_retryable()`]
//! tells callers outside that loop (and the logs) whether an immediate retry
//! has any chance of succeeding.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network or HTTP failure talking to the remote authority.
    ///
    /// Covers connection errors, timeouts and 5xx responses. Retried
    /// under backoff.
    #[error("Transport error ({operation}): {message}")]
    Transport {
        operation: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The server rejected a single mutation.
    ///
    /// Requeued with an incremented retry count; dead-lettered once the
    /// configured ceiling is exceeded.
    #[error("Server rejected mutation {mutation_id}: {reason}")]
    ServerRejection { mutation_id: String, reason: String },

    /// SQLite error while reading or writing checkpoints or the outbox.
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// The local document store failed outside of a per-document apply.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// Malformed or contract-violating server response.
    ///
    /// The pass is aborted and the checkpoint stays where it was.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication session could not be refreshed.
    #[error("Session error: {0}")]
    Session(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a transport error from a reqwest error.
    pub fn transport(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source.
    pub fn transport_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Session(_) => true,
            Self::Persistence(_) => true, // next scheduled pass re-reads from disk
            Self::LocalStore(_) => true,
            Self::ServerRejection { .. } => false,
            Self::Protocol(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::ServerRejection { .. } => "server_rejection",
            Self::Persistence(_) => "persistence",
            Self::LocalStore(_) => "local_store",
            Self::Protocol(_) => "protocol",
            Self::Session(_) => "session",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
