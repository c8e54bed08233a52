// src/core/errors.rs

//! Defines the primary error type for the subscription service.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all failures the service can surface on
/// a caller's future. Internal retries and cleanup never reach the caller;
/// everything here does.
#[derive(Error, Debug, Clone)]
pub enum SubMuxError {
    /// The router could not resolve a shard for the channel. Surfaced
    /// immediately; the service does not retry it internally.
    #[error(
        "No shard hosts channel '{0}'. Check slot coverage, or increase retry_attempts/retry_interval_ms."
    )]
    NodeNotFound(String),

    /// The acknowledgement watchdog fired before the backend confirmed the
    /// subscription. The registry has been rolled back.
    #[error("Subscription to '{0}' was not acknowledged in time")]
    SubscribeTimeout(String),

    /// Obtaining a pub/sub connection from the backend pool failed after all
    /// configured retries.
    #[error("Could not obtain a pub/sub connection: {0}")]
    ConnectAttemptFailed(String),

    /// A command could not be flushed to the transport, or an in-flight
    /// exchange was abandoned before its acknowledgement.
    #[error("Wire failure: {0}")]
    WireFailure(String),

    /// The connection manager is shutting down.
    #[error("Connection manager is shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PartialEq for SubMuxError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SubMuxError::NodeNotFound(a), SubMuxError::NodeNotFound(b)) => a == b,
            (SubMuxError::SubscribeTimeout(a), SubMuxError::SubscribeTimeout(b)) => a == b,
            (SubMuxError::ConnectAttemptFailed(a), SubMuxError::ConnectAttemptFailed(b)) => a == b,
            (SubMuxError::WireFailure(a), SubMuxError::WireFailure(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for SubMuxError {
    fn from(e: std::io::Error) -> Self {
        SubMuxError::WireFailure(e.to_string())
    }
}

impl From<Arc<std::io::Error>> for SubMuxError {
    fn from(e: Arc<std::io::Error>) -> Self {
        SubMuxError::WireFailure(e.to_string())
    }
}
