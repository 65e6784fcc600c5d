//! Error types for the hive server.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors that can occur in the hive server.
///
/// Ordinary operational violations (broadcast while stopped, oversized ping
/// payload, missing host) are reported as `false` / `None` / empty maps by
/// the operations themselves; this enum covers construction, lifecycle
/// misuse and transport faults.
#[derive(Debug, Error)]
pub enum HiveError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, std::io::Error),

    /// Path is empty, not absolute, or contains a query or fragment.
    #[error("invalid service path: {0:?}")]
    InvalidPath(String),

    /// Operation is not permitted in the current lifecycle state.
    #[error("operation {operation} not permitted in state {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the component was in.
        state: crate::state::ServerState,
    },

    /// Wait time must be a positive duration.
    #[error("wait time must be greater than zero")]
    InvalidWaitTime,

    /// WebSocket error occurred.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Frame codec error.
    #[error("frame error: {0}")]
    Frame(#[from] hive_frame::FrameError),

    /// Session send channel is closed or full.
    #[error("session channel error: {0}")]
    ChannelSend(String),

    /// Session is not open.
    #[error("session {0} is not open")]
    SessionNotOpen(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for HiveError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type for server operations.
pub type HiveResult<T> = Result<T, HiveError>;
