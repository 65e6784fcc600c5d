//! Session capability surface.
//!
//! The registry and manager treat a live connection as an opaque capability
//! object: it can send, ping, and close, and it reports its id and ready
//! state. The concrete WebSocket-backed implementation lives in
//! [`crate::server`]; tests substitute in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use hive_frame::{CloseCode, Opcode};

use crate::error::HiveResult;

/// Ready state of a session, mirroring the WebSocket connection states.
///
/// States are ordered by lifecycle progression and never move backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    /// Handshake not yet complete.
    Connecting,
    /// Connection is open for traffic.
    Open,
    /// Close handshake in progress.
    Closing,
    /// Connection is closed.
    Closed,
}

impl ReadyState {
    /// Check if the session can accept outbound traffic.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Arguments describing how a close should be reported to peers.
#[derive(Debug, Clone)]
pub struct CloseArgs {
    /// Close status code.
    pub code: CloseCode,
    /// Human-readable reason, empty for none.
    pub reason: String,
}

impl CloseArgs {
    /// Create close arguments from a code and reason.
    #[must_use]
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Close arguments for an endpoint going away (code 1001).
    #[must_use]
    pub fn away() -> Self {
        Self::new(CloseCode::Away, "")
    }
}

impl Default for CloseArgs {
    fn default() -> Self {
        Self::new(CloseCode::Normal, "")
    }
}

/// A source of bytes for the stream-oriented send path.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Capability surface of one live WebSocket session.
///
/// Implementations must be safe to share across the broadcast fan-out:
/// every method takes `&self` and may be invoked concurrently.
#[async_trait]
pub trait Session: Send + Sync {
    /// Opaque session identifier, unique within a host.
    fn id(&self) -> &str;

    /// Current ready state.
    fn ready_state(&self) -> ReadyState;

    /// Send a single data message.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not open or the transport fails.
    async fn send(&self, opcode: Opcode, data: &[u8]) -> HiveResult<()>;

    /// Send a data message from a stream, fragmenting at the session's
    /// fragment size.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not open, the stream fails to
    /// read, or the transport fails.
    async fn send_stream(&self, opcode: Opcode, stream: ByteStream) -> HiveResult<()>;

    /// Send a pre-serialized ping frame and wait up to `timeout` for the
    /// matching pong.
    ///
    /// Returns true if a pong arrived within the timeout.
    async fn ping(&self, frame: &[u8], timeout: Duration) -> bool;

    /// Send a pre-serialized close frame (when given) and wait up to
    /// `timeout` for the close handshake to finish.
    async fn close(&self, frame: Option<&[u8]>, timeout: Duration);
}
