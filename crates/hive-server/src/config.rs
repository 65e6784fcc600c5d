//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default threshold above which broadcasts switch from the buffer path to
/// the stream path.
pub const DEFAULT_FRAGMENT_SIZE: usize = 1016;

/// Default wait time for pong replies and close drains.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(1);

/// Configuration for the hive server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket server to.
    pub bind_addr: SocketAddr,
    /// Maximum number of concurrent connections across all services.
    pub max_connections: usize,
    /// Payload size above which broadcasts take the stream path and sends
    /// are fragmented.
    pub fragment_size: usize,
    /// Whether hosts sweep out sessions that stop answering pings.
    pub keep_clean: bool,
    /// Wait time for pong replies and close drains.
    pub wait_time: Duration,
}

impl ServerConfig {
    /// Create a new configuration with the specified bind address.
    #[must_use]
    pub const fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            keep_clean: true,
            wait_time: DEFAULT_WAIT_TIME,
        }
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the fragment size threshold.
    ///
    /// Values below 1 are clamped to 1.
    #[must_use]
    pub const fn with_fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = if size == 0 { 1 } else { size };
        self
    }

    /// Enable or disable the per-host idle sweeper.
    #[must_use]
    pub const fn with_keep_clean(mut self, keep_clean: bool) -> Self {
        self.keep_clean = keep_clean;
        self
    }

    /// Set the wait time used for pong waits and shutdown drains.
    ///
    /// A zero duration is ignored and the default is kept; the manager
    /// setter performs the same validation on later writes.
    #[must_use]
    pub const fn with_wait_time(mut self, wait_time: Duration) -> Self {
        if !wait_time.is_zero() {
            self.wait_time = wait_time;
        }
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(([0, 0, 0, 0], 8080).into())
    }
}
