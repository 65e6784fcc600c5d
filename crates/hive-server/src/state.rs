//! Lifecycle states shared by the manager, hosts and session registries.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of the manager, a host, or a registry.
///
/// States only ever progress forward: Ready → Start → ShuttingDown → Stop.
/// ShuttingDown and Stop are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ServerState {
    /// Created, not yet serving.
    Ready = 0,
    /// Serving sessions.
    Start = 1,
    /// Draining sessions on the way to Stop.
    ShuttingDown = 2,
    /// Fully stopped.
    Stop = 3,
}

impl ServerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Start,
            2 => Self::ShuttingDown,
            _ => Self::Stop,
        }
    }

    /// Check if the component is serving.
    #[must_use]
    pub const fn is_started(self) -> bool {
        matches!(self, Self::Start)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Start => write!(f, "start"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Monotonic atomic holder for a [`ServerState`].
///
/// `advance` uses `fetch_max`, so a racing writer can never move the state
/// backward and readers observe a monotonic progression.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    /// Create a cell in the Ready state.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(ServerState::Ready as u8))
    }

    /// Read the current state.
    #[must_use]
    pub fn get(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Check if the cell is in Start.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.get().is_started()
    }

    /// Move the state forward to `target`, never backward.
    pub fn advance(&self, target: ServerState) {
        self.0.fetch_max(target as u8, Ordering::SeqCst);
    }

    /// Atomically transition from `from` to `to`.
    ///
    /// Returns false if the current state was not `from`.
    pub fn try_transition(&self, from: ServerState, to: ServerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
