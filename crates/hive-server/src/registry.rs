//! Per-host session registry: concurrency-safe session table plus the
//! broadcast, broadping and close-drain fan-out helpers the manager relies
//! on.
//!
//! Fan-out always operates on a snapshot of the session table taken at call
//! time; sessions joining mid-broadcast may miss the message and sessions
//! leaving mid-broadcast surface as a failed send. Iteration order is
//! implementation-defined.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use hive_frame::Opcode;

use crate::session::Session;
use crate::state::{ServerState, StateCell};

/// Byte buffer shared across per-session stream readers.
///
/// The stream-path broadcast materializes its source into one buffer and
/// hands every session an independent cursor over it, so a single forward
/// cursor from the caller never has to be re-read.
#[derive(Debug, Clone)]
pub struct SharedBuf(Arc<Vec<u8>>);

impl SharedBuf {
    /// Wrap a materialized buffer for shared reading.
    #[must_use]
    pub fn new(data: Arc<Vec<u8>>) -> Self {
        Self(data)
    }
}

impl AsRef<[u8]> for SharedBuf {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Concurrency-safe mapping from session id to live session.
#[derive(Default)]
pub struct SessionRegistry {
    /// Sessions indexed by id.
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
    /// Lifecycle state mirroring the owning host.
    state: StateCell,
}

impl SessionRegistry {
    /// Create an empty registry in the Ready state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            state: StateCell::new(),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    pub(crate) fn advance_state(&self, target: ServerState) {
        self.state.advance(target);
    }

    /// Register a session.
    ///
    /// Returns false if the registry is shutting down or the id is already
    /// taken.
    pub async fn add(&self, session: Arc<dyn Session>) -> bool {
        if self.state.get() >= ServerState::ShuttingDown {
            return false;
        }
        let id = session.id().to_string();
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            warn!(session_id = %id, "session id already registered");
            return false;
        }
        sessions.insert(id, session);
        true
    }

    /// Remove a session by id. Returns true if it was present.
    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Look up a session by id.
    pub async fn get(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Check if the registry holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Ids of all registered sessions.
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Copy the current session set for fan-out.
    pub async fn snapshot(&self) -> Vec<Arc<dyn Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn snapshot_with_ids(&self) -> Vec<(String, Arc<dyn Session>)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }

    /// Send one data message to every session in parallel.
    ///
    /// Resolves to the conjunction of per-session results: true only if
    /// every send succeeded.
    pub async fn broadcast(&self, opcode: Opcode, data: &[u8]) -> bool {
        let snapshot = self.snapshot().await;
        let sends = snapshot.iter().map(|session| async move {
            match session.send(opcode, data).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(session_id = %session.id(), error = %e, "broadcast send failed");
                    false
                }
            }
        });
        join_all(sends).await.into_iter().all(|ok| ok)
    }

    /// Send one data message through the stream path to every session in
    /// parallel, each session reading an independent cursor over the shared
    /// buffer.
    pub async fn broadcast_fragmented(&self, opcode: Opcode, buffer: Arc<Vec<u8>>) -> bool {
        let snapshot = self.snapshot().await;
        let sends = snapshot.iter().map(|session| {
            let reader = Cursor::new(SharedBuf::new(buffer.clone()));
            async move {
                match session.send_stream(opcode, Box::new(reader)).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(session_id = %session.id(), error = %e, "stream broadcast failed");
                        false
                    }
                }
            }
        });
        join_all(sends).await.into_iter().all(|ok| ok)
    }

    /// Send a pre-serialized ping frame to every open session and correlate
    /// the pongs.
    ///
    /// Sessions not open at the instant of dispatch are recorded as false.
    pub async fn broadping(&self, frame: &[u8], timeout: Duration) -> HashMap<String, bool> {
        let snapshot = self.snapshot_with_ids().await;
        let pings = snapshot.iter().map(|(id, session)| async move {
            let received = if session.ready_state().is_open() {
                session.ping(frame, timeout).await
            } else {
                false
            };
            (id.clone(), received)
        });
        join_all(pings).await.into_iter().collect()
    }

    /// Ping every session and evict the ones that fail to pong.
    ///
    /// Evicted sessions are sent `close_frame` and removed from the table.
    pub async fn sweep(&self, ping_frame: &[u8], close_frame: &[u8], timeout: Duration) {
        let results = self.broadping(ping_frame, timeout).await;
        for (id, received) in results {
            if received {
                continue;
            }
            if let Some(session) = self.get(&id).await {
                debug!(session_id = %id, "sweeping unresponsive session");
                session.close(Some(close_frame), timeout).await;
            }
            self.remove(&id).await;
        }
    }

    /// Stop the registry: close every session and clear the table.
    ///
    /// Each session is sent `frame` (when given), then allowed up to
    /// `timeout` for an orderly close.
    pub async fn stop(&self, frame: Option<&[u8]>, timeout: Duration) {
        self.state.advance(ServerState::ShuttingDown);

        let drained: Vec<Arc<dyn Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        let closes = drained
            .iter()
            .map(|session| async move { session.close(frame, timeout).await });
        join_all(closes).await;

        self.state.advance(ServerState::Stop);
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
