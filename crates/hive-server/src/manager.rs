//! Service manager: the path→host table and the cross-service broadcast
//! core.
//!
//! The manager owns every [`ServiceHost`], drives the shared lifecycle
//! (Ready → Start → ShuttingDown → Stop), propagates wait-time changes, and
//! fans broadcasts and broadpings out across all hosts with snapshot
//! iteration. Fan-out is soft-cancelled by the lifecycle state: once the
//! manager leaves Start, hosts not yet dispatched are skipped while
//! in-flight per-host work is left to finish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use hive_frame::{Frame, Opcode, EMPTY_PING_FRAME, MAX_CONTROL_PAYLOAD};

use crate::config::DEFAULT_WAIT_TIME;
use crate::error::{HiveError, HiveResult};
use crate::host::{BehaviorFactory, ServiceBehavior, ServiceHost};
use crate::path;
use crate::session::CloseArgs;
use crate::state::{ServerState, StateCell};

/// Per-path pong-correlation results of a broadping, keyed by normalized
/// path, then by session id.
pub type BroadpingResults = HashMap<String, HashMap<String, bool>>;

/// Registry of endpoint services and the broadcast/broadping fan-out core.
pub struct ServiceManager {
    /// Buffer/stream threshold shared with every host. Immutable.
    fragment_size: usize,
    /// Whether hosts run the idle sweeper. Immutable.
    keep_clean: bool,
    /// Pong-wait and close-drain deadline, in milliseconds.
    wait_time_ms: AtomicU64,
    /// Manager lifecycle state; monotonic.
    state: StateCell,
    /// Hosts keyed by normalized path.
    hosts: RwLock<HashMap<String, Arc<ServiceHost>>>,
    /// Serializes start/stop so the state machine transitions once.
    lifecycle: Mutex<()>,
}

impl ServiceManager {
    /// Create a manager in the Ready state.
    ///
    /// `fragment_size` is clamped to at least 1. A zero `wait_time` falls
    /// back to the 1-second default; later writes go through
    /// [`Self::set_wait_time`] which rejects zero outright.
    #[must_use]
    pub fn new(fragment_size: usize, keep_clean: bool, wait_time: Duration) -> Self {
        let wait = if wait_time.is_zero() {
            DEFAULT_WAIT_TIME
        } else {
            wait_time
        };
        Self {
            fragment_size: fragment_size.max(1),
            keep_clean,
            wait_time_ms: AtomicU64::new(duration_to_ms(wait)),
            state: StateCell::new(),
            hosts: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
        }
    }

    // ==================== Accessors ====================

    /// The buffer/stream threshold for broadcasts.
    #[must_use]
    pub const fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Whether hosts sweep idle sessions.
    #[must_use]
    pub const fn keep_clean(&self) -> bool {
        self.keep_clean
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    /// Current wait time for pong waits and shutdown drains.
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms.load(Ordering::SeqCst))
    }

    /// Number of registered services.
    pub async fn count(&self) -> usize {
        self.hosts.read().await.len()
    }

    /// Normalized paths of every registered service.
    pub async fn paths(&self) -> Vec<String> {
        self.hosts.read().await.keys().cloned().collect()
    }

    /// Snapshot of every registered host.
    pub async fn hosts(&self) -> Vec<Arc<ServiceHost>> {
        self.hosts.read().await.values().cloned().collect()
    }

    /// Total number of live sessions across all hosts.
    ///
    /// Zero unless the manager is started.
    pub async fn session_count(&self) -> usize {
        if !self.state.is_started() {
            return 0;
        }
        let snapshot = self.hosts().await;
        let counts = snapshot.iter().map(|host| host.session_count());
        join_all(counts).await.into_iter().sum()
    }

    // ==================== Registration ====================

    /// Register a service at `service_path`.
    ///
    /// The path is normalized before insertion; registering a path that is
    /// already present is a silent no-op. A host added to a started manager
    /// is started before it becomes visible.
    ///
    /// # Errors
    ///
    /// Returns [`HiveError::InvalidPath`] if the path fails validation and
    /// [`HiveError::InvalidState`] once the manager is shutting down.
    pub async fn add<F, B>(&self, service_path: &str, factory: F) -> HiveResult<()>
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: ServiceBehavior + 'static,
    {
        let factory: BehaviorFactory =
            Arc::new(move || Box::new(factory()) as Box<dyn ServiceBehavior>);
        self.add_host(service_path, factory).await
    }

    async fn add_host(&self, service_path: &str, factory: BehaviorFactory) -> HiveResult<()> {
        if !path::validate(service_path) {
            return Err(HiveError::InvalidPath(service_path.to_string()));
        }
        let state = self.state.get();
        if state >= ServerState::ShuttingDown {
            return Err(HiveError::InvalidState {
                operation: "add",
                state,
            });
        }

        let normalized = path::normalize(service_path);

        // Fast path: already registered.
        if self.hosts.read().await.contains_key(&normalized) {
            debug!(path = %normalized, "service already registered");
            return Ok(());
        }

        let host = Arc::new(ServiceHost::new(
            normalized.clone(),
            factory,
            self.fragment_size,
            self.keep_clean,
            self.wait_time(),
        ));

        let mut hosts = self.hosts.write().await;

        // Re-check under the write lock: the state may have advanced and
        // another adder may have won the path.
        let state = self.state.get();
        if state >= ServerState::ShuttingDown {
            return Err(HiveError::InvalidState {
                operation: "add",
                state,
            });
        }
        if hosts.contains_key(&normalized) {
            debug!(path = %normalized, "service registered concurrently");
            return Ok(());
        }

        if state.is_started() {
            host.start();
        }
        let displaced = hosts.insert(normalized.clone(), host);
        // Presence was checked under this same write lock.
        debug_assert!(displaced.is_none());

        info!(path = %normalized, "service registered");
        Ok(())
    }

    /// Remove the service at `service_path`.
    ///
    /// A started host has its sessions closed with status 1001 before the
    /// call returns. Returns false if no service was registered at the
    /// normalized path.
    ///
    /// # Errors
    ///
    /// Returns [`HiveError::InvalidPath`] if the path fails validation.
    pub async fn remove(&self, service_path: &str) -> HiveResult<bool> {
        if !path::validate(service_path) {
            return Err(HiveError::InvalidPath(service_path.to_string()));
        }
        let normalized = path::normalize(service_path);

        let Some(host) = self.hosts.write().await.remove(&normalized) else {
            return Ok(false);
        };

        if host.state().is_started() {
            host.stop(&CloseArgs::away(), self.wait_time()).await;
        }
        info!(path = %normalized, "service removed");
        Ok(true)
    }

    /// Look up the host serving `service_path`.
    ///
    /// Returns `None` unless the manager is started and the path is a
    /// valid absolute path with a registered host.
    pub async fn try_get(&self, service_path: &str) -> Option<Arc<ServiceHost>> {
        if !self.state.is_started() {
            return None;
        }
        if !path::validate(service_path) {
            return None;
        }
        let normalized = path::normalize(service_path);
        self.hosts.read().await.get(&normalized).cloned()
    }

    // ==================== Lifecycle ====================

    /// Start the manager: start every registered host, then enter Start.
    ///
    /// # Errors
    ///
    /// Returns [`HiveError::InvalidState`] unless the manager is Ready;
    /// start is a once-only transition.
    pub async fn start(&self) -> HiveResult<()> {
        let _guard = self.lifecycle.lock().await;
        let state = self.state.get();
        if state != ServerState::Ready {
            return Err(HiveError::InvalidState {
                operation: "start",
                state,
            });
        }

        // Hold the write lock across host starts and the state change so a
        // concurrent add observes either a Ready manager or a Start manager
        // with every prior host already started.
        let hosts = self.hosts.write().await;
        for host in hosts.values() {
            host.start();
        }
        self.state.advance(ServerState::Start);
        info!(services = hosts.len(), "service manager started");
        Ok(())
    }

    /// Stop the manager: drain every host, clear the table, enter Stop.
    ///
    /// When `send_close` is set, a close frame built from `args` is
    /// serialized once and shared across every session. The drain deadline
    /// is the manager wait time when `wait` is set, zero otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`HiveError::InvalidState`] unless the manager is started.
    pub async fn stop(&self, args: &CloseArgs, send_close: bool, wait: bool) -> HiveResult<()> {
        let _guard = self.lifecycle.lock().await;
        let state = self.state.get();
        if state != ServerState::Start {
            return Err(HiveError::InvalidState {
                operation: "stop",
                state,
            });
        }
        self.state.advance(ServerState::ShuttingDown);

        let frame = if send_close {
            match Frame::close(args.code, &args.reason) {
                Ok(frame) => Some(frame.serialize()),
                Err(e) => {
                    warn!(error = %e, "close frame rejected, stopping without one");
                    None
                }
            }
        } else {
            None
        };
        let timeout = if wait { self.wait_time() } else { Duration::ZERO };

        let snapshot = self.hosts().await;
        let frame_ref = frame.as_deref();
        let drains = snapshot
            .iter()
            .map(|host| host.shutdown_with_frame(frame_ref, timeout));
        join_all(drains).await;

        self.hosts.write().await.clear();
        self.state.advance(ServerState::Stop);
        info!("service manager stopped");
        Ok(())
    }

    /// Update the wait time and propagate it to every host.
    ///
    /// The manager's value is written before any host's, so a reader that
    /// observes the new value on a host also observes it on the manager.
    ///
    /// # Errors
    ///
    /// Returns [`HiveError::InvalidWaitTime`] for a zero duration.
    pub async fn set_wait_time(&self, wait_time: Duration) -> HiveResult<()> {
        if wait_time.is_zero() {
            return Err(HiveError::InvalidWaitTime);
        }
        if wait_time == self.wait_time() {
            return Ok(());
        }
        self.wait_time_ms
            .store(duration_to_ms(wait_time), Ordering::SeqCst);
        for host in self.hosts().await {
            host.set_wait_time(wait_time);
        }
        Ok(())
    }

    // ==================== Broadcasts ====================

    /// Broadcast a binary message to every session of every started host.
    ///
    /// Payloads above the fragment size take the stream path. Resolves to
    /// the conjunction of per-host results; false when the manager is not
    /// started.
    pub async fn broadcast_binary(&self, data: &[u8]) -> bool {
        self.broadcast_data(Opcode::Binary, data).await
    }

    /// Broadcast a UTF-8 text message to every session of every started
    /// host.
    pub async fn broadcast_text(&self, text: &str) -> bool {
        self.broadcast_data(Opcode::Text, text.as_bytes()).await
    }

    /// Broadcast the contents of a stream as a binary message.
    ///
    /// The stream is materialized into one buffer, then every session
    /// reads an independent cursor over it. Callers with very large
    /// payloads should prefer per-session sends over broadcast.
    pub async fn broadcast_stream<R>(&self, mut stream: R) -> bool
    where
        R: AsyncRead + Send + Unpin,
    {
        if !self.state.is_started() {
            return false;
        }
        let mut buffer = Vec::new();
        if let Err(e) = stream.read_to_end(&mut buffer).await {
            warn!(error = %e, "broadcast stream failed to read");
            return false;
        }
        self.fan_out_fragmented(Opcode::Binary, Arc::new(buffer))
            .await
    }

    async fn broadcast_data(&self, opcode: Opcode, data: &[u8]) -> bool {
        if !self.state.is_started() {
            return false;
        }
        if data.len() <= self.fragment_size {
            self.fan_out_buffer(opcode, data).await
        } else {
            self.fan_out_fragmented(opcode, Arc::new(data.to_vec()))
                .await
        }
    }

    async fn fan_out_buffer(&self, opcode: Opcode, data: &[u8]) -> bool {
        let snapshot = self.hosts().await;
        let sends: Vec<_> = snapshot
            .iter()
            .take_while(|_| self.state.is_started())
            .map(|host| async move {
                if !self.state.is_started() {
                    return true;
                }
                host.sessions().broadcast(opcode, data).await
            })
            .collect();
        join_all(sends).await.into_iter().all(|ok| ok)
    }

    async fn fan_out_fragmented(&self, opcode: Opcode, buffer: Arc<Vec<u8>>) -> bool {
        let snapshot = self.hosts().await;
        let sends: Vec<_> = snapshot
            .iter()
            .take_while(|_| self.state.is_started())
            .map(|host| {
                let buffer = buffer.clone();
                async move {
                    if !self.state.is_started() {
                        return true;
                    }
                    host.sessions().broadcast_fragmented(opcode, buffer).await
                }
            })
            .collect();
        join_all(sends).await.into_iter().all(|ok| ok)
    }

    // ==================== Broadpings ====================

    /// Ping every session of every started host with an empty payload.
    ///
    /// Returns pong-correlation results keyed by path then session id;
    /// empty when the manager is not started.
    pub async fn broadping(&self) -> BroadpingResults {
        if !self.state.is_started() {
            return BroadpingResults::new();
        }
        self.fan_out_ping(&EMPTY_PING_FRAME).await
    }

    /// Ping every session of every started host with a textual payload.
    ///
    /// An empty payload degenerates to the default broadping. Payloads
    /// above the 125-byte control-frame ceiling yield an empty result and
    /// no frames are sent.
    pub async fn broadping_text(&self, message: &str) -> BroadpingResults {
        if !self.state.is_started() {
            return BroadpingResults::new();
        }
        if message.is_empty() {
            return self.fan_out_ping(&EMPTY_PING_FRAME).await;
        }
        if message.len() > MAX_CONTROL_PAYLOAD {
            warn!(
                len = message.len(),
                "ping payload exceeds control frame ceiling"
            );
            return BroadpingResults::new();
        }
        let frame = match Frame::ping(message.as_bytes().to_vec(), false) {
            Ok(frame) => frame.serialize(),
            Err(e) => {
                warn!(error = %e, "ping frame rejected");
                return BroadpingResults::new();
            }
        };
        self.fan_out_ping(&frame).await
    }

    async fn fan_out_ping(&self, frame: &[u8]) -> BroadpingResults {
        let timeout = self.wait_time();
        let snapshot = self.hosts().await;
        let pings: Vec<_> = snapshot
            .iter()
            .take_while(|_| self.state.is_started())
            .map(|host| async move {
                if !self.state.is_started() {
                    return None;
                }
                let replies = host.sessions().broadping(frame, timeout).await;
                Some((host.path().to_string(), replies))
            })
            .collect();
        join_all(pings).await.into_iter().flatten().collect()
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("fragment_size", &self.fragment_size)
            .field("keep_clean", &self.keep_clean)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
