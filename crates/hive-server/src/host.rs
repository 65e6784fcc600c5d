//! Path-bound service host.
//!
//! A host binds a behavior factory to one normalized path, owns the session
//! registry for that path, and drives session hygiene: the keep-clean
//! sweeper pings every session each wait-time tick and evicts the ones that
//! stop answering.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use hive_frame::{CloseCode, Frame, Opcode, EMPTY_PING_FRAME};

use crate::error::HiveError;
use crate::registry::SessionRegistry;
use crate::session::{CloseArgs, Session};
use crate::state::{ServerState, StateCell};

/// Per-connection behavior of a service.
///
/// A fresh behavior object is constructed for every accepted session; the
/// host treats it as opaque apart from these callbacks. All hooks default
/// to no-ops so a behavior implements only what it needs.
#[async_trait]
pub trait ServiceBehavior: Send + Sync {
    /// Called once the session is open and registered.
    async fn on_open(&mut self, session: &Arc<dyn Session>) {
        let _ = session;
    }

    /// Called for every complete inbound data message.
    async fn on_message(&mut self, session: &Arc<dyn Session>, opcode: Opcode, data: Vec<u8>) {
        let _ = (session, opcode, data);
    }

    /// Called when the session has closed.
    async fn on_close(&mut self, session: &Arc<dyn Session>) {
        let _ = session;
    }

    /// Called on transport or protocol errors before the session is torn
    /// down.
    async fn on_error(&mut self, session: &Arc<dyn Session>, error: &HiveError) {
        let _ = (session, error);
    }
}

/// Parameterless constructor of per-connection behavior objects.
pub type BehaviorFactory = Arc<dyn Fn() -> Box<dyn ServiceBehavior> + Send + Sync>;

/// An endpoint service bound to one absolute path.
///
/// State, wait-time and the registry are Arc'd so the keep-clean sweeper
/// task can observe them without owning the host.
pub struct ServiceHost {
    /// Normalized absolute path this host serves.
    path: String,
    /// Buffer/stream threshold inherited from the manager.
    fragment_size: usize,
    /// Whether the idle sweeper runs while started.
    keep_clean: bool,
    /// Pong-wait and close-drain deadline, in milliseconds.
    wait_time_ms: Arc<AtomicU64>,
    /// Lifecycle state; never exceeds the manager's state.
    state: Arc<StateCell>,
    /// Sessions upgraded at this path.
    sessions: Arc<SessionRegistry>,
    /// Behavior constructor for accepted connections.
    factory: BehaviorFactory,
    /// Keep-clean sweeper task, while started.
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ServiceHost {
    /// Create a host in the Ready state.
    #[must_use]
    pub fn new(
        path: String,
        factory: BehaviorFactory,
        fragment_size: usize,
        keep_clean: bool,
        wait_time: Duration,
    ) -> Self {
        Self {
            path,
            fragment_size,
            keep_clean,
            wait_time_ms: Arc::new(AtomicU64::new(duration_to_ms(wait_time))),
            state: Arc::new(StateCell::new()),
            sessions: Arc::new(SessionRegistry::new()),
            factory,
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    /// The normalized path this host serves.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The buffer/stream threshold for sends through this host.
    #[must_use]
    pub const fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Whether the idle sweeper runs while the host is started.
    #[must_use]
    pub const fn keep_clean(&self) -> bool {
        self.keep_clean
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.state.get()
    }

    /// The session registry for this host.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    /// Current wait time for pong waits and close drains.
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms.load(Ordering::SeqCst))
    }

    /// Mirror a wait-time change from the manager.
    ///
    /// The sweeper picks the new value up on its next tick.
    pub(crate) fn set_wait_time(&self, wait_time: Duration) {
        self.wait_time_ms
            .store(duration_to_ms(wait_time), Ordering::SeqCst);
    }

    /// Construct a behavior object for a newly accepted session.
    #[must_use]
    pub fn create_behavior(&self) -> Box<dyn ServiceBehavior> {
        (self.factory)()
    }

    /// Start serving: advance to Start and launch the keep-clean sweeper.
    ///
    /// Starting an already-started or stopped host is a no-op.
    pub fn start(&self) {
        if !self.state.try_transition(ServerState::Ready, ServerState::Start) {
            return;
        }
        self.sessions.advance_state(ServerState::Start);
        info!(path = %self.path, "service host started");

        if self.keep_clean {
            let handle = tokio::spawn(sweep_loop(
                self.path.clone(),
                Arc::clone(&self.state),
                Arc::clone(&self.wait_time_ms),
                Arc::clone(&self.sessions),
            ));
            *self.sweeper.lock() = Some(handle);
        }
    }

    /// Stop the host, sending a close frame built from `args` to every
    /// session and draining for up to `timeout`.
    pub async fn stop(&self, args: &CloseArgs, timeout: Duration) {
        let frame = Frame::close(args.code, &args.reason)
            .ok()
            .map(|f| f.serialize());
        self.shutdown_with_frame(frame.as_deref(), timeout).await;
    }

    /// Stop the host with an already-serialized close frame.
    ///
    /// Used by the manager's bulk stop so the frame is serialized exactly
    /// once and shared across hosts.
    pub(crate) async fn shutdown_with_frame(&self, frame: Option<&[u8]>, timeout: Duration) {
        self.state.advance(ServerState::ShuttingDown);

        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        self.sessions.stop(frame, timeout).await;
        self.state.advance(ServerState::Stop);
        info!(path = %self.path, "service host stopped");
    }
}

impl std::fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHost")
            .field("path", &self.path)
            .field("fragment_size", &self.fragment_size)
            .field("keep_clean", &self.keep_clean)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Ping every session each wait-time tick and evict non-responders until
/// the host leaves Start.
async fn sweep_loop(
    path: String,
    state: Arc<StateCell>,
    wait_time_ms: Arc<AtomicU64>,
    sessions: Arc<SessionRegistry>,
) {
    let close_frame = away_close_frame();
    loop {
        let wait = Duration::from_millis(wait_time_ms.load(Ordering::SeqCst));
        tokio::time::sleep(wait).await;
        if !state.is_started() {
            break;
        }
        sessions.sweep(&EMPTY_PING_FRAME, &close_frame, wait).await;
    }
    debug!(path = %path, "sweeper exited");
}

/// Serialized 1001 "Away" close frame for sweeper evictions.
fn away_close_frame() -> Vec<u8> {
    Frame::close(CloseCode::Away, "")
        .map(|f| f.serialize())
        .unwrap_or_default()
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
