//! End-to-end broadcast and lifecycle flows driven through the public API
//! with in-memory sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use hive_frame::{Frame, Opcode};
use hive_server::{
    ByteStream, CloseArgs, HiveError, HiveResult, ReadyState, ServiceBehavior, ServiceManager,
    Session,
};

// ==================== Test Harness ====================

struct NullBehavior;

#[async_trait]
impl ServiceBehavior for NullBehavior {}

/// One message recorded by a test session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Received {
    opcode: Opcode,
    data: Vec<u8>,
    streamed: bool,
}

/// In-memory session capturing all traffic.
struct TestSession {
    id: String,
    ready: Mutex<ReadyState>,
    received: Mutex<Vec<Received>>,
    pings: Mutex<Vec<Vec<u8>>>,
    closes: Mutex<Vec<Option<Vec<u8>>>>,
    pong_reply: bool,
    send_delay: Duration,
}

impl TestSession {
    fn open(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ready: Mutex::new(ReadyState::Open),
            received: Mutex::new(Vec::new()),
            pings: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            pong_reply: true,
            send_delay: Duration::ZERO,
        })
    }

    fn closed(id: &str) -> Arc<Self> {
        let session = Self::open(id);
        *session.ready.lock() = ReadyState::Closed;
        session
    }

    fn slow(id: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ready: Mutex::new(ReadyState::Open),
            received: Mutex::new(Vec::new()),
            pings: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            pong_reply: true,
            send_delay: delay,
        })
    }
}

#[async_trait]
impl Session for TestSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn ready_state(&self) -> ReadyState {
        *self.ready.lock()
    }

    async fn send(&self, opcode: Opcode, data: &[u8]) -> HiveResult<()> {
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        if !self.ready_state().is_open() {
            return Err(HiveError::SessionNotOpen(self.id.clone()));
        }
        self.received.lock().push(Received {
            opcode,
            data: data.to_vec(),
            streamed: false,
        });
        Ok(())
    }

    async fn send_stream(&self, opcode: Opcode, mut stream: ByteStream) -> HiveResult<()> {
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        self.received.lock().push(Received {
            opcode,
            data,
            streamed: true,
        });
        Ok(())
    }

    async fn ping(&self, frame: &[u8], _timeout: Duration) -> bool {
        self.pings.lock().push(frame.to_vec());
        self.pong_reply
    }

    async fn close(&self, frame: Option<&[u8]>, _timeout: Duration) {
        self.closes.lock().push(frame.map(<[u8]>::to_vec));
        *self.ready.lock() = ReadyState::Closed;
    }
}

async fn started_manager(paths: &[&str]) -> ServiceManager {
    let manager = ServiceManager::new(1024, false, Duration::from_secs(1));
    for p in paths {
        manager.add(p, || NullBehavior).await.unwrap();
    }
    manager.start().await.unwrap();
    manager
}

async fn attach(manager: &ServiceManager, path: &str, session: Arc<TestSession>) {
    let host = manager.try_get(path).await.expect("host must exist");
    assert!(host.sessions().add(session).await);
}

// ==================== Scenario: duplicate registration ====================

#[tokio::test]
async fn equivalent_paths_register_once() {
    let manager = ServiceManager::new(1024, false, Duration::from_secs(1));
    manager.add("/chat", || NullBehavior).await.unwrap();
    manager.add("/chat/", || NullBehavior).await.unwrap();

    assert_eq!(manager.paths().await, vec!["/chat".to_string()]);
    assert_eq!(manager.count().await, 1);
}

// ==================== Scenario: text broadcast ====================

#[tokio::test]
async fn text_broadcast_reaches_every_session_as_one_frame() {
    let manager = started_manager(&["/chat"]).await;
    let s1 = TestSession::open("s1");
    let s2 = TestSession::open("s2");
    attach(&manager, "/chat", s1.clone()).await;
    attach(&manager, "/chat", s2.clone()).await;

    assert!(manager.broadcast_text("hi").await);

    for session in [&s1, &s2] {
        let received = session.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].opcode, Opcode::Text);
        assert_eq!(received[0].data, vec![0x68, 0x69]);
        assert!(!received[0].streamed);
    }
}

// ==================== Scenario: large broadcast takes stream path ====================

#[tokio::test]
async fn large_broadcast_is_reconstructible_through_stream_path() {
    let manager = started_manager(&["/chat"]).await;
    let s1 = TestSession::open("s1");
    attach(&manager, "/chat", s1.clone()).await;

    let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
    assert!(manager.broadcast_binary(&payload).await);

    let received = s1.received.lock();
    assert_eq!(received.len(), 1);
    assert!(received[0].streamed);
    assert_eq!(received[0].opcode, Opcode::Binary);
    assert_eq!(received[0].data, payload);
}

// ==================== Scenario: broadping correlation ====================

#[tokio::test]
async fn broadping_records_open_and_closed_sessions() {
    let manager = started_manager(&["/chat"]).await;
    attach(&manager, "/chat", TestSession::open("s1")).await;
    attach(&manager, "/chat", TestSession::closed("s2")).await;

    let results = manager.broadping_text("x").await;

    assert_eq!(results.len(), 1);
    let chat = &results["/chat"];
    assert_eq!(chat.len(), 2);
    assert!(chat["s1"]);
    assert!(!chat["s2"]);
}

#[tokio::test]
async fn broadping_frame_carries_text_payload_unmasked() {
    let manager = started_manager(&["/chat"]).await;
    let s1 = TestSession::open("s1");
    attach(&manager, "/chat", s1.clone()).await;

    manager.broadping_text("x").await;

    let frame_bytes = s1.pings.lock()[0].clone();
    let (frame, _) = Frame::parse(&frame_bytes).unwrap();
    assert_eq!(frame.opcode, Opcode::Ping);
    assert_eq!(frame.payload, b"x");
    assert!(!frame.is_masked());
}

// ==================== Scenario: oversized ping payload ====================

#[tokio::test]
async fn oversized_ping_payload_sends_no_frames() {
    let manager = started_manager(&["/chat"]).await;
    let s1 = TestSession::open("s1");
    attach(&manager, "/chat", s1.clone()).await;

    let payload = "p".repeat(126);
    let results = manager.broadping_text(&payload).await;

    assert!(results.is_empty());
    assert!(s1.pings.lock().is_empty());
}

// ==================== Scenario: stop during in-flight broadcast ====================

#[tokio::test]
async fn stop_during_broadcast_leaves_clean_end_state() {
    let manager = Arc::new(started_manager(&["/a", "/b", "/c"]).await);
    for (path, id) in [("/a", "sa"), ("/b", "sb"), ("/c", "sc")] {
        attach(&manager, path, TestSession::slow(id, Duration::from_millis(50))).await;
    }

    let broadcaster = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.broadcast_text("going down").await })
    };
    // Let the fan-out begin, then stop with close frames and zero drain.
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.stop(&CloseArgs::away(), true, false).await.unwrap();

    // The in-flight broadcast resolves to its partial conjunction rather
    // than hanging or erroring.
    let _partial = broadcaster.await.unwrap();

    assert_eq!(manager.state(), hive_server::ServerState::Stop);
    assert_eq!(manager.count().await, 0);
    assert!(matches!(
        manager.add("/later", || NullBehavior).await,
        Err(HiveError::InvalidState { .. })
    ));
    assert!(!manager.broadcast_text("after").await);
}

// ==================== Scenario: removal closes with 1001 ====================

#[tokio::test]
async fn removing_started_service_sends_away_close() {
    let manager = started_manager(&["/chat"]).await;
    let s1 = TestSession::open("s1");
    attach(&manager, "/chat", s1.clone()).await;

    assert!(manager.remove("/chat").await.unwrap());
    assert!(manager.try_get("/chat").await.is_none());

    let closes = s1.closes.lock();
    let bytes = closes[0].clone().expect("close frame expected");
    let (frame, _) = Frame::parse(&bytes).unwrap();
    assert_eq!(frame.opcode, Opcode::Close);
    assert_eq!(&frame.payload[..2], &1001u16.to_be_bytes());
}
