//! TCP accept loop, WebSocket upgrade routing, and the concrete
//! WebSocket-backed session.
//!
//! The server binds a listener, upgrades inbound connections, routes each
//! one to the host registered at the request path, and runs the session
//! loop: a writer task draining an outbound channel and a read loop driving
//! the service behavior callbacks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode as WsOpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame as WsFrame;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use async_trait::async_trait;
use hive_frame::{Frame, Opcode};

use crate::config::ServerConfig;
use crate::error::{HiveError, HiveResult};
use crate::host::ServiceHost;
use crate::manager::ServiceManager;
use crate::path;
use crate::session::{ByteStream, CloseArgs, ReadyState, Session};

/// Multi-service WebSocket server.
///
/// Owns the [`ServiceManager`] and the accept loop that feeds it sessions.
#[derive(Debug)]
pub struct HiveServer {
    /// Server configuration.
    config: Arc<ServerConfig>,
    /// The service table and broadcast core.
    manager: Arc<ServiceManager>,
    /// Shutdown signal sender.
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl HiveServer {
    /// Create a server from configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let manager = Arc::new(ServiceManager::new(
            config.fragment_size,
            config.keep_clean,
            config.wait_time,
        ));
        Self {
            config: Arc::new(config),
            manager,
            shutdown_tx: None,
        }
    }

    /// Get the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get access to the service manager.
    #[must_use]
    pub fn manager(&self) -> Arc<ServiceManager> {
        self.manager.clone()
    }

    /// Start the manager and listen for connections until shut down.
    ///
    /// On shutdown the manager drains every session with a 1001 close
    /// frame.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the manager cannot start.
    pub async fn serve(&mut self) -> HiveResult<()> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HiveError::BindFailed(addr, e))?;

        self.manager.start().await?;
        info!(addr = %addr, "hive server listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            self.handle_connection(stream, peer_addr).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        if let Err(e) = self.manager.stop(&CloseArgs::away(), true, true).await {
            debug!(error = %e, "manager already stopped");
        }
        info!("hive server shut down");
        Ok(())
    }

    /// Trigger server shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown signal cannot be sent.
    pub async fn shutdown(&self) -> HiveResult<()> {
        if let Some(tx) = &self.shutdown_tx {
            tx.send(())
                .await
                .map_err(|e| HiveError::ChannelSend(e.to_string()))?;
        }
        Ok(())
    }

    /// Handle a new TCP connection.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!(peer = %peer_addr, "new connection");

        let session_count = self.manager.session_count().await;
        if session_count >= self.config.max_connections {
            warn!(
                peer = %peer_addr,
                current = session_count,
                max = self.config.max_connections,
                "connection rejected: max connections reached"
            );
            return;
        }

        // Capture the request path during the handshake; reject malformed
        // upgrade requests before completing it.
        let (path_tx, path_rx) = std::sync::mpsc::channel::<String>();
        let callback = move |req: &Request, resp: Response| {
            let request_path = req.uri().path().to_string();
            if !path::validate(&request_path) {
                return Err(bad_request("invalid request path"));
            }
            let protocols: Vec<&str> = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').map(str::trim).collect())
                .unwrap_or_default();
            if let Some(dup) = path::first_duplicate(&protocols) {
                debug!(protocol = %dup, "duplicate subprotocol offer");
                return Err(bad_request("duplicate subprotocol"));
            }
            let _ = path_tx.send(request_path);
            Ok(resp)
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "websocket handshake failed");
                return;
            }
        };

        let Ok(request_path) = path_rx.try_recv() else {
            warn!(peer = %peer_addr, "handshake finished without a path");
            return;
        };

        let Some(host) = self.manager.try_get(&request_path).await else {
            debug!(peer = %peer_addr, path = %request_path, "no service at path");
            return;
        };

        info!(peer = %peer_addr, path = %host.path(), "websocket connection established");
        spawn_session(host, ws_stream);
    }
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::BAD_REQUEST;
    resp
}

/// A live WebSocket-backed session.
///
/// Outbound traffic flows through an mpsc channel into a writer task; the
/// read loop bumps a watch counter for pong correlation and advances the
/// ready state through a watch cell for close drains.
pub struct WsSession {
    /// Opaque session identifier.
    id: String,
    /// Buffer/stream fragmentation threshold for streamed sends.
    fragment_size: usize,
    /// Ready state, advanced by the session loop.
    state_tx: watch::Sender<ReadyState>,
    /// Pong counter, bumped by the read loop on every pong.
    pong_rx: watch::Receiver<u64>,
    /// Outbound message channel into the writer task.
    outbound: mpsc::Sender<Message>,
    /// When the session was established.
    connected_at: DateTime<Utc>,
    /// Last inbound frame timestamp.
    last_message_at: parking_lot::Mutex<DateTime<Utc>>,
}

impl WsSession {
    fn new(
        fragment_size: usize,
        state_tx: watch::Sender<ReadyState>,
        pong_rx: watch::Receiver<u64>,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            fragment_size,
            state_tx,
            pong_rx,
            outbound,
            connected_at: now,
            last_message_at: parking_lot::Mutex::new(now),
        }
    }

    /// When the session was established.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// When the last inbound frame arrived.
    #[must_use]
    pub fn last_message_at(&self) -> DateTime<Utc> {
        *self.last_message_at.lock()
    }

    fn touch(&self) {
        *self.last_message_at.lock() = Utc::now();
    }

    fn advance_state(&self, target: ReadyState) {
        self.state_tx.send_if_modified(|current| {
            let forward = state_rank(target) > state_rank(*current);
            if forward {
                *current = target;
            }
            forward
        });
    }

    async fn queue(&self, message: Message) -> HiveResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|e| HiveError::ChannelSend(e.to_string()))
    }

    async fn send_fragment(
        &self,
        data: Vec<u8>,
        opcode: Opcode,
        first: bool,
        fin: bool,
    ) -> HiveResult<()> {
        let code = if first {
            match opcode {
                Opcode::Text => WsOpCode::Data(Data::Text),
                _ => WsOpCode::Data(Data::Binary),
            }
        } else {
            WsOpCode::Data(Data::Continue)
        };
        self.queue(Message::Frame(WsFrame::message(data, code, fin)))
            .await
    }
}

#[async_trait]
impl Session for WsSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn ready_state(&self) -> ReadyState {
        *self.state_tx.borrow()
    }

    async fn send(&self, opcode: Opcode, data: &[u8]) -> HiveResult<()> {
        if !self.ready_state().is_open() {
            return Err(HiveError::SessionNotOpen(self.id.clone()));
        }
        let message = match opcode {
            Opcode::Text => Message::Text(String::from_utf8_lossy(data).into_owned()),
            _ => Message::Binary(data.to_vec()),
        };
        self.queue(message).await
    }

    async fn send_stream(&self, opcode: Opcode, mut stream: ByteStream) -> HiveResult<()> {
        if !self.ready_state().is_open() {
            return Err(HiveError::SessionNotOpen(self.id.clone()));
        }

        // Frames are emitted one read behind the cursor so the final chunk
        // can carry fin.
        let mut pending: Option<Vec<u8>> = None;
        let mut first = true;
        loop {
            let mut buf = vec![0u8; self.fragment_size];
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                let chunk = pending.take().unwrap_or_default();
                self.send_fragment(chunk, opcode, first, true).await?;
                return Ok(());
            }
            buf.truncate(n);
            if let Some(prev) = pending.replace(buf) {
                self.send_fragment(prev, opcode, first, false).await?;
                first = false;
            }
        }
    }

    async fn ping(&self, frame: &[u8], timeout: Duration) -> bool {
        if !self.ready_state().is_open() {
            return false;
        }
        let payload = match Frame::parse(frame) {
            Ok((parsed, _)) => parsed.payload,
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "malformed ping frame");
                return false;
            }
        };

        let mut pong_rx = self.pong_rx.clone();
        let seen = *pong_rx.borrow();
        if self.queue(Message::Ping(payload)).await.is_err() {
            return false;
        }
        tokio::time::timeout(timeout, pong_rx.wait_for(|count| *count > seen))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    async fn close(&self, frame: Option<&[u8]>, timeout: Duration) {
        if self.ready_state() >= ReadyState::Closing {
            return;
        }
        self.advance_state(ReadyState::Closing);

        let message = frame
            .and_then(|bytes| Frame::parse(bytes).ok())
            .map_or(Message::Close(None), |(parsed, _)| {
                let code = parsed
                    .payload
                    .get(..2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .unwrap_or(1000);
                let reason = parsed
                    .payload
                    .get(2..)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Message::Close(Some(CloseFrame {
                    code: code.into(),
                    reason: reason.into(),
                }))
            });

        if self.queue(message).await.is_err() {
            self.advance_state(ReadyState::Closed);
            return;
        }

        let mut state_rx = self.state_tx.subscribe();
        let drained = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state == ReadyState::Closed),
        )
        .await;
        if drained.is_err() {
            debug!(session_id = %self.id, "close drain timed out");
        }
    }
}

impl std::fmt::Debug for WsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSession")
            .field("id", &self.id)
            .field("state", &self.ready_state())
            .finish_non_exhaustive()
    }
}

const fn state_rank(state: ReadyState) -> u8 {
    match state {
        ReadyState::Connecting => 0,
        ReadyState::Open => 1,
        ReadyState::Closing => 2,
        ReadyState::Closed => 3,
    }
}

/// Register a freshly upgraded connection with its host and run the
/// session loop to completion.
fn spawn_session(
    host: Arc<ServiceHost>,
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
) {
    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(64);
    let (state_tx, _state_rx) = watch::channel(ReadyState::Open);
    let (pong_tx, pong_rx) = watch::channel(0u64);

    let session = Arc::new(WsSession::new(
        host.fragment_size(),
        state_tx,
        pong_rx,
        outbound_tx,
    ));

    tokio::spawn(async move {
        let session_dyn: Arc<dyn Session> = session.clone();
        if !host.sessions().add(session_dyn.clone()).await {
            debug!(path = %host.path(), "host not accepting sessions");
            return;
        }

        run_session_loop(&host, &session, &session_dyn, ws_stream, outbound_rx, &pong_tx).await;

        host.sessions().remove(session.id()).await;
        info!(session_id = %session.id(), path = %host.path(), "session removed");
    });
}

/// Drive the read loop and writer task for one session.
async fn run_session_loop(
    host: &Arc<ServiceHost>,
    session: &Arc<WsSession>,
    session_dyn: &Arc<dyn Session>,
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut outbound_rx: mpsc::Receiver<Message>,
    pong_tx: &watch::Sender<u64>,
) {
    let (mut ws_sink, mut ws_read) = ws_stream.split();
    let mut behavior = host.create_behavior();
    behavior.on_open(session_dyn).await;

    let session_id = session.id().to_string();
    let write_task = async {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = ws_sink.send(message).await {
                debug!(session_id = %session_id, error = %e, "write failed");
                break;
            }
        }
    };

    let read_task = async {
        while let Some(msg_result) = ws_read.next().await {
            session.touch();
            match msg_result {
                Ok(Message::Text(text)) => {
                    behavior
                        .on_message(session_dyn, Opcode::Text, text.into_bytes())
                        .await;
                }
                Ok(Message::Binary(data)) => {
                    behavior.on_message(session_dyn, Opcode::Binary, data).await;
                }
                Ok(Message::Ping(_)) => {
                    // Pong reply is handled by the protocol layer.
                }
                Ok(Message::Pong(_)) => {
                    pong_tx.send_modify(|count| *count += 1);
                }
                Ok(Message::Close(_)) => {
                    session.advance_state(ReadyState::Closing);
                    break;
                }
                Ok(Message::Frame(_)) => {
                    // Raw frames are not surfaced by the read path.
                }
                Err(e) => {
                    let err = HiveError::from(e);
                    behavior.on_error(session_dyn, &err).await;
                    break;
                }
            }
        }
    };

    tokio::select! {
        () = write_task => {}
        () = read_task => {}
    }

    session.advance_state(ReadyState::Closed);
    behavior.on_close(session_dyn).await;
}
