//! Hive server binary.
//!
//! Serves a demo echo service at `/echo` and logs lifecycle events.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hive_frame::Opcode;
use hive_server::{HiveServer, ServerConfig, ServiceBehavior, Session};

/// Echoes every inbound message back to its sender.
struct EchoBehavior;

#[async_trait]
impl ServiceBehavior for EchoBehavior {
    async fn on_open(&mut self, session: &Arc<dyn Session>) {
        info!(session_id = %session.id(), "echo session opened");
    }

    async fn on_message(&mut self, session: &Arc<dyn Session>, opcode: Opcode, data: Vec<u8>) {
        if let Err(e) = session.send(opcode, &data).await {
            error!(session_id = %session.id(), error = %e, "echo send failed");
        }
    }

    async fn on_close(&mut self, session: &Arc<dyn Session>) {
        info!(session_id = %session.id(), "echo session closed");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let bind_addr: SocketAddr = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| "0.0.0.0:8080".parse().expect("valid default addr"));

    info!("Starting hive server on {}", bind_addr);
    info!("  Echo endpoint: ws://{}/echo", bind_addr);

    let config = ServerConfig::new(bind_addr).with_max_connections(1000);
    let mut server = HiveServer::new(config);

    if let Err(e) = server.manager().add("/echo", || EchoBehavior).await {
        error!("failed to register echo service: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = server.serve().await {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}
