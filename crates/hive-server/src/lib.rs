//! # hive-server
//!
//! Multi-service WebSocket server: one TCP listener, many endpoint
//! services, each bound to an absolute URL path and owning every session
//! that upgraded there.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────────────┐
//! │    client    │◄──────────────────►│      HiveServer      │
//! └──────────────┘     /chat          │                      │
//!                                     │  ┌────────────────┐  │
//! ┌──────────────┐                    │  │ ServiceManager │  │
//! │    client    │◄──────────────────►│  │  path → host   │  │
//! └──────────────┘     /echo          │  └───────┬────────┘  │
//!                                     │          │           │
//!                                     │  ┌───────▼────────┐  │
//!                                     │  │  ServiceHost   │  │
//!                                     │  │ ┌────────────┐ │  │
//!                                     │  │ │ SessionReg-│ │  │
//!                                     │  │ │   istry    │ │  │
//!                                     │  │ └────────────┘ │  │
//!                                     │  └────────────────┘  │
//!                                     └──────────────────────┘
//! ```
//!
//! The [`ServiceManager`] registers behavior-bound services keyed by
//! normalized path, drives the shared lifecycle (Ready → Start →
//! ShuttingDown → Stop), and fans broadcasts and broadpings out across
//! every host with snapshot iteration and bounded wait times. Each
//! [`host::ServiceHost`] owns a [`registry::SessionRegistry`] of live
//! sessions and, when keep-clean is on, a sweeper that evicts sessions
//! that stop answering pings.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use hive_server::{HiveServer, ServerConfig, ServiceBehavior};
//! use std::net::SocketAddr;
//!
//! struct Silent;
//! #[async_trait::async_trait]
//! impl ServiceBehavior for Silent {}
//!
//! #[tokio::main]
//! async fn main() {
//!     let addr: SocketAddr = "0.0.0.0:8080".parse().unwrap();
//!     let config = ServerConfig::new(addr).with_max_connections(1000);
//!
//!     let mut server = HiveServer::new(config);
//!     server.manager().add("/chat", || Silent).await.unwrap();
//!     server.serve().await.unwrap();
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod host;
pub mod manager;
pub mod path;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;

// Re-export main types
pub use config::{ServerConfig, DEFAULT_FRAGMENT_SIZE, DEFAULT_WAIT_TIME};
pub use error::{HiveError, HiveResult};
pub use host::{BehaviorFactory, ServiceBehavior, ServiceHost};
pub use manager::{BroadpingResults, ServiceManager};
pub use registry::SessionRegistry;
pub use server::{HiveServer, WsSession};
pub use session::{ByteStream, CloseArgs, ReadyState, Session};
pub use state::ServerState;
