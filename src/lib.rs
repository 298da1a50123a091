//! OneBot fan-out relay
//!
//! Sits between a single OneBot protocol endpoint (the "upstream") and any
//! number of bot frameworks (the "consumers"), relaying events down and
//! commands up over WebSocket.
//!
//! ```text
//!                        ┌──────────────────────────────┐
//!   [Consumer] ◄──────►  │          RelayEngine         │
//!   [Consumer] ◄──────►  │  registry · correlation ·    │  ◄──────► [OneBot endpoint]
//!   [Consumer] ◄──────►  │  auth · dead letters · link  │
//!                        └──────────────────────────────┘
//! ```
//!
//! The upstream link reconnects on its own; consumers only ever notice a fresh
//! `lifecycle/connect` event once it is back. Commands sent while the link is
//! down wait in a FIFO dead-letter buffer and are replayed first.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use onebot_relay::relay::{RelayConfig, RelayEngine};
//! use onebot_relay::server::{RelayServer, ServerConfig};
//! use onebot_relay::transport::ws::WsConnector;
//!
//! # async fn example() -> onebot_relay::error::Result<()> {
//! let connector = Arc::new(WsConnector::new("ws://127.0.0.1:3001"));
//! let engine = RelayEngine::new(RelayConfig::default(), connector, None);
//! let server = RelayServer::new(ServerConfig::default(), Arc::clone(&engine));
//!
//! server.run_until(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod notify;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
pub use relay::{RelayConfig, RelayEngine};
pub use server::{RelayServer, ServerConfig};
