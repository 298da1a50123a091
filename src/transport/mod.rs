//! Transport seams
//!
//! The relay core never touches sockets directly. Every connection is split
//! into an [`Outlet`] (shared send half) and an [`Inlet`] (owned receive
//! half), and the upstream side is dialed through a [`Connector`].
//!
//! - [`ws`]: tokio-tungstenite WebSocket implementation used in production
//! - `memory`: in-process channels with fault injection, built for tests or
//!   with the `test-util` feature

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::Frame;

/// Transport-level failure
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection is closed (locally or by the peer)
    #[error("connection closed")]
    Closed,

    /// The remote endpoint refused or could not be reached
    #[error("connect failed: {0}")]
    Connect(String),

    /// WebSocket protocol or I/O error
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// Failure injected by the in-memory transport
    #[cfg(any(test, feature = "test-util"))]
    #[error("injected send failure")]
    Injected,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::WebSocket(Box::new(other)),
        }
    }
}

/// Outcome of a single receive
#[derive(Debug)]
pub enum Received {
    /// A data frame arrived
    Frame(Frame),
    /// The connection ended; `None` for an orderly close
    Closed(Option<TransportError>),
}

/// Send half of a connection
///
/// Shared between tasks; implementations serialize concurrent sends.
#[async_trait]
pub trait Outlet: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection; further sends fail
    async fn close(&self);
}

/// Receive half of a connection
#[async_trait]
pub trait Inlet: Send {
    /// Wait for the next data frame or the end of the connection
    async fn recv(&mut self) -> Received;
}

/// An established connection, split into halves
pub struct Connection {
    pub outlet: Arc<dyn Outlet>,
    pub inlet: Box<dyn Inlet>,
    /// Human-readable peer description for logs
    pub peer: String,
}

/// Dials the upstream endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attempt one connection
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Where this connector dials, for logs
    fn target(&self) -> String;
}
