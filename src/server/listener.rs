//! Consumer listener
//!
//! Handles the TCP accept loop, upgrades each socket to WebSocket and hands
//! it to the relay engine.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::Result;
use crate::relay::RelayEngine;
use crate::server::config::ServerConfig;
use crate::transport::ws;

/// WebSocket front end for consumers
pub struct RelayServer {
    config: ServerConfig,
    engine: Arc<RelayEngine>,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl RelayServer {
    /// Create a new server feeding the given engine
    pub fn new(config: ServerConfig, engine: Arc<RelayEngine>) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            engine,
            connection_semaphore,
        }
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Get the configured bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Bind, start the engine, and serve until `shutdown` resolves
    ///
    /// Failing to bind is fatal; everything after that is handled per
    /// connection.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tracing::info!(addr = %listener.local_addr()?, "Relay listening for consumers");

        self.engine.start();

        let engine_stopped = self.engine.shutdown_token();
        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
            }
            _ = engine_stopped.cancelled() => {
                tracing::info!("Relay engine stopped, closing listener");
            }
            _ = self.accept_loop(&listener) => {}
        }

        Ok(())
    }

    async fn accept_loop(&self, listener: &TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = match self.acquire_permit() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                return;
            }
        };

        tracing::debug!(peer = %peer_addr, "New connection");

        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(peer = %peer_addr, error = %e, "Failed to configure socket");
            return;
        }

        let engine = Arc::clone(&self.engine);
        let timeout = self.config.handshake_timeout;

        self.engine.track(async move {
            let accepted =
                tokio::time::timeout(timeout, ws::accept(socket, peer_addr, engine.bot_id())).await;

            let conn = match accepted {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer_addr, error = %e, "WebSocket handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::debug!(peer = %peer_addr, "WebSocket handshake timed out");
                    return;
                }
            };

            engine.serve_consumer(conn).await;
            drop(permit);
            tracing::debug!(peer = %peer_addr, "Connection closed");
        });
    }

    fn acquire_permit(&self) -> std::result::Result<Option<OwnedSemaphorePermit>, TryAcquireError> {
        match self.connection_semaphore {
            Some(ref sem) => sem.clone().try_acquire_owned().map(Some),
            None => Ok(None),
        }
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        Ok(())
    }
}
