//! Bounded sender
//!
//! Every send in the relay goes through here. A send is retried back to back
//! up to a fixed number of times; transient failures are rare on a healthy
//! socket, so a frame that fails every attempt means the connection is gone.
//! The caller decides what "gone" means for its side (evict a consumer, or
//! drop the upstream link).

use thiserror::Error;

use crate::protocol::Frame;
use crate::transport::{Outlet, TransportError};

/// All attempts failed
#[derive(Debug, Error)]
#[error("send failed after {attempts} attempts: {last}")]
pub struct SendError {
    pub attempts: usize,
    pub last: TransportError,
}

/// Retry wrapper around [`Outlet::send`]
#[derive(Debug, Clone, Copy)]
pub struct BoundedSender {
    attempts: usize,
}

impl BoundedSender {
    /// Create a sender making at most `attempts` tries (at least one)
    pub fn new(attempts: usize) -> Self {
        Self {
            attempts: attempts.max(1),
        }
    }

    /// Maximum attempts per send
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Send `frame`, retrying immediately on failure
    pub async fn send(&self, outlet: &dyn Outlet, frame: &Frame) -> Result<(), SendError> {
        let mut attempt = 1;
        loop {
            match outlet.send(frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.attempts => {
                    return Err(SendError {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "Send attempt failed, retrying");
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for BoundedSender {
    fn default() -> Self {
        Self::new(crate::relay::config::DEFAULT_SEND_ATTEMPTS)
    }
}
