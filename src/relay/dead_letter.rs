//! Dead-letter buffer
//!
//! Holds outbound commands that could not be delivered because the upstream
//! link was absent or failed mid-send. Entries are replayed strictly in the
//! order they were queued, against the next link, before that link carries
//! any new traffic.
//!
//! Both the outbound gate ([`forward`](DeadLetterBuffer::forward)) and the
//! replay ([`drain_to`](DeadLetterBuffer::drain_to)) run under the queue lock,
//! so a fresh command can never overtake a queued one.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use super::sender::BoundedSender;
use crate::protocol::Frame;
use crate::transport::Outlet;

/// Outcome of pushing one frame through the outbound gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    /// Delivered to the live link
    Sent,
    /// Parked in the buffer; `link_failed` is set when a send was attempted
    /// and exhausted its retries
    Queued { link_failed: bool },
}

/// Outcome of a replay pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    pub replayed: usize,
    pub remaining: usize,
}

impl Drain {
    /// Whether the buffer was fully flushed
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// FIFO of undelivered outbound frames
#[derive(Default)]
pub struct DeadLetterBuffer {
    queue: Mutex<VecDeque<Frame>>,
}

impl DeadLetterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a frame to the back of the queue
    pub async fn enqueue(&self, frame: Frame) {
        let mut queue = self.queue.lock().await;
        queue.push_back(frame);
        tracing::debug!(queued = queue.len(), "Frame dead-lettered");
    }

    /// Send `frame` on `outlet` unless it has to wait behind queued frames
    pub async fn forward(
        &self,
        outlet: Option<&dyn Outlet>,
        frame: Frame,
        sender: &BoundedSender,
    ) -> Forward {
        let mut queue = self.queue.lock().await;

        let outcome = match outlet {
            Some(outlet) if queue.is_empty() => match sender.send(outlet, &frame).await {
                Ok(()) => return Forward::Sent,
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream send failed, dead-lettering command");
                    Forward::Queued { link_failed: true }
                }
            },
            _ => Forward::Queued { link_failed: false },
        };

        queue.push_back(frame);
        tracing::debug!(queued = queue.len(), "Frame dead-lettered");
        outcome
    }

    /// Replay queued frames in order until one fails
    ///
    /// The failed frame and everything after it stay queued for the next
    /// link.
    pub async fn drain_to(&self, outlet: &dyn Outlet, sender: &BoundedSender) -> Drain {
        let mut queue = self.queue.lock().await;
        let mut replayed = 0;

        while let Some(frame) = queue.front() {
            if let Err(e) = sender.send(outlet, frame).await {
                tracing::warn!(
                    error = %e,
                    remaining = queue.len(),
                    "Dead-letter replay interrupted"
                );
                break;
            }
            queue.pop_front();
            replayed += 1;
        }

        if replayed > 0 {
            tracing::info!(replayed, remaining = queue.len(), "Replayed dead-lettered commands");
        }

        Drain {
            replayed,
            remaining: queue.len(),
        }
    }

    /// Number of queued frames
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copy of the queued frames, oldest first
    pub async fn frames(&self) -> Vec<Frame> {
        self.queue.lock().await.iter().cloned().collect()
    }
}
