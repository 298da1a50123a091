//! In-process transport
//!
//! Channel-backed connections that behave like sockets as far as the relay
//! is concerned: closing an outlet ends the peer's inlet, and sends after
//! close fail. Outlets also support injected send failures so retry and
//! eviction paths can be driven deterministically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Connection, Connector, Inlet, Outlet, Received, TransportError};
use crate::protocol::Frame;

/// Send half of an in-memory pipe
pub struct MemoryOutlet {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    faults: AtomicUsize,
    sent: AtomicUsize,
}

impl MemoryOutlet {
    /// Make the next `count` sends fail with [`TransportError::Injected`]
    pub fn fail_next(&self, count: usize) {
        self.faults.store(count, Ordering::SeqCst);
    }

    /// Make every send fail until [`fail_next`](Self::fail_next) resets it
    pub fn fail_always(&self) {
        self.faults.store(usize::MAX, Ordering::SeqCst);
    }

    /// Number of frames successfully sent
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Whether [`Outlet::close`] has been called or the peer went away
    pub fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }

    fn take_fault(&self) -> bool {
        self.faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl Outlet for MemoryOutlet {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.take_fault() {
            return Err(TransportError::Injected);
        }

        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)?;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.tx.lock().take();
    }
}

/// Receive half of an in-memory pipe
pub struct MemoryInlet {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryInlet {
    /// Take a frame if one is already waiting
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl Inlet for MemoryInlet {
    async fn recv(&mut self) -> Received {
        match self.rx.recv().await {
            Some(frame) => Received::Frame(frame),
            None => Received::Closed(None),
        }
    }
}

/// Create a one-directional pipe
pub fn pipe() -> (MemoryOutlet, MemoryInlet) {
    let (tx, rx) = mpsc::unbounded_channel();
    let outlet = MemoryOutlet {
        tx: Mutex::new(Some(tx)),
        faults: AtomicUsize::new(0),
        sent: AtomicUsize::new(0),
    };
    (outlet, MemoryInlet { rx })
}

/// One end of an in-memory duplex connection
pub struct MemoryEndpoint {
    pub outlet: Arc<MemoryOutlet>,
    pub inlet: MemoryInlet,
}

impl MemoryEndpoint {
    /// Convert into a relay [`Connection`]
    pub fn into_connection(self, peer: impl Into<String>) -> Connection {
        Connection {
            outlet: self.outlet,
            inlet: Box::new(self.inlet),
            peer: peer.into(),
        }
    }
}

/// Create a connected pair of endpoints
pub fn duplex() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_out, b_in) = pipe();
    let (b_out, a_in) = pipe();

    (
        MemoryEndpoint {
            outlet: Arc::new(a_out),
            inlet: a_in,
        },
        MemoryEndpoint {
            outlet: Arc::new(b_out),
            inlet: b_in,
        },
    )
}

/// Connector handing out pre-arranged in-memory connections
///
/// Each [`offer`](Self::offer) queues one successful connect and returns the
/// far end for the test to play the upstream role. With nothing queued,
/// `connect` fails as if the endpoint were down.
#[derive(Default)]
pub struct MemoryConnector {
    pending: Mutex<VecDeque<MemoryEndpoint>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one successful connection; returns the upstream side
    pub fn offer(&self) -> MemoryEndpoint {
        let (near, far) = duplex();
        self.pending.lock().push_back(near);
        far
    }

    /// Total connect attempts so far, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let endpoint = self.pending.lock().pop_front();
        endpoint
            .map(|endpoint| endpoint.into_connection(self.target()))
            .ok_or_else(|| TransportError::Connect("no upstream offered".into()))
    }

    fn target(&self) -> String {
        "memory://upstream".to_string()
    }
}
