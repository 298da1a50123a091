//! Consumer registry
//!
//! Tracks every live downstream connection. Broadcasts iterate a
//! point-in-time [`snapshot`](ConsumerRegistry::snapshot) so the set is never
//! mutated under an iteration; evictions found during a broadcast are applied
//! afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::transport::Outlet;

/// Unique identifier for a consumer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// One downstream connection
pub struct Consumer {
    id: ConsumerId,
    peer: String,
    outlet: Arc<dyn Outlet>,
    closed: CancellationToken,
}

impl Consumer {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    /// Remote identity, for logs
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn outlet(&self) -> &dyn Outlet {
        self.outlet.as_ref()
    }

    /// Resolves once the consumer has been closed by the relay
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Close the connection and wake its session loop
    pub async fn close(&self) {
        self.closed.cancel();
        self.outlet.close().await;
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Live set of consumer connections
pub struct ConsumerRegistry {
    consumers: RwLock<HashMap<ConsumerId, Arc<Consumer>>>,
    next_id: AtomicU64,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection
    pub async fn add(&self, outlet: Arc<dyn Outlet>, peer: impl Into<String>) -> Arc<Consumer> {
        let consumer = Arc::new(Consumer {
            id: ConsumerId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            peer: peer.into(),
            outlet,
            closed: CancellationToken::new(),
        });

        let mut consumers = self.consumers.write().await;
        consumers.insert(consumer.id, Arc::clone(&consumer));

        tracing::info!(
            consumer = %consumer.id,
            peer = %consumer.peer,
            consumers = consumers.len(),
            "Consumer added"
        );

        consumer
    }

    /// Remove a connection without closing it
    pub async fn remove(&self, id: ConsumerId) -> Option<Arc<Consumer>> {
        let mut consumers = self.consumers.write().await;
        let removed = consumers.remove(&id);

        if removed.is_some() {
            tracing::debug!(consumer = %id, consumers = consumers.len(), "Consumer removed");
        }

        removed
    }

    /// Remove and close a connection that stopped accepting frames
    pub async fn evict(&self, id: ConsumerId) -> bool {
        match self.remove(id).await {
            Some(consumer) => {
                tracing::warn!(consumer = %id, peer = %consumer.peer, "Consumer expired, evicting");
                consumer.close().await;
                true
            }
            None => false,
        }
    }

    /// Stable copy of the current members
    pub async fn snapshot(&self) -> Vec<Arc<Consumer>> {
        self.consumers.read().await.values().cloned().collect()
    }

    /// Whether a consumer is still registered
    pub async fn contains(&self, id: ConsumerId) -> bool {
        self.consumers.read().await.contains_key(&id)
    }

    /// Number of registered consumers
    pub async fn len(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every consumer, for shutdown
    pub async fn drain(&self) -> Vec<Arc<Consumer>> {
        self.consumers.write().await.drain().map(|(_, c)| c).collect()
    }
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
