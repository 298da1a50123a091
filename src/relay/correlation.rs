//! Echo correlation router
//!
//! Remembers which consumer sent a command carrying an `echo` token so the
//! matching response from upstream goes back to that consumer only.
//! Lookups are one-shot: the entry is removed whether or not the consumer
//! is still alive.
//!
//! Tokens that are never answered would otherwise pile up forever, so
//! entries expire after a configurable time-to-live and are dropped when
//! their consumer disconnects.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::registry::{Consumer, ConsumerId};
use crate::protocol::Echo;

struct Pending {
    consumer: Weak<Consumer>,
    consumer_id: ConsumerId,
    registered_at: Instant,
}

struct Table {
    entries: HashMap<Echo, Pending>,
    last_sweep: Instant,
}

/// Maps echo tokens to the consumer awaiting the response
pub struct CorrelationRouter {
    table: Mutex<Table>,
    ttl: Option<Duration>,
}

impl CorrelationRouter {
    /// Create a router; `ttl` of `None` keeps entries until resolved
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            ttl: ttl.filter(|ttl| !ttl.is_zero()),
        }
    }

    /// Route responses carrying `echo` to `consumer`
    ///
    /// A later registration of the same token replaces the earlier one.
    pub fn register(&self, echo: Echo, consumer: &Arc<Consumer>) {
        let now = Instant::now();
        let mut table = self.table.lock();

        if let Some(ttl) = self.ttl {
            // Sweep at most a few times per TTL window
            if now.duration_since(table.last_sweep) >= ttl / 4 {
                let before = table.entries.len();
                table
                    .entries
                    .retain(|_, pending| now.duration_since(pending.registered_at) < ttl);
                table.last_sweep = now;

                let expired = before - table.entries.len();
                if expired > 0 {
                    tracing::debug!(expired, "Expired unanswered echo registrations");
                }
            }
        }

        table.entries.insert(
            echo,
            Pending {
                consumer: Arc::downgrade(consumer),
                consumer_id: consumer.id(),
                registered_at: now,
            },
        );
    }

    /// Pop the consumer waiting on `echo`
    ///
    /// Returns `None` when the token is unknown, already consumed, expired,
    /// or its consumer has gone away. The entry is removed in every case.
    pub fn resolve(&self, echo: &Echo) -> Option<Arc<Consumer>> {
        let pending = self.table.lock().entries.remove(echo)?;

        if let Some(ttl) = self.ttl {
            if pending.registered_at.elapsed() >= ttl {
                return None;
            }
        }

        pending.consumer.upgrade()
    }

    /// Drop every entry belonging to a departed consumer
    pub fn forget(&self, consumer_id: ConsumerId) -> usize {
        let mut table = self.table.lock();
        let before = table.entries.len();
        table
            .entries
            .retain(|_, pending| pending.consumer_id != consumer_id);
        before - table.entries.len()
    }

    /// Number of outstanding registrations
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
