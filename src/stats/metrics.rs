//! Statistics for the relay

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Relay-wide counters
///
/// Updated lock-free from every task; read through [`RelayStats::snapshot`].
#[derive(Debug)]
pub struct RelayStats {
    started_at: Instant,
    upstream_frames: AtomicU64,
    broadcasts: AtomicU64,
    targeted: AtomicU64,
    filtered: AtomicU64,
    commands_forwarded: AtomicU64,
    dead_lettered: AtomicU64,
    replayed: AtomicU64,
    reconnects: AtomicU64,
    evicted: AtomicU64,
    malformed: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Frames received from upstream
    pub upstream_frames: u64,
    /// Frames broadcast to the registry
    pub broadcasts: u64,
    /// Responses routed to a single consumer by echo
    pub targeted: u64,
    /// Frames dropped by the group filter (both directions)
    pub filtered: u64,
    /// Consumer commands sent straight upstream
    pub commands_forwarded: u64,
    /// Consumer commands parked in the dead-letter buffer
    pub dead_lettered: u64,
    /// Dead letters replayed after a reconnect
    pub replayed: u64,
    /// Successful upstream (re)connects
    pub reconnects: u64,
    /// Consumers evicted after exhausting send retries
    pub evicted: u64,
    /// Frames rejected as malformed
    pub malformed: u64,
    /// Time since the relay started
    pub uptime: Duration,
}

macro_rules! counters {
    ($($name:ident),* $(,)?) => {
        $(
            pub(crate) fn $name(&self, n: u64) {
                self.$name.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            upstream_frames: AtomicU64::new(0),
            broadcasts: AtomicU64::new(0),
            targeted: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            commands_forwarded: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    counters!(
        upstream_frames,
        broadcasts,
        targeted,
        filtered,
        commands_forwarded,
        dead_lettered,
        replayed,
        reconnects,
        evicted,
        malformed,
    );

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        StatsSnapshot {
            upstream_frames: load(&self.upstream_frames),
            broadcasts: load(&self.broadcasts),
            targeted: load(&self.targeted),
            filtered: load(&self.filtered),
            commands_forwarded: load(&self.commands_forwarded),
            dead_lettered: load(&self.dead_lettered),
            replayed: load(&self.replayed),
            reconnects: load(&self.reconnects),
            evicted: load(&self.evicted),
            malformed: load(&self.malformed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}
