//! Relay engine configuration

use std::collections::HashSet;
use std::time::Duration;

/// Default number of attempts per send before a connection is declared dead
pub const DEFAULT_SEND_ATTEMPTS: usize = 5;

/// Default delay between upstream connect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default heartbeat check period
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default silence after which upstream is declared dead
pub const DEFAULT_DEAD_TIME: Duration = Duration::from_secs(40);

/// Default lifetime of an unanswered echo registration
pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(300);

/// Default outage length before the operator is notified
pub const DEFAULT_NOTICE_GRACE: Duration = Duration::from_secs(60);

/// Relay engine configuration options
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Group ids that may pass (authoritative when non-empty)
    pub allow_list: HashSet<i64>,

    /// Group ids that are dropped (consulted only with an empty allow-list)
    pub deny_list: HashSet<i64>,

    /// Attempts per send, no delay in between (minimum 1)
    pub send_attempts: usize,

    /// Delay between failed upstream connect attempts
    pub reconnect_delay: Duration,

    /// How often the heartbeat monitor checks for silence
    pub heartbeat_interval: Duration,

    /// Silence after which upstream is declared dead (zero disables)
    pub dead_time: Duration,

    /// Lifetime of unanswered echo registrations (`None` keeps them forever)
    pub echo_ttl: Option<Duration>,

    /// Outage length before the outage notifier fires
    pub notice_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            allow_list: HashSet::new(),
            deny_list: HashSet::new(),
            send_attempts: DEFAULT_SEND_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            dead_time: DEFAULT_DEAD_TIME,
            echo_ttl: Some(DEFAULT_ECHO_TTL),
            notice_grace: DEFAULT_NOTICE_GRACE,
        }
    }
}

impl RelayConfig {
    /// Set the allow-list
    pub fn allow(mut self, groups: impl IntoIterator<Item = i64>) -> Self {
        self.allow_list = groups.into_iter().collect();
        self
    }

    /// Set the deny-list
    pub fn deny(mut self, groups: impl IntoIterator<Item = i64>) -> Self {
        self.deny_list = groups.into_iter().collect();
        self
    }

    /// Set attempts per send (clamped to at least 1)
    pub fn send_attempts(mut self, attempts: usize) -> Self {
        self.send_attempts = attempts.max(1);
        self
    }

    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the heartbeat check period
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the dead-time threshold; zero disables heartbeat checking
    pub fn dead_time(mut self, dead_time: Duration) -> Self {
        self.dead_time = dead_time;
        self
    }

    /// Set the echo time-to-live; `None` disables expiry
    pub fn echo_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.echo_ttl = ttl;
        self
    }

    /// Set the outage notification grace period
    pub fn notice_grace(mut self, grace: Duration) -> Self {
        self.notice_grace = grace;
        self
    }
}
