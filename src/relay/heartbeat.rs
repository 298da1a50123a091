//! Upstream heartbeat monitor
//!
//! OneBot endpoints emit `meta_event/heartbeat` periodically once they have
//! announced themselves with `lifecycle/connect`. A link that goes silent
//! for longer than the dead-time threshold is treated as dead even if the
//! socket is still open.
//!
//! Silence is measured on the local monotonic clock. The event's own `time`
//! field is kept for inspection only, since the bot host's clock may drift
//! from ours.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::link::{LinkId, LinkManager};

struct Beat {
    last_event_time: Option<i64>,
    last_seen: Instant,
}

struct Watch {
    link_id: LinkId,
    handle: JoinHandle<()>,
}

/// Watches a single upstream link for silence
pub struct HeartbeatMonitor {
    dead_time: Duration,
    interval: Duration,
    beat: Mutex<Beat>,
    armed: AtomicBool,
    watcher: Mutex<Option<Watch>>,
}

impl HeartbeatMonitor {
    /// Create a monitor; a zero `dead_time` disables it
    pub fn new(dead_time: Duration, interval: Duration) -> Self {
        Self {
            dead_time,
            interval: interval.max(Duration::from_millis(1)),
            beat: Mutex::new(Beat {
                last_event_time: None,
                last_seen: Instant::now(),
            }),
            armed: AtomicBool::new(false),
            watcher: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.dead_time.is_zero()
    }

    /// Whether a lifecycle event has been seen, so new links get watched too
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Record a heartbeat or lifecycle event
    pub fn record(&self, event_time: Option<i64>) {
        let mut beat = self.beat.lock();
        beat.last_seen = Instant::now();
        if event_time.is_some() {
            beat.last_event_time = event_time;
        }
    }

    /// `time` of the last heartbeat or lifecycle event
    pub fn last_event_time(&self) -> Option<i64> {
        self.beat.lock().last_event_time
    }

    /// Time since the last recorded event
    pub fn silence(&self) -> Duration {
        self.beat.lock().last_seen.elapsed()
    }

    /// Start watching `link_id`
    ///
    /// No-op when disabled or when this link already has a live loop. A loop
    /// watching a previous link is replaced.
    pub fn watch(self: &Arc<Self>, link_id: LinkId, links: &Arc<LinkManager>) {
        if !self.is_enabled() {
            return;
        }
        self.armed.store(true, Ordering::Release);

        let mut watcher = self.watcher.lock();
        if let Some(watch) = watcher.as_ref() {
            if watch.link_id == link_id && !watch.handle.is_finished() {
                return;
            }
        }
        if let Some(old) = watcher.take() {
            old.handle.abort();
        }

        tracing::debug!(link = link_id, dead_time = ?self.dead_time, "Heartbeat monitor started");

        let handle = links
            .tasks()
            .spawn(Arc::clone(self).run(link_id, Arc::clone(links)));
        *watcher = Some(Watch { link_id, handle });
    }

    /// Reset the baseline for a fresh link and watch it if armed
    pub fn rearm(self: &Arc<Self>, link_id: LinkId, links: &Arc<LinkManager>) {
        self.beat.lock().last_seen = Instant::now();
        if self.is_armed() {
            self.watch(link_id, links);
        }
    }

    /// Stop the active loop, if any
    pub fn stop(&self) {
        if let Some(watch) = self.watcher.lock().take() {
            watch.handle.abort();
        }
    }

    async fn run(self: Arc<Self>, link_id: LinkId, links: Arc<LinkManager>) {
        let shutdown = links.shutdown_token().clone();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if !links.is_current(link_id).await {
                tracing::debug!(link = link_id, "Watched link replaced, heartbeat monitor exiting");
                return;
            }

            let silence = self.silence();
            if silence > self.dead_time {
                tracing::warn!(
                    link = link_id,
                    silence = ?silence,
                    dead_time = ?self.dead_time,
                    "No heartbeat from upstream, declaring link dead"
                );
                links.report_failure(link_id).await;
                links.request_reconnect();
                return;
            }
        }
    }
}
