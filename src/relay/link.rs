//! Upstream link manager
//!
//! Owns the single connection to the OneBot endpoint and its state machine:
//!
//! ```text
//! Disconnected ──reconnect()──► Connecting ──connect ok + replay──► Connected
//!      ▲                           │  ▲                                │
//!      │                           └──┘ connect failed, wait delay     │
//!      └──────── report_failure() (send/recv failure, heartbeat) ──────┘
//! ```
//!
//! Entry to `Connecting` is serialized: concurrent failure reports collapse
//! into a single reconnect sequence. A fresh link only becomes visible to the
//! outbound path after every dead-lettered command has been replayed on it.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::RelayConfig;
use super::dead_letter::DeadLetterBuffer;
use super::heartbeat::HeartbeatMonitor;
use super::sender::BoundedSender;
use crate::notify::OutageNotifier;
use crate::stats::RelayStats;
use crate::transport::{Connector, Inlet, Outlet};

/// Identifier of one upstream connection instance
pub type LinkId = u64;

/// Link state as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// A live connection to the OneBot endpoint
pub struct UpstreamLink {
    id: LinkId,
    peer: String,
    outlet: Arc<dyn Outlet>,
    closed: CancellationToken,
}

impl UpstreamLink {
    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn outlet(&self) -> &dyn Outlet {
        self.outlet.as_ref()
    }

    /// Cancelled once the link has been declared dead
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    async fn close(&self) {
        self.closed.cancel();
        self.outlet.close().await;
    }
}

impl std::fmt::Debug for UpstreamLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamLink")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Receive side of a freshly published link, handed to the upstream pump
pub struct LinkSession {
    pub link: Arc<UpstreamLink>,
    pub inlet: Box<dyn Inlet>,
}

#[derive(Default)]
struct Outage {
    since: Option<Instant>,
    notified: bool,
}

/// Upstream connection lifecycle
pub struct LinkManager {
    connector: Arc<dyn Connector>,
    current: RwLock<Option<Arc<UpstreamLink>>>,
    reconnect_guard: Mutex<()>,
    reconnect_requested: Notify,
    requests: AtomicUsize,
    state: watch::Sender<LinkState>,
    next_link_id: AtomicU64,
    bot_id: AtomicI64,
    sessions: mpsc::UnboundedSender<LinkSession>,
    reconnect_delay: Duration,
    sender: BoundedSender,
    dead_letters: Arc<DeadLetterBuffer>,
    heartbeat: Arc<HeartbeatMonitor>,
    notifier: Option<Arc<dyn OutageNotifier>>,
    notice_grace: Duration,
    outage: parking_lot::Mutex<Outage>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    stats: Arc<RelayStats>,
}

impl LinkManager {
    /// Create a manager in the `Disconnected` state
    ///
    /// Published links arrive on the returned receiver.
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &RelayConfig,
        notifier: Option<Arc<dyn OutageNotifier>>,
        shutdown: CancellationToken,
        tasks: TaskTracker,
        stats: Arc<RelayStats>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkSession>) {
        let (sessions, sessions_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LinkState::Disconnected);

        let manager = Arc::new(Self {
            connector,
            current: RwLock::new(None),
            reconnect_guard: Mutex::new(()),
            reconnect_requested: Notify::new(),
            requests: AtomicUsize::new(0),
            state,
            next_link_id: AtomicU64::new(1),
            bot_id: AtomicI64::new(0),
            sessions,
            reconnect_delay: config.reconnect_delay,
            sender: BoundedSender::new(config.send_attempts),
            dead_letters: Arc::new(DeadLetterBuffer::new()),
            heartbeat: Arc::new(HeartbeatMonitor::new(
                config.dead_time,
                config.heartbeat_interval,
            )),
            notifier,
            notice_grace: config.notice_grace,
            outage: parking_lot::Mutex::new(Outage::default()),
            shutdown,
            tasks,
            stats,
        });

        (manager, sessions_rx)
    }

    /// The live link, if any
    pub async fn current(&self) -> Option<Arc<UpstreamLink>> {
        self.current.read().await.clone()
    }

    /// Whether `link_id` is still the live link
    pub async fn is_current(&self, link_id: LinkId) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .is_some_and(|link| link.id == link_id)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Wait until a link is published
    pub async fn wait_connected(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel
        let _ = state.wait_for(|s| *s == LinkState::Connected).await;
    }

    /// Last bot id announced by the endpoint (0 until known)
    pub fn bot_id(&self) -> i64 {
        self.bot_id.load(Ordering::Acquire)
    }

    /// Record the identity carried by a lifecycle event
    pub fn observe_lifecycle(&self, self_id: Option<i64>) {
        if let Some(id) = self_id {
            let previous = self.bot_id.swap(id, Ordering::AcqRel);
            if previous != id {
                tracing::info!(bot_id = id, "Upstream bot identified");
            }
        }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterBuffer> {
        &self.dead_letters
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn sender(&self) -> &BoundedSender {
        &self.sender
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Number of reconnect requests made so far
    pub fn reconnect_requests(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }

    /// Declare `link_id` dead
    ///
    /// Acts only if it is still the live link, so stale reports from an
    /// earlier link are ignored. Returns whether the link was dropped.
    pub async fn report_failure(&self, link_id: LinkId) -> bool {
        let link = {
            let mut current = self.current.write().await;
            if current.as_ref().is_some_and(|link| link.id == link_id) {
                current.take()
            } else {
                None
            }
        };

        let Some(link) = link else {
            return false;
        };

        tracing::warn!(link = link.id, peer = %link.peer, "Upstream link lost");
        link.close().await;
        self.state.send_replace(LinkState::Disconnected);
        self.outage.lock().since.get_or_insert_with(Instant::now);
        true
    }

    /// Ask the supervisor to run [`reconnect`](Self::reconnect)
    ///
    /// Never blocks. Requests made while one is pending are coalesced.
    pub fn request_reconnect(&self) {
        self.requests.fetch_add(1, Ordering::AcqRel);
        self.reconnect_requested.notify_one();
    }

    /// Service reconnect requests until shutdown
    pub(crate) async fn supervise(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.reconnect_requested.notified() => self.reconnect().await,
            }
        }
        tracing::debug!("Link supervisor stopped");
    }

    /// Bring the link to `Connected`
    ///
    /// Serialized and idempotent: a caller arriving while another reconnect
    /// runs waits for it, then finds the link up and only flushes any
    /// commands queued in the meantime. Retries forever with a fixed delay
    /// until connected or shut down.
    pub async fn reconnect(self: &Arc<Self>) {
        let _guard = self.reconnect_guard.lock().await;

        if self.shutdown.is_cancelled() {
            return;
        }

        if let Some(link) = self.current().await {
            let drain = self.dead_letters.drain_to(link.outlet(), &self.sender).await;
            self.stats.replayed(drain.replayed as u64);
            if drain.is_complete() {
                return;
            }
            self.report_failure(link.id).await;
        }

        self.outage.lock().since.get_or_insert_with(Instant::now);
        self.state.send_replace(LinkState::Connecting);
        let target = self.connector.target();

        loop {
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = self.connector.connect() => attempt,
            };

            match attempt {
                Ok(conn) => {
                    let link = Arc::new(UpstreamLink {
                        id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
                        peer: conn.peer,
                        outlet: conn.outlet,
                        closed: CancellationToken::new(),
                    });

                    let drain = self.dead_letters.drain_to(link.outlet(), &self.sender).await;
                    self.stats.replayed(drain.replayed as u64);

                    if drain.is_complete() {
                        self.publish(link, conn.inlet).await;
                        return;
                    }

                    tracing::warn!(
                        link = link.id,
                        remaining = drain.remaining,
                        "Replay failed on fresh link, retrying"
                    );
                    link.close().await;
                }
                Err(e) => {
                    tracing::warn!(upstream = %target, error = %e, "Upstream connect failed");
                    self.check_outage();
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        self.state.send_replace(LinkState::Disconnected);
    }

    async fn publish(self: &Arc<Self>, link: Arc<UpstreamLink>, inlet: Box<dyn Inlet>) {
        *self.current.write().await = Some(Arc::clone(&link));
        *self.outage.lock() = Outage::default();
        self.stats.reconnects(1);
        self.state.send_replace(LinkState::Connected);

        tracing::info!(link = link.id, peer = %link.peer, "Upstream link established");

        self.heartbeat.rearm(link.id, self);

        if self
            .sessions
            .send(LinkSession {
                link: Arc::clone(&link),
                inlet,
            })
            .is_err()
        {
            tracing::debug!(link = link.id, "Upstream pump gone, link will idle");
        }
    }

    /// Fire the outage notifier once the outage outlasts the grace period
    fn check_outage(&self) {
        let Some(notifier) = self.notifier.as_ref() else {
            return;
        };

        {
            let mut outage = self.outage.lock();
            let overdue = outage
                .since
                .is_some_and(|since| since.elapsed() >= self.notice_grace);
            if !overdue || outage.notified {
                return;
            }
            outage.notified = true;
        }

        let notifier = Arc::clone(notifier);
        let bot_id = self.bot_id();
        tracing::info!(bot_id, "Upstream still unreachable, sending outage notice");

        self.tasks.spawn(async move {
            if let Err(e) = notifier.notify(bot_id).await {
                tracing::error!(bot_id, error = %e, "Failed to send outage notice");
            }
        });
    }

    /// Drop the live link without reconnecting, for shutdown
    pub async fn close(&self) {
        if let Some(link) = self.current.write().await.take() {
            tracing::debug!(link = link.id, "Closing upstream link");
            link.close().await;
        }
        self.heartbeat.stop();
        self.state.send_replace(LinkState::Disconnected);
    }
}
