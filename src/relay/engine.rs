//! Relay engine
//!
//! Runs the two directions of traffic:
//!
//! - **Upstream pump**: one task reading the live upstream link. Responses
//!   carrying a known `echo` go to the consumer that asked; everything else
//!   is broadcast to every consumer that passes the group filter.
//! - **Consumer sessions**: one task per consumer, pushing its commands
//!   upstream through the dead-letter gate.
//!
//! All tasks are tracked and stopped together by [`RelayEngine::shutdown`].

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::auth::AuthFilter;
use super::config::RelayConfig;
use super::correlation::CorrelationRouter;
use super::dead_letter::Forward;
use super::link::{LinkManager, LinkSession, UpstreamLink};
use super::registry::{Consumer, ConsumerRegistry};
use super::sender::BoundedSender;
use crate::notify::OutageNotifier;
use crate::protocol::{lifecycle_connect, preview, Command, Event, EventKind, Frame, ProtocolError};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::transport::{Connection, Connector, Received};

/// Fan-out relay between one OneBot endpoint and many consumers
pub struct RelayEngine {
    links: Arc<LinkManager>,
    consumers: ConsumerRegistry,
    correlations: CorrelationRouter,
    auth: AuthFilter,
    sender: BoundedSender,
    stats: Arc<RelayStats>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    sessions: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<LinkSession>>>,
}

impl RelayEngine {
    /// Create an engine; nothing runs until [`start`](Self::start)
    pub fn new(
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        notifier: Option<Arc<dyn OutageNotifier>>,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        let stats = Arc::new(RelayStats::new());

        let (links, sessions) = LinkManager::new(
            connector,
            &config,
            notifier,
            shutdown.clone(),
            tasks.clone(),
            Arc::clone(&stats),
        );

        Arc::new(Self {
            links,
            consumers: ConsumerRegistry::new(),
            correlations: CorrelationRouter::new(config.echo_ttl),
            auth: AuthFilter::new(config.allow_list, config.deny_list),
            sender: BoundedSender::new(config.send_attempts),
            stats,
            shutdown,
            tasks,
            sessions: parking_lot::Mutex::new(Some(sessions)),
        })
    }

    /// Spawn the link supervisor and upstream pump, and start connecting
    ///
    /// Returns immediately; later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let Some(sessions) = self.sessions.lock().take() else {
            return;
        };

        tracing::info!("Relay engine starting");

        self.tasks.spawn(Arc::clone(&self.links).supervise());
        self.tasks.spawn(Arc::clone(self).pump(sessions));
        self.links.request_reconnect();
    }

    pub fn links(&self) -> &Arc<LinkManager> {
        &self.links
    }

    pub fn consumers(&self) -> &ConsumerRegistry {
        &self.consumers
    }

    pub fn correlations(&self) -> &CorrelationRouter {
        &self.correlations
    }

    /// Last bot id announced upstream (0 until known)
    pub fn bot_id(&self) -> i64 {
        self.links.bot_id()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Token cancelled when the engine shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run `future` on a task joined by [`shutdown`](Self::shutdown)
    pub fn track<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(future);
    }

    /// Serve a consumer connection on a tracked task
    pub fn spawn_consumer(self: &Arc<Self>, conn: Connection) {
        let engine = Arc::clone(self);
        self.tasks.spawn(async move { engine.serve_consumer(conn).await });
    }

    /// Serve one consumer until it disconnects or the engine stops
    pub async fn serve_consumer(&self, conn: Connection) {
        let Connection {
            outlet,
            mut inlet,
            peer,
        } = conn;
        let consumer = self.consumers.add(outlet, peer).await;

        if self.links.current().await.is_some() {
            let hello = lifecycle_connect(self.bot_id(), chrono::Utc::now().timestamp());
            if let Err(e) = self.sender.send(consumer.outlet(), &hello).await {
                tracing::warn!(consumer = %consumer.id(), error = %e, "Failed to greet consumer");
                self.end_consumer(&consumer).await;
                return;
            }
        }

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = consumer.closed().cancelled() => break,
                received = inlet.recv() => received,
            };

            match received {
                Received::Frame(frame) => {
                    if let Err(e) = self.handle_command(&consumer, frame).await {
                        self.stats.malformed(1);
                        tracing::warn!(consumer = %consumer.id(), error = %e, "Malformed command, closing consumer");
                        break;
                    }
                }
                Received::Closed(None) => {
                    tracing::info!(consumer = %consumer.id(), "Consumer disconnected");
                    break;
                }
                Received::Closed(Some(e)) => {
                    tracing::warn!(consumer = %consumer.id(), error = %e, "Consumer connection failed");
                    break;
                }
            }
        }

        self.end_consumer(&consumer).await;
    }

    async fn end_consumer(&self, consumer: &Arc<Consumer>) {
        self.consumers.remove(consumer.id()).await;
        let forgotten = self.correlations.forget(consumer.id());
        consumer.close().await;

        let consumers = self.consumers.len().await;
        tracing::debug!(
            consumer = %consumer.id(),
            forgotten,
            consumers,
            "Consumer session ended"
        );
    }

    async fn handle_command(&self, consumer: &Arc<Consumer>, frame: Frame) -> Result<(), ProtocolError> {
        let command = Command::parse(&frame)?;

        if !self.auth.allows(command.group_id) {
            self.stats.filtered(1);
            tracing::debug!(
                consumer = %consumer.id(),
                action = command.action.as_deref().unwrap_or_default(),
                "Command dropped by group filter"
            );
            return Ok(());
        }

        // Registered before sending so a fast response cannot miss it
        if let Some(echo) = command.echo {
            self.correlations.register(echo, consumer);
        }

        let link = self.links.current().await;
        let outlet = link.as_deref().map(UpstreamLink::outlet);

        match self
            .links
            .dead_letters()
            .forward(outlet, frame, &self.sender)
            .await
        {
            Forward::Sent => {
                self.stats.commands_forwarded(1);
            }
            Forward::Queued { link_failed } => {
                self.stats.dead_lettered(1);
                if let (true, Some(link)) = (link_failed, link.as_ref()) {
                    self.links.report_failure(link.id()).await;
                }
                self.links.request_reconnect();
            }
        }

        Ok(())
    }

    async fn pump(self: Arc<Self>, mut sessions: mpsc::UnboundedReceiver<LinkSession>) {
        loop {
            let session = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                session = sessions.recv() => match session {
                    Some(session) => session,
                    None => break,
                },
            };
            self.pump_link(session).await;
        }
        tracing::debug!("Upstream pump stopped");
    }

    async fn pump_link(&self, session: LinkSession) {
        let LinkSession { link, mut inlet } = session;

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                // Whoever closed it has already asked for a reconnect
                _ = link.closed().cancelled() => return,
                received = inlet.recv() => received,
            };

            match received {
                Received::Frame(frame) => {
                    if let Err(e) = self.route_upstream(&link, frame).await {
                        self.stats.malformed(1);
                        tracing::warn!(link = link.id(), error = %e, "Malformed upstream message");
                        break;
                    }
                }
                Received::Closed(None) => {
                    tracing::warn!(link = link.id(), "Upstream closed the connection");
                    break;
                }
                Received::Closed(Some(e)) => {
                    tracing::warn!(link = link.id(), error = %e, "Upstream connection failed");
                    break;
                }
            }
        }

        self.links.report_failure(link.id()).await;
        self.links.request_reconnect();
    }

    async fn route_upstream(&self, link: &UpstreamLink, frame: Frame) -> Result<(), ProtocolError> {
        self.stats.upstream_frames(1);
        let event = Event::parse(&frame)?;
        let heartbeat = self.links.heartbeat();

        match event.kind {
            EventKind::LifecycleConnect => {
                self.links.observe_lifecycle(event.self_id);
                heartbeat.record(event.time);
                heartbeat.watch(link.id(), &self.links);
            }
            EventKind::Heartbeat => heartbeat.record(event.time),
            EventKind::Other => {}
        }

        if let Some(echo) = event.echo.as_ref() {
            if let Some(consumer) = self.correlations.resolve(echo) {
                self.stats.targeted(1);
                tracing::debug!(echo = %echo, consumer = %consumer.id(), "Routing response");

                if let Err(e) = self.sender.send(consumer.outlet(), &frame).await {
                    tracing::warn!(consumer = %consumer.id(), error = %e, "Response delivery failed");
                    if self.consumers.evict(consumer.id()).await {
                        self.stats.evicted(1);
                    }
                }
                return Ok(());
            }
        }

        if !self.auth.allows(event.group_id) {
            self.stats.filtered(1);
            return Ok(());
        }

        self.broadcast(&frame).await;
        Ok(())
    }

    /// Send to every consumer concurrently, then evict the ones that failed
    async fn broadcast(&self, frame: &Frame) {
        let consumers = self.consumers.snapshot().await;
        if consumers.is_empty() {
            tracing::trace!(frame = %preview(frame), "No consumers, event dropped");
            return;
        }

        self.stats.broadcasts(1);
        tracing::trace!(consumers = consumers.len(), frame = %preview(frame), "Broadcasting");

        let sender = &self.sender;
        let results = join_all(consumers.iter().map(|consumer| async move {
            (consumer, sender.send(consumer.outlet(), frame).await)
        }))
        .await;

        for (consumer, result) in results {
            if let Err(e) = result {
                tracing::warn!(consumer = %consumer.id(), error = %e, "Broadcast delivery failed");
                if self.consumers.evict(consumer.id()).await {
                    self.stats.evicted(1);
                }
            }
        }
    }

    /// Stop every task and close every connection
    pub async fn shutdown(&self) {
        tracing::info!("Relay engine shutting down");

        self.shutdown.cancel();
        self.tasks.close();

        self.links.close().await;
        for consumer in self.consumers.drain().await {
            consumer.close().await;
        }

        self.tasks.wait().await;

        let stats = self.stats.snapshot();
        tracing::info!(
            upstream_frames = stats.upstream_frames,
            broadcasts = stats.broadcasts,
            targeted = stats.targeted,
            filtered = stats.filtered,
            commands_forwarded = stats.commands_forwarded,
            dead_lettered = stats.dead_lettered,
            replayed = stats.replayed,
            reconnects = stats.reconnects,
            evicted = stats.evicted,
            malformed = stats.malformed,
            uptime = ?stats.uptime,
            "Relay engine stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::Echo;
    use crate::relay::link::LinkState;
    use crate::transport::memory::{duplex, MemoryConnector, MemoryEndpoint, MemoryInlet, MemoryOutlet};
    use crate::transport::{Inlet, Outlet};

    const LIFECYCLE: &str = r#"{"post_type":"meta_event","meta_event_type":"lifecycle","sub_type":"connect","self_id":123,"time":1000}"#;

    fn engine(config: RelayConfig) -> (Arc<RelayEngine>, Arc<MemoryConnector>) {
        let connector = Arc::new(MemoryConnector::new());
        let engine = RelayEngine::new(config, connector.clone(), None);
        (engine, connector)
    }

    /// Let every spawned task run until it blocks
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn join(engine: &Arc<RelayEngine>) -> (MemoryEndpoint, Arc<MemoryOutlet>) {
        let (near, far) = duplex();
        let outlet = Arc::clone(&near.outlet);
        engine.spawn_consumer(near.into_connection("test-consumer"));
        settle().await;
        (far, outlet)
    }

    fn received(inlet: &mut MemoryInlet) -> Vec<Frame> {
        std::iter::from_fn(|| inlet.try_recv()).collect()
    }

    async fn send(outlet: &MemoryOutlet, text: &str) {
        outlet.send(Frame::text(text)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_broadcast_and_recorded() {
        let (engine, connector) = engine(RelayConfig::default());
        let upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        let (mut a, _) = join(&engine).await;
        let (mut b, _) = join(&engine).await;
        received(&mut a.inlet);
        received(&mut b.inlet);

        send(&upstream.outlet, LIFECYCLE).await;
        settle().await;

        assert_eq!(received(&mut a.inlet), vec![Frame::text(LIFECYCLE)]);
        assert_eq!(received(&mut b.inlet), vec![Frame::text(LIFECYCLE)]);
        assert_eq!(engine.bot_id(), 123);
        assert_eq!(engine.links().heartbeat().last_event_time(), Some(1000));
        assert!(engine.links().heartbeat().is_armed());

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_consumer_gets_lifecycle() {
        let (engine, connector) = engine(RelayConfig::default());
        let upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        send(&upstream.outlet, LIFECYCLE).await;
        settle().await;

        let (mut late, _) = join(&engine).await;
        let frames = received(&mut late.inlet);
        assert_eq!(frames.len(), 1);

        let event = Event::parse(&frames[0]).unwrap();
        assert_eq!(event.kind, EventKind::LifecycleConnect);
        assert_eq!(event.self_id, Some(123));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_lifecycle_without_link() {
        let (engine, _connector) = engine(RelayConfig::default());
        engine.start();
        settle().await;

        let (mut consumer, _) = join(&engine).await;
        assert!(received(&mut consumer.inlet).is_empty());

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_command_dropped() {
        let (engine, connector) = engine(RelayConfig::default().deny([555]));
        let mut upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        let (consumer, _) = join(&engine).await;
        send(
            &consumer.outlet,
            r#"{"action":"send_msg","params":{"group_id":555},"echo":"abc"}"#,
        )
        .await;
        settle().await;

        assert!(received(&mut upstream.inlet).is_empty());
        assert!(engine.correlations().is_empty());
        assert_eq!(engine.stats().filtered, 1);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_command_replayed_first() {
        let (engine, connector) =
            engine(RelayConfig::default().reconnect_delay(Duration::from_secs(5)));
        engine.start();
        settle().await;
        assert_eq!(engine.links().state(), LinkState::Connecting);

        let (consumer, _) = join(&engine).await;
        let queued = r#"{"action":"send_msg","params":{"group_id":1,"message":"queued"}}"#;
        send(&consumer.outlet, queued).await;
        settle().await;
        assert_eq!(engine.links().dead_letters().len().await, 1);

        let mut upstream = connector.offer();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(engine.links().state(), LinkState::Connected);

        let fresh = r#"{"action":"send_msg","params":{"group_id":1,"message":"fresh"}}"#;
        send(&consumer.outlet, fresh).await;
        settle().await;

        assert_eq!(
            received(&mut upstream.inlet),
            vec![Frame::text(queued), Frame::text(fresh)]
        );
        assert!(engine.links().dead_letters().is_empty().await);
        assert_eq!(engine.stats().replayed, 1);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_response_targeted_once() {
        let (engine, connector) = engine(RelayConfig::default());
        let mut upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        let (mut asker, _) = join(&engine).await;
        let (mut other, _) = join(&engine).await;
        received(&mut asker.inlet);
        received(&mut other.inlet);

        let command = r#"{"action":"get_status","echo":"abc"}"#;
        send(&asker.outlet, command).await;
        settle().await;
        assert_eq!(received(&mut upstream.inlet), vec![Frame::text(command)]);

        let response = r#"{"status":"ok","retcode":0,"data":{},"echo":"abc"}"#;
        send(&upstream.outlet, response).await;
        settle().await;

        assert_eq!(received(&mut asker.inlet), vec![Frame::text(response)]);
        assert!(received(&mut other.inlet).is_empty());

        // Entry consumed: the same token now falls back to broadcast
        send(&upstream.outlet, response).await;
        settle().await;

        assert_eq!(received(&mut asker.inlet), vec![Frame::text(response)]);
        assert_eq!(received(&mut other.inlet), vec![Frame::text(response)]);
        assert!(engine.correlations().resolve(&Echo::new("abc")).is_none());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_consumer_session_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (engine, _connector) = engine(RelayConfig::default());
        let (near, _far) = duplex();
        let session = engine.serve_consumer(near.into_connection("test-consumer"));
        assert_send(&session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_evicts_failing_consumers() {
        let (engine, connector) = engine(RelayConfig::default().send_attempts(3));
        let upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        let mut healthy = Vec::new();
        let mut failing = Vec::new();
        for i in 0..5 {
            let (mut far, near_outlet) = join(&engine).await;
            received(&mut far.inlet);
            if i % 2 == 1 {
                near_outlet.fail_always();
                // Keep the far end open so only the broadcast can remove it
                failing.push((far, near_outlet));
            } else {
                healthy.push(far);
            }
        }
        assert_eq!(engine.consumers().len().await, 5);

        let event = r#"{"post_type":"message","message_type":"private","user_id":7}"#;
        send(&upstream.outlet, event).await;
        settle().await;

        assert_eq!(engine.consumers().len().await, 3);
        assert_eq!(engine.stats().evicted, 2);
        for far in healthy.iter_mut() {
            assert_eq!(received(&mut far.inlet), vec![Frame::text(event)]);
        }
        for (far, outlet) in failing.iter_mut() {
            assert!(outlet.is_closed());
            assert!(received(&mut far.inlet).is_empty());
        }

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_filter_applies_to_events() {
        let (engine, connector) = engine(RelayConfig::default().allow([10]));
        let upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        let (mut consumer, _) = join(&engine).await;
        received(&mut consumer.inlet);

        let blocked = r#"{"post_type":"message","group_id":20}"#;
        let allowed = r#"{"post_type":"message","group_id":"10"}"#;
        send(&upstream.outlet, blocked).await;
        send(&upstream.outlet, allowed).await;
        settle().await;

        assert_eq!(received(&mut consumer.inlet), vec![Frame::text(allowed)]);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_upstream_triggers_reconnect() {
        let (engine, connector) =
            engine(RelayConfig::default().reconnect_delay(Duration::from_secs(5)));
        let upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;
        let first = engine.links().current().await.unwrap();

        send(&upstream.outlet, "definitely not json").await;
        settle().await;

        assert!(first.closed().is_cancelled());
        assert_ne!(engine.links().state(), LinkState::Connected);
        assert_eq!(engine.stats().malformed, 1);

        let _second = connector.offer();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let second = engine.links().current().await.unwrap();
        assert_ne!(first.id(), second.id());

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_close_triggers_reconnect() {
        let (engine, connector) = engine(RelayConfig::default());
        let upstream = connector.offer();
        let _next = connector.offer();
        engine.start();
        engine.links().wait_connected().await;
        let first = engine.links().current().await.unwrap();

        upstream.outlet.close().await;
        settle().await;

        let second = engine.links().current().await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(engine.stats().reconnects, 2);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_send_failure_dead_letters() {
        let (engine, connector) =
            engine(RelayConfig::default().reconnect_delay(Duration::from_secs(5)));
        let upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;
        let first = engine.links().current().await.unwrap();

        // Relay-side sends fail once the far end stops reading, while the
        // receive side stays open
        let MemoryEndpoint { outlet: _keep, inlet } = upstream;
        drop(inlet);

        let (consumer, _) = join(&engine).await;
        let command = r#"{"action":"send_msg","params":{"user_id":1}}"#;
        send(&consumer.outlet, command).await;
        settle().await;

        assert!(first.closed().is_cancelled());
        assert_eq!(engine.links().dead_letters().len().await, 1);

        let mut next = connector.offer();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(received(&mut next.inlet), vec![Frame::text(command)]);

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_command_closes_only_that_consumer() {
        let (engine, connector) = engine(RelayConfig::default());
        let _upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        let (bad, bad_outlet) = join(&engine).await;
        let (_good, _) = join(&engine).await;
        let (asker, _) = join(&engine).await;

        send(&asker.outlet, r#"{"action":"get_status","echo":"pending"}"#).await;
        send(&bad.outlet, "[1, 2, 3]").await;
        settle().await;

        assert!(bad_outlet.is_closed());
        assert_eq!(engine.consumers().len().await, 2);
        assert_eq!(engine.correlations().len(), 1);

        // Leaving drops the consumer's outstanding echoes
        asker.outlet.close().await;
        settle().await;
        assert_eq!(engine.consumers().len().await, 1);
        assert!(engine.correlations().is_empty());

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_reconnects_once() {
        let (engine, connector) = engine(
            RelayConfig::default()
                .dead_time(Duration::from_secs(40))
                .heartbeat_interval(Duration::from_secs(30))
                .reconnect_delay(Duration::from_secs(5)),
        );
        let upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        send(&upstream.outlet, LIFECYCLE).await;
        settle().await;
        let requests = engine.links().reconnect_requests();

        // Endpoint stays silent
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(engine.links().reconnect_requests(), requests + 1);
        assert!(engine.links().current().await.is_none());

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let (engine, connector) = engine(RelayConfig::default());
        let mut upstream = connector.offer();
        engine.start();
        engine.links().wait_connected().await;

        let (_consumer, consumer_outlet) = join(&engine).await;
        engine.shutdown().await;

        assert!(consumer_outlet.is_closed());
        assert!(engine.consumers().is_empty().await);
        assert_eq!(engine.links().state(), LinkState::Disconnected);
        assert!(matches!(
            upstream.inlet.recv().await,
            Received::Closed(None)
        ));
    }
}
