use crate::{
    catalog::{Bundle, BundleCatalog},
    error::{DeliveryError, PoolError},
    messaging::{
        events::{ProxyEvent, RotationEvent, TopologyEvent},
        EventBroker, Received, Subscription,
    },
    registry::{ProxyId, ProxyRecord, ProxyRegistry},
    transport::AgentClient,
    wait::poll_until,
    workerpool::{Job, WorkerPool},
};
use futures_util::{future::join_all, FutureExt};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use strum_macros::Display;
use tokio::{sync::oneshot, task::JoinHandle};

use self::{slots::DeliverySlots, stats::DeliveryStats};

pub(crate) mod slots;
pub(crate) mod stats;

#[derive(Clone, Debug)]
pub(crate) struct DistributionConfig {
    pub(crate) readiness_interval: Duration,
    pub(crate) readiness_timeout: Duration,
    /// Upper bound on a single push to a single proxy
    pub(crate) push_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize)]
pub(crate) enum ServerState {
    Starting,
    Ready,
    /// The agent endpoint did not come up in time. Still running, still retrying.
    Degraded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeliveryOutcome {
    Delivered { version: u64 },
    Failed(DeliveryError),
    /// Superseded by a newer version or dropped because the proxy went away
    Discarded(DeliveryError),
    /// The server stopped before the delivery could run
    Cancelled,
}

/// A delivery that has been accepted. Await [`DeliveryTicket::outcome`] to learn how it went.
#[derive(Debug)]
pub(crate) struct DeliveryTicket {
    pub(crate) proxy_id: ProxyId,
    pub(crate) version: u64,
    outcome: oneshot::Receiver<DeliveryOutcome>,
}

impl DeliveryTicket {
    pub(crate) async fn outcome(self) -> DeliveryOutcome {
        self.outcome.await.unwrap_or(DeliveryOutcome::Cancelled)
    }
}

#[derive(Debug, Default)]
pub(crate) struct BroadcastReport {
    pub(crate) outcomes: BTreeMap<ProxyId, DeliveryOutcome>,
}

impl BroadcastReport {
    pub(crate) fn delivered(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| matches!(outcome, DeliveryOutcome::Delivered { .. }))
            .count()
    }

    pub(crate) fn failed(&self) -> Vec<(&ProxyId, &DeliveryOutcome)> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !matches!(outcome, DeliveryOutcome::Delivered { .. }))
            .collect()
    }
}

/// Turns rotation, topology and proxy connection events into versioned bundle deliveries.
///
/// Each proxy has a single pending slot. A newer delivery for a proxy replaces an older one that
/// has not started, and at most one delivery per proxy runs at a time, so the transport sees every
/// proxy's versions in increasing order.
pub(crate) struct DistributionServer {
    registry: Arc<ProxyRegistry>,
    broker: Arc<EventBroker>,
    pool: Arc<WorkerPool>,
    client: Arc<dyn AgentClient>,
    catalog: Arc<dyn BundleCatalog>,
    config: DistributionConfig,
    slots: DeliverySlots,
    stats: DeliveryStats,
    state: Mutex<ServerState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Subscriptions {
    rotations: Subscription<RotationEvent>,
    proxies: Subscription<ProxyEvent>,
    topology: Subscription<TopologyEvent>,
}

impl DistributionServer {
    pub(crate) fn new(
        registry: Arc<ProxyRegistry>,
        broker: Arc<EventBroker>,
        pool: Arc<WorkerPool>,
        client: Arc<dyn AgentClient>,
        catalog: Arc<dyn BundleCatalog>,
        config: DistributionConfig,
    ) -> Self {
        Self {
            registry,
            broker,
            pool,
            client,
            catalog,
            config,
            slots: DeliverySlots::default(),
            stats: DeliveryStats::default(),
            state: Mutex::new(ServerState::Starting),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub(crate) fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Last version assigned to `proxy_id`, 0 if none
    pub(crate) fn version(&self, proxy_id: &ProxyId) -> u64 {
        self.slots.version(proxy_id)
    }

    /// Proxies the server currently keeps delivery state for
    pub(crate) fn tracked_proxies(&self) -> usize {
        self.slots.len()
    }

    /// Wait for the agent endpoint, push the bootstrap bundle to every registered proxy and start
    /// reacting to events. If the endpoint does not come up in time the server keeps running in
    /// the degraded state and finishes bootstrapping whenever it does.
    pub(crate) async fn start(self: &Arc<Self>) -> ServerState {
        // Subscribe before anything else so no event published while we wait gets lost
        let subscriptions = Subscriptions {
            rotations: self.broker.rotations.subscribe(),
            proxies: self.broker.proxies.subscribe(),
            topology: self.broker.topology.subscribe(),
        };

        match self.wait_for_agent().await {
            Ok(waited) => {
                log::info!("Agent endpoint ready after {:?}", waited);
                self.bootstrap().await;
                self.set_state(ServerState::Ready);
            }
            Err(err) => {
                log::error!("{}, continuing in degraded state", err);
                self.set_state(ServerState::Degraded);
                self.spawn(Arc::clone(self).recover());
            }
        }

        self.spawn(Arc::clone(self).listen(subscriptions));

        self.state()
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(task));
    }

    async fn wait_for_agent(&self) -> Result<Duration, DeliveryError> {
        poll_until(self.config.readiness_interval, self.config.readiness_timeout, "agent endpoint", || {
            self.client.is_agent_ready()
        })
        .await
    }

    async fn recover(self: Arc<Self>) {
        while self.wait_for_agent().await.is_err() {
            log::warn!("Agent endpoint still not ready, server remains degraded");
        }

        log::info!("Agent endpoint became ready, leaving degraded state");
        self.bootstrap().await;
        self.set_state(ServerState::Ready);
    }

    async fn bootstrap(self: &Arc<Self>) {
        let bundle = match self.catalog.bootstrap_bundle() {
            Ok(bundle) => bundle,
            Err(err) => {
                log::error!("Building bootstrap bundle failed, skipping bootstrap broadcast: {:#}", err);
                return;
            }
        };

        let report = self.broadcast(&bundle).await;
        log::info!(
            "Bootstrap broadcast delivered to {}/{} proxies",
            report.delivered(),
            report.outcomes.len()
        );
        for (proxy_id, outcome) in report.failed() {
            log::warn!("Bootstrap delivery to {} did not complete: {:?}", proxy_id, outcome);
        }
    }

    /// Push `bundle` to every currently registered proxy and wait for all of them. A failure for
    /// one proxy only shows up in its own entry of the report.
    pub(crate) async fn broadcast(self: &Arc<Self>, bundle: &Bundle) -> BroadcastReport {
        let mut tickets = Vec::new();
        let mut report = BroadcastReport::default();

        for record in self.registry.list() {
            match self.enqueue(&record, bundle.clone()).await {
                Ok(ticket) => tickets.push(ticket),
                Err(_) => {
                    report.outcomes.insert(record.proxy_id, DeliveryOutcome::Cancelled);
                }
            }
        }

        let proxy_ids = tickets.iter().map(|ticket| ticket.proxy_id.clone()).collect::<Vec<_>>();
        let outcomes = join_all(tickets.into_iter().map(DeliveryTicket::outcome)).await;
        report.outcomes.extend(proxy_ids.into_iter().zip(outcomes));

        report
    }

    /// Give `bundle` the proxy's next version and get it delivered. Waits only if the worker pool
    /// queue is full.
    pub(crate) async fn enqueue(self: &Arc<Self>, record: &ProxyRecord, bundle: Bundle) -> Result<DeliveryTicket, PoolError> {
        let (done, outcome) = oneshot::channel();
        let enqueued = self.slots.enqueue(&record.proxy_id, record.generation, bundle, done);
        self.stats.record_enqueued();
        self.registry.set_enqueued(&record.proxy_id, true);

        if let Some(superseded) = enqueued.superseded {
            let version = superseded.version;
            log::debug!(
                "Version {} for {} superseded by {} before it started",
                version,
                record.proxy_id,
                enqueued.version
            );
            self.finish(
                superseded,
                DeliveryOutcome::Discarded(DeliveryError::StaleVersionDiscarded {
                    proxy_id: record.proxy_id.clone(),
                    version,
                    superseded_by: enqueued.version,
                }),
            );
        }

        if enqueued.schedule {
            self.schedule(record.proxy_id.clone()).await?;
        }

        Ok(DeliveryTicket {
            proxy_id: record.proxy_id.clone(),
            version: enqueued.version,
            outcome,
        })
    }

    fn drain_job(self: &Arc<Self>, proxy_id: ProxyId) -> Job {
        Arc::clone(self).drain(proxy_id).boxed()
    }

    async fn schedule(self: &Arc<Self>, proxy_id: ProxyId) -> Result<(), PoolError> {
        if let Err(err) = self.pool.submit(self.drain_job(proxy_id.clone())).await {
            if let Some(pending) = self.slots.abandon(&proxy_id) {
                self.finish(pending, DeliveryOutcome::Cancelled);
            }
            return Err(err);
        }

        Ok(())
    }

    /// Worker pool job: deliver the proxy's pending bundle, if it still has one
    async fn drain(self: Arc<Self>, proxy_id: ProxyId) -> anyhow::Result<()> {
        let Some(pending) = self.slots.take(&proxy_id) else {
            return Ok(());
        };
        self.registry.set_enqueued(&proxy_id, false);

        let outcome = self.deliver(&proxy_id, pending.version, pending.generation, &pending.bundle).await;
        let result = match &outcome {
            DeliveryOutcome::Failed(err) => Err(anyhow::anyhow!(err.clone())),
            _ => Ok(()),
        };
        self.finish(pending, outcome);

        // Something newer arrived while we were pushing. Resubmit instead of looping so one busy
        // proxy cannot hog a worker.
        if self.slots.reschedule_needed(&proxy_id) {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.schedule(proxy_id.clone()).await {
                    log::warn!("Could not reschedule delivery to {}: {}", proxy_id, err);
                }
            });
        } else if self.registry.get(&proxy_id).is_none() {
            self.slots.evict_idle(&proxy_id);
        }

        result
    }

    async fn deliver(&self, proxy_id: &ProxyId, version: u64, generation: u64, bundle: &Bundle) -> DeliveryOutcome {
        if let Err(err) = self.registry.ensure_current(proxy_id, generation) {
            log::debug!("Dropping version {} for {}: {}", version, proxy_id, err);
            return DeliveryOutcome::Discarded(DeliveryError::ProxyGone(proxy_id.clone()));
        }

        match tokio::time::timeout(self.config.push_timeout, self.client.push_bundle(proxy_id, version, bundle)).await {
            Err(_) => {
                log::warn!("Push of version {} to {} timed out after {:?}", version, proxy_id, self.config.push_timeout);
                DeliveryOutcome::Failed(DeliveryError::PushTimeout {
                    proxy_id: proxy_id.clone(),
                    version,
                    after: self.config.push_timeout,
                })
            }
            Ok(Err(err)) => {
                log::warn!("Push of version {} to {} failed: {:#}", version, proxy_id, err);
                DeliveryOutcome::Failed(DeliveryError::AgentUnreachable {
                    proxy_id: proxy_id.clone(),
                    reason: format!("{:#}", err),
                })
            }
            // The proxy may have disconnected while we were pushing, in which case the result is
            // meaningless
            Ok(Ok(())) => match self.registry.update_last_delivered(proxy_id, generation, version) {
                Ok(()) => {
                    log::debug!("Delivered version {} to {}", version, proxy_id);
                    DeliveryOutcome::Delivered { version }
                }
                Err(err) => {
                    log::debug!("Discarding delivery of version {} to {}: {}", version, proxy_id, err);
                    DeliveryOutcome::Discarded(DeliveryError::ProxyGone(proxy_id.clone()))
                }
            },
        }
    }

    fn finish(&self, pending: slots::PendingDelivery, outcome: DeliveryOutcome) {
        self.stats.record(&outcome);
        pending.finish(outcome);
    }

    /// Drop the proxy's unstarted delivery, if any. A delivery already in flight runs to
    /// completion or timeout and its result is discarded.
    pub(crate) fn cancel(&self, proxy_id: &ProxyId) {
        if let Some(pending) = self.slots.cancel(proxy_id) {
            log::debug!("Cancelled pending version {} for {}", pending.version, proxy_id);
            self.finish(pending, DeliveryOutcome::Discarded(DeliveryError::ProxyGone(proxy_id.clone())));
        }
    }

    async fn listen(self: Arc<Self>, mut subscriptions: Subscriptions) {
        log::info!("Distribution listener started");

        loop {
            // The only place this loop can stall is enqueue waiting on a full worker pool queue
            tokio::select! {
                received = subscriptions.rotations.recv() => match received {
                    Some(Received::Event(event)) => {
                        log::info!("Rotation of {} (serial {})", event.identity, event.certificate.serial_number);
                        self.refresh(self.registry.list_by_identity(&event.identity)).await;
                    }
                    Some(Received::Lagged(_)) => self.resync("rotations").await,
                    None => break,
                },
                received = subscriptions.topology.recv() => match received {
                    Some(Received::Event(event)) => {
                        let affected = self
                            .registry
                            .list()
                            .into_iter()
                            .filter(|record| event.affects(&record.identity))
                            .collect::<Vec<_>>();
                        log::info!("Topology change affecting {} proxies", affected.len());
                        self.refresh(affected).await;
                    }
                    Some(Received::Lagged(_)) => self.resync("topology").await,
                    None => break,
                },
                received = subscriptions.proxies.recv() => match received {
                    // A (re)connected proxy gets a full bundle, never a diff
                    Some(Received::Event(ProxyEvent::Connected { proxy_id, .. })) => {
                        if let Some(record) = self.registry.get(&proxy_id) {
                            self.refresh(vec![record]).await;
                        }
                    }
                    Some(Received::Event(ProxyEvent::Disconnected { proxy_id })) => self.forget(&proxy_id),
                    Some(Received::Lagged(_)) => self.resync("proxies").await,
                    None => break,
                },
            }
        }

        log::info!(
            "Distribution listener stopped, {} rotation, {} proxy and {} topology events dropped",
            subscriptions.rotations.dropped(),
            subscriptions.proxies.dropped(),
            subscriptions.topology.dropped()
        );
    }

    /// Lost events can be connects, rotations or topology changes for anyone, so every registered
    /// proxy gets a fresh bundle. Connects and disconnects that were lost still show in the
    /// registry, and slots of proxies that left are evicted.
    async fn resync(self: &Arc<Self>, topic: &str) {
        let records = self.registry.list();
        log::warn!("Events lost on {}, refreshing all {} registered proxies", topic, records.len());

        let evicted = self.slots.evict_departed(|proxy_id| self.registry.get(proxy_id).is_some());
        if evicted > 0 {
            log::debug!("Evicted delivery state of {} departed proxies", evicted);
        }
        self.refresh(records).await;
    }

    /// Cancel what is pending for a proxy that went away and drop its slot once it is idle. A
    /// delivery in flight evicts the slot itself when it finishes.
    fn forget(&self, proxy_id: &ProxyId) {
        if self.registry.get(proxy_id).is_some() {
            // Already reconnected, the Connected event that follows refreshes it
            return;
        }

        self.cancel(proxy_id);
        self.slots.evict_idle(proxy_id);
    }

    async fn refresh(self: &Arc<Self>, records: Vec<ProxyRecord>) {
        for record in records {
            let bundle = match self.catalog.bundle_for(&record) {
                Ok(bundle) => bundle,
                Err(err) => {
                    log::error!("Building bundle for {} failed: {:#}", record.proxy_id, err);
                    continue;
                }
            };

            if let Err(err) = self.enqueue(&record, bundle).await {
                log::warn!("Not delivering to {}: {}", record.proxy_id, err);
            }
        }
    }

    /// Stop the listener and any pending recovery. Deliveries already queued are left to the
    /// worker pool.
    pub(crate) fn shutdown(&self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pki::{
            authority::{tests::test_ca, CertificateIssuer},
            certificate::Identity,
        },
        registry::ConnectionHandle,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, Ordering::SeqCst},
    };
    use tokio::{
        sync::{mpsc, Notify},
        time::Instant,
    };

    /// Records pushes. Can become ready at a given instant, hang forever for some proxies or hold
    /// pushes until a gate opens.
    struct FakeAgent {
        ready_at: Option<Instant>,
        ready: AtomicBool,
        unreachable: HashSet<ProxyId>,
        gate: Option<Arc<Notify>>,
        pushes: mpsc::UnboundedSender<(ProxyId, u64)>,
    }

    impl FakeAgent {
        fn new() -> (Self, mpsc::UnboundedReceiver<(ProxyId, u64)>) {
            let (pushes, received) = mpsc::unbounded_channel();
            (
                Self {
                    ready_at: None,
                    ready: AtomicBool::new(true),
                    unreachable: HashSet::new(),
                    gate: None,
                    pushes,
                },
                received,
            )
        }
    }

    #[async_trait]
    impl AgentClient for FakeAgent {
        async fn is_agent_ready(&self) -> Result<bool> {
            Ok(self.ready.load(SeqCst) && self.ready_at.map_or(true, |ready_at| Instant::now() >= ready_at))
        }

        async fn push_bundle(&self, target: &ProxyId, version: u64, _bundle: &Bundle) -> Result<()> {
            if self.unreachable.contains(target) {
                std::future::pending::<()>().await;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let _ = self.pushes.send((target.clone(), version));
            Ok(())
        }
    }

    struct NamedCatalog;

    impl BundleCatalog for NamedCatalog {
        fn bootstrap_bundle(&self) -> Result<Bundle> {
            Ok(Bundle::new(Bytes::from_static(b"bootstrap")))
        }

        fn bundle_for(&self, proxy: &ProxyRecord) -> Result<Bundle> {
            Ok(Bundle::new(Bytes::from(format!("bundle for {}", proxy.proxy_id))))
        }
    }

    struct Fixture {
        server: Arc<DistributionServer>,
        registry: Arc<ProxyRegistry>,
        broker: Arc<EventBroker>,
        pool: Arc<WorkerPool>,
    }

    fn fixture(agent: FakeAgent, workers: usize, config: DistributionConfig) -> Fixture {
        fixture_with_buffer(agent, workers, config, 64)
    }

    fn fixture_with_buffer(agent: FakeAgent, workers: usize, config: DistributionConfig, subscriber_buffer: usize) -> Fixture {
        let broker = Arc::new(EventBroker::new(subscriber_buffer));
        let registry = Arc::new(ProxyRegistry::new(broker.clone()));
        let pool = Arc::new(WorkerPool::new(workers, 16));
        let server = Arc::new(DistributionServer::new(
            registry.clone(),
            broker.clone(),
            pool.clone(),
            Arc::new(agent),
            Arc::new(NamedCatalog),
            config,
        ));
        Fixture {
            server,
            registry,
            broker,
            pool,
        }
    }

    fn config() -> DistributionConfig {
        DistributionConfig {
            readiness_interval: Duration::from_secs(5),
            readiness_timeout: Duration::from_secs(20),
            push_timeout: Duration::from_secs(1),
        }
    }

    fn register(registry: &ProxyRegistry, proxy_id: &str, identity: &str) -> ProxyRecord {
        registry.register(
            ProxyId::from(proxy_id),
            Identity::from(identity),
            ConnectionHandle(proxy_id.to_string()),
        )
    }

    fn bundle() -> Bundle {
        Bundle::new(Bytes::from_static(b"config"))
    }

    /// Occupies the pool's only worker until the returned gate is opened
    async fn block_pool(pool: &WorkerPool) -> Arc<Notify> {
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let (job_started, job_gate) = (started.clone(), gate.clone());
        pool.submit(
            async move {
                job_started.notify_one();
                job_gate.notified().await;
                Ok::<_, anyhow::Error>(())
            }
            .boxed(),
        )
        .await
        .unwrap();
        started.notified().await;
        gate
    }

    async fn no_more_pushes(pushes: &mut mpsc::UnboundedReceiver<(ProxyId, u64)>) {
        assert!(tokio::time::timeout(Duration::from_millis(200), pushes.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_wait_proceeds_and_bootstraps() {
        let (mut agent, mut pushes) = FakeAgent::new();
        agent.ready_at = Some(Instant::now() + Duration::from_secs(12));
        let fixture = fixture(agent, 2, config());
        register(&fixture.registry, "p1", "bookstore");

        let started = Instant::now();
        assert_eq!(fixture.server.start().await, ServerState::Ready);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(20));

        assert_eq!(pushes.recv().await, Some((ProxyId::from("p1"), 1)));
        assert_eq!(fixture.registry.get(&ProxyId::from("p1")).unwrap().last_delivered_version, 1);

        fixture.server.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_agent_degrades_then_recovers() {
        let (mut agent, mut pushes) = FakeAgent::new();
        agent.ready = AtomicBool::new(false);
        let agent = Arc::new(agent);

        let broker = Arc::new(EventBroker::new(64));
        let registry = Arc::new(ProxyRegistry::new(broker.clone()));
        register(&registry, "p1", "bookstore");
        let server = Arc::new(DistributionServer::new(
            registry.clone(),
            broker,
            Arc::new(WorkerPool::new(1, 16)),
            agent.clone(),
            Arc::new(NamedCatalog),
            config(),
        ));

        assert_eq!(server.start().await, ServerState::Degraded);
        assert_eq!(server.state(), ServerState::Degraded);

        agent.ready.store(true, SeqCst);
        assert_eq!(pushes.recv().await, Some((ProxyId::from("p1"), 1)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(server.state(), ServerState::Ready);

        server.shutdown();
    }

    #[tokio::test]
    async fn rotation_reaches_only_proxies_with_that_identity() {
        let (agent, mut pushes) = FakeAgent::new();
        let fixture = fixture(agent, 4, config());
        for (proxy_id, identity) in [("p1", "bookstore"), ("p2", "bookbuyer"), ("p3", "bookwarehouse")] {
            register(&fixture.registry, proxy_id, identity);
        }

        assert_eq!(fixture.server.start().await, ServerState::Ready);
        let mut bootstrapped = Vec::new();
        for _ in 0..3 {
            bootstrapped.push(pushes.recv().await.unwrap());
        }
        bootstrapped.sort();
        assert_eq!(
            bootstrapped,
            vec![(ProxyId::from("p1"), 1), (ProxyId::from("p2"), 1), (ProxyId::from("p3"), 1)]
        );

        let ca = test_ca(Duration::from_secs(3600 * 48));
        let identity = Identity::from("bookstore");
        fixture.broker.rotations.publish(RotationEvent {
            identity: identity.clone(),
            certificate: Arc::new(ca.issue(&identity, Duration::from_secs(3600)).unwrap()),
            timestamp: Utc::now(),
        });

        assert_eq!(pushes.recv().await, Some((ProxyId::from("p1"), 2)));
        no_more_pushes(&mut pushes).await;
        assert_eq!(fixture.server.stats().enqueued(), 4);

        fixture.server.shutdown();
    }

    #[tokio::test]
    async fn topology_event_reaches_affected_proxies() {
        let (agent, mut pushes) = FakeAgent::new();
        let fixture = fixture(agent, 4, config());
        register(&fixture.registry, "p1", "bookstore");
        register(&fixture.registry, "p2", "bookbuyer");

        fixture.server.start().await;
        for _ in 0..2 {
            pushes.recv().await.unwrap();
        }

        fixture
            .broker
            .topology
            .publish(TopologyEvent::identities([Identity::from("bookbuyer")]));
        assert_eq!(pushes.recv().await, Some((ProxyId::from("p2"), 2)));
        no_more_pushes(&mut pushes).await;

        fixture.broker.topology.publish(TopologyEvent::all());
        let mut refreshed = vec![pushes.recv().await.unwrap(), pushes.recv().await.unwrap()];
        refreshed.sort();
        assert_eq!(refreshed, vec![(ProxyId::from("p1"), 2), (ProxyId::from("p2"), 3)]);

        fixture.server.shutdown();
    }

    #[tokio::test]
    async fn connecting_proxy_gets_full_bundle() {
        let (agent, mut pushes) = FakeAgent::new();
        let fixture = fixture(agent, 2, config());
        fixture.server.start().await;

        register(&fixture.registry, "p1", "bookstore");
        assert_eq!(pushes.recv().await, Some((ProxyId::from("p1"), 1)));

        // Reconnect after disconnect continues the version sequence
        fixture.registry.unregister(&ProxyId::from("p1")).unwrap();
        register(&fixture.registry, "p1", "bookstore");
        assert_eq!(pushes.recv().await, Some((ProxyId::from("p1"), 2)));

        fixture.server.shutdown();
    }

    #[tokio::test]
    async fn lagging_listener_still_reaches_every_connected_proxy() {
        let (agent, mut pushes) = FakeAgent::new();
        let fixture = fixture_with_buffer(agent, 4, config(), 4);
        fixture.server.start().await;

        // No await in between, so the listener cannot keep up with the connect burst
        for i in 0..10 {
            register(&fixture.registry, &format!("p{}", i), "bookstore");
        }

        let mut reached = HashSet::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while reached.len() < 10 {
                let (proxy_id, _) = pushes.recv().await.unwrap();
                reached.insert(proxy_id);
            }
        })
        .await
        .unwrap();

        assert_eq!(fixture.broker.proxies.dropped(), 6);

        fixture.server.shutdown();
    }

    #[tokio::test]
    async fn lagging_listener_refreshes_after_lost_rotations() {
        let (agent, mut pushes) = FakeAgent::new();
        let fixture = fixture_with_buffer(agent, 4, config(), 2);
        register(&fixture.registry, "p1", "bookstore");
        register(&fixture.registry, "p2", "bookbuyer");
        fixture.server.start().await;
        for _ in 0..2 {
            pushes.recv().await.unwrap();
        }

        // bookstore's rotation is pushed out of the buffer by bookbuyer's
        let ca = test_ca(Duration::from_secs(3600 * 48));
        for identity in ["bookstore", "bookbuyer", "bookbuyer"] {
            let identity = Identity::from(identity);
            fixture.broker.rotations.publish(RotationEvent {
                identity: identity.clone(),
                certificate: Arc::new(ca.issue(&identity, Duration::from_secs(3600)).unwrap()),
                timestamp: Utc::now(),
            });
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while pushes.recv().await.unwrap().0 != ProxyId::from("p1") {}
        })
        .await
        .unwrap();
        assert_eq!(fixture.broker.rotations.dropped(), 1);

        fixture.server.shutdown();
    }

    #[tokio::test]
    async fn departed_proxies_leave_no_delivery_state() {
        let (agent, mut pushes) = FakeAgent::new();
        let fixture = fixture(agent, 4, config());
        fixture.server.start().await;

        for round in 0..5 {
            for i in 0..4 {
                register(&fixture.registry, &format!("p{}", i), "bookstore");
            }
            for _ in 0..4 {
                pushes.recv().await.unwrap();
            }
            for i in 0..4 {
                fixture.registry.unregister(&ProxyId::from(format!("p{}", i).as_str())).unwrap();
            }

            tokio::time::timeout(Duration::from_secs(5), async {
                while fixture.server.tracked_proxies() > 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("delivery state left behind in round {}", round));
        }

        // Coming back after eviction still moves the version forward
        register(&fixture.registry, "p0", "bookstore");
        let (proxy_id, version) = pushes.recv().await.unwrap();
        assert_eq!(proxy_id, ProxyId::from("p0"));
        assert!(version > 5);

        fixture.server.shutdown();
    }

    #[tokio::test]
    async fn unstarted_job_is_superseded_by_newer_version() {
        let (agent, mut pushes) = FakeAgent::new();
        let fixture = fixture(agent, 1, config());
        let record = register(&fixture.registry, "p1", "bookstore");

        let gate = block_pool(&fixture.pool).await;
        let older = fixture.server.enqueue(&record, bundle()).await.unwrap();
        let newer = fixture.server.enqueue(&record, bundle()).await.unwrap();
        assert_eq!((older.version, newer.version), (1, 2));
        gate.notify_one();

        assert_eq!(
            older.outcome().await,
            DeliveryOutcome::Discarded(DeliveryError::StaleVersionDiscarded {
                proxy_id: ProxyId::from("p1"),
                version: 1,
                superseded_by: 2,
            })
        );
        assert_eq!(newer.outcome().await, DeliveryOutcome::Delivered { version: 2 });

        assert_eq!(pushes.recv().await, Some((ProxyId::from("p1"), 2)));
        no_more_pushes(&mut pushes).await;
        assert_eq!(fixture.server.stats().superseded(), 1);
        assert_eq!(fixture.server.stats().delivered(), 1);
    }

    #[tokio::test]
    async fn deliveries_to_one_proxy_are_strictly_increasing() {
        let (agent, mut pushes) = FakeAgent::new();
        let fixture = fixture(agent, 4, config());
        let record = register(&fixture.registry, "p1", "bookstore");

        let mut tickets = Vec::new();
        for _ in 0..50 {
            tickets.push(fixture.server.enqueue(&record, bundle()).await.unwrap());
        }
        join_all(tickets.into_iter().map(DeliveryTicket::outcome)).await;

        let mut delivered = Vec::new();
        while let Ok((_, version)) = pushes.try_recv() {
            delivered.push(version);
        }

        assert!(!delivered.is_empty());
        assert!(delivered.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(delivered.last(), Some(&50));
        assert_eq!(fixture.registry.get(&record.proxy_id).unwrap().last_delivered_version, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_proxy_delays_others_at_most_push_timeout() {
        let (mut agent, mut pushes) = FakeAgent::new();
        agent.unreachable.insert(ProxyId::from("p1"));
        let fixture = fixture(agent, 1, config());
        let stuck = register(&fixture.registry, "p1", "bookstore");
        let healthy = register(&fixture.registry, "p2", "bookbuyer");

        let started = Instant::now();
        let stuck_ticket = fixture.server.enqueue(&stuck, bundle()).await.unwrap();
        let healthy_ticket = fixture.server.enqueue(&healthy, bundle()).await.unwrap();

        assert_eq!(healthy_ticket.outcome().await, DeliveryOutcome::Delivered { version: 1 });
        assert!(started.elapsed() <= config().push_timeout);
        assert_eq!(pushes.recv().await, Some((ProxyId::from("p2"), 1)));

        assert!(matches!(
            stuck_ticket.outcome().await,
            DeliveryOutcome::Failed(DeliveryError::PushTimeout { version: 1, .. })
        ));
        assert_eq!(fixture.server.stats().timed_out(), 1);
    }

    #[tokio::test]
    async fn broadcast_isolates_failures() {
        let (mut agent, _pushes) = FakeAgent::new();
        agent.unreachable.insert(ProxyId::from("p2"));
        let fixture = fixture(
            agent,
            4,
            DistributionConfig {
                push_timeout: Duration::from_millis(100),
                ..config()
            },
        );
        for proxy_id in ["p1", "p2", "p3"] {
            register(&fixture.registry, proxy_id, "bookstore");
        }

        let report = fixture.server.broadcast(&bundle()).await;

        assert_eq!(report.delivered(), 2);
        let failed = report.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, &ProxyId::from("p2"));
    }

    #[tokio::test]
    async fn unregister_cancels_pending_and_discards_in_flight() {
        let (mut agent, mut pushes) = FakeAgent::new();
        let push_gate = Arc::new(Notify::new());
        agent.gate = Some(push_gate.clone());
        let fixture = fixture(agent, 1, config());
        let p1 = register(&fixture.registry, "p1", "bookstore");
        let p2 = register(&fixture.registry, "p2", "bookbuyer");

        // p1's push is in flight (held at the gate), p2's waits behind it in the pool
        let in_flight = fixture.server.enqueue(&p1, bundle()).await.unwrap();
        while fixture.registry.get(&p1.proxy_id).unwrap().enqueued {
            tokio::task::yield_now().await;
        }
        let pending = fixture.server.enqueue(&p2, bundle()).await.unwrap();

        fixture.registry.unregister(&p1.proxy_id).unwrap();
        fixture.registry.unregister(&p2.proxy_id).unwrap();
        fixture.server.cancel(&p2.proxy_id);

        assert_eq!(
            pending.outcome().await,
            DeliveryOutcome::Discarded(DeliveryError::ProxyGone(ProxyId::from("p2")))
        );

        push_gate.notify_one();
        assert_eq!(pushes.recv().await, Some((ProxyId::from("p1"), 1)));
        assert_eq!(
            in_flight.outcome().await,
            DeliveryOutcome::Discarded(DeliveryError::ProxyGone(ProxyId::from("p1")))
        );
        assert_eq!(fixture.server.stats().discarded(), 2);
    }

    #[tokio::test]
    async fn enqueue_after_pool_shutdown_is_cancelled() {
        let (agent, _pushes) = FakeAgent::new();
        let fixture = fixture(agent, 1, config());
        let record = register(&fixture.registry, "p1", "bookstore");

        fixture.pool.shutdown().await;

        assert_eq!(fixture.server.enqueue(&record, bundle()).await.unwrap_err(), PoolError::ShutDown);
        assert_eq!(fixture.server.stats().cancelled(), 1);

        let report = fixture.server.broadcast(&bundle()).await;
        assert_eq!(report.outcomes.get(&record.proxy_id), Some(&DeliveryOutcome::Cancelled));
    }
}
