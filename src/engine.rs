//! Discovery engine: one serialized worker over both discovery sources.
//!
//! The [`Engine`] owns a background task that holds the
//! [`ServiceRegistry`] and the [`ConnectivityPolicy`]. Local browsing and
//! wide-area walks push [`DiscoveryEvent`]s into a queue the worker drains;
//! callers talk to it through commands. Every registry change is fanned out
//! to the [`CandidateListProjection`] and to every
//! [`subscribe()`](Engine::subscribe) receiver.
//!
//! ```ignore
//! let (projection, mut list) = projection::channel();
//! let mut engine = Engine::builder(EngineConfig::default().wide_area_domain("example.com"))
//!     .local_browser(Arc::new(MdnsBrowser::new()?))
//!     .dns_resolver(Arc::new(HickoryResolver::from_system_conf()?))
//!     .projection(projection)
//!     .spawn();
//! engine.start_local()?;
//! engine.network(NetworkSignal::capabilities([TransportKind::Cellular]))?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::connectivity::{ConnectivityPolicy, NetworkSignal, PolicyAction, Transport};
use crate::local::{LocalBrowser, LocalDiscoveryClient};
use crate::probe::{PingProber, Prober};
use crate::projection::CandidateListProjection;
use crate::record::{DiscoveryEvent, Observation, Origin, ServiceRecord};
use crate::registry::{ProbeReading, RegistryEvent, ServiceRegistry};
use crate::wide_area::{DnsResolver, WideAreaResolver};
use crate::{Error, Result};

const UPDATES_CAPACITY: usize = 64;

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    browser: Option<Arc<dyn LocalBrowser>>,
    resolver: Option<Arc<dyn DnsResolver>>,
    prober: Option<Arc<dyn Prober>>,
    projection: Option<CandidateListProjection>,
}

impl EngineBuilder {
    /// Start from `config`. No discovery source is enabled yet.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            browser: None,
            resolver: None,
            prober: None,
            projection: None,
        }
    }

    /// Browse the local segment with `browser`.
    pub fn local_browser(mut self, browser: Arc<dyn LocalBrowser>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Walk the configured wide-area domain with `resolver`.
    pub fn dns_resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Sample latency with `prober` instead of the ping subprocess.
    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Mirror registry changes into `projection`.
    pub fn projection(mut self, projection: CandidateListProjection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Spawn the worker. Must be called within a Tokio runtime.
    pub fn spawn(self) -> Engine {
        let EngineBuilder {
            config,
            browser,
            resolver,
            prober,
            projection,
        } = self;

        let prober = prober.unwrap_or_else(|| Arc::new(PingProber::new(&config.probe)));
        let wide_area = match (resolver, config.wide_area_domain.as_deref()) {
            (Some(resolver), Some(domain)) => Some(Arc::new(WideAreaResolver::new(
                resolver,
                domain,
                config.service_type.clone(),
            ))),
            (Some(_), None) => {
                warn!("DNS resolver set without a wide-area domain, wide-area discovery disabled");
                None
            }
            _ => None,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (walks_tx, walks_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);

        let worker = Worker {
            registry: ServiceRegistry::new(prober),
            policy: ConnectivityPolicy::new(),
            projection,
            updates: updates.clone(),
            wide_area,
            wide_area_timeout: config.wide_area_timeout,
            walk_results: walks_tx,
            walk: None,
            epoch: 0,
        };
        let task = tokio::spawn(worker.run(events_rx, walks_rx, commands_rx));

        let local = browser.map(|browser| LocalDiscoveryClient::new(browser, events_tx.clone()));

        Engine {
            config,
            commands: commands_tx,
            events: events_tx,
            updates,
            local,
            task,
        }
    }
}

enum Command {
    Network(NetworkSignal),
    RunWideArea,
    Tick(oneshot::Sender<Vec<ProbeReading>>),
    Snapshot(oneshot::Sender<Vec<ServiceRecord>>),
    Transport(oneshot::Sender<Option<Transport>>),
    Shutdown,
}

/// Handle to a running discovery engine.
///
/// Dropping the handle stops local browsing and aborts the worker, which
/// stops every latency probe.
pub struct Engine {
    config: EngineConfig,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    updates: broadcast::Sender<RegistryEvent>,
    local: Option<LocalDiscoveryClient>,
    task: JoinHandle<()>,
}

impl Engine {
    /// Start building an engine.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start (or restart) local browsing. A no-op without a local browser.
    pub fn start_local(&mut self) -> Result<()> {
        let service_type = self.config.local_service_type();
        match self.local.as_mut() {
            Some(local) => local.start(&service_type),
            None => {
                debug!("no local browser configured");
                Ok(())
            }
        }
    }

    /// Stop local browsing.
    pub fn stop_local(&mut self) {
        if let Some(local) = self.local.as_mut() {
            local.stop();
        }
    }

    /// Whether local browsing is active.
    pub fn local_running(&self) -> bool {
        self.local.as_ref().is_some_and(LocalDiscoveryClient::is_running)
    }

    /// Feed a transport-change notification to the connectivity policy.
    pub fn network(&self, signal: NetworkSignal) -> Result<()> {
        self.command(Command::Network(signal))
    }

    /// Trigger a wide-area walk regardless of the transport state.
    pub fn run_wide_area(&self) -> Result<()> {
        self.command(Command::RunWideArea)
    }

    /// Inject a discovery event from an external source.
    pub fn observe(&self, event: DiscoveryEvent) -> Result<()> {
        self.events.send(event).map_err(|_| Error::EngineStopped)
    }

    /// Sample every probe and return the averages in insertion order.
    ///
    /// The averages are also forwarded to the projection.
    pub async fn tick(&self) -> Result<Vec<ProbeReading>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Tick(tx))?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Current registry contents in insertion order.
    pub async fn snapshot(&self) -> Result<Vec<ServiceRecord>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Snapshot(tx))?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Current transport classification.
    pub async fn transport(&self) -> Result<Option<Transport>> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Transport(tx))?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Receive registry membership changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.updates.subscribe()
    }

    /// Stop local browsing and wait for the worker to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop_local();
        self.command(Command::Shutdown)?;
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "engine worker ended abnormally");
        }
        Ok(())
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::EngineStopped)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_local();
        self.task.abort();
    }
}

/// Observations from one wide-area walk, tagged with the purge epoch the
/// walk started in.
struct WalkResult {
    epoch: u64,
    observed: Vec<Observation>,
}

struct Worker {
    registry: ServiceRegistry,
    policy: ConnectivityPolicy,
    projection: Option<CandidateListProjection>,
    updates: broadcast::Sender<RegistryEvent>,
    wide_area: Option<Arc<WideAreaResolver>>,
    wide_area_timeout: Option<Duration>,
    walk_results: mpsc::UnboundedSender<WalkResult>,
    walk: Option<JoinHandle<()>>,
    // Bumped by every wide-area purge; results from older walks are stale.
    epoch: u64,
}

impl Worker {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        mut walks: mpsc::UnboundedReceiver<WalkResult>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        debug!("engine worker started");
        loop {
            tokio::select! {
                biased;

                // Drain discovery events before acting on commands.
                Some(event) = events.recv() => self.on_event(event),

                Some(result) = walks.recv() => self.on_walk(result),

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            }
        }
        if let Some(walk) = self.walk.take() {
            walk.abort();
        }
        info!(records = self.registry.len(), "engine worker stopped");
    }

    fn on_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Observed(obs) => {
                if let Some(change) = self.registry.reconcile(obs).into_event() {
                    self.publish(change);
                }
            }
            DiscoveryEvent::Lost { name } => {
                if let Some(change) = self.registry.remove_local(&name) {
                    self.publish(change);
                }
            }
        }
    }

    fn on_walk(&mut self, result: WalkResult) {
        if result.epoch != self.epoch {
            debug!(
                walk_epoch = result.epoch,
                epoch = self.epoch,
                discarded = result.observed.len(),
                "dropping results of a walk that started before the last purge"
            );
            return;
        }
        for obs in result.observed {
            if let Some(change) = self.registry.reconcile(obs).into_event() {
                self.publish(change);
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Network(signal) => match self.policy.observe(&signal) {
                Some(PolicyAction::RunWideArea) => self.spawn_walk(),
                Some(PolicyAction::PurgeWideArea) => self.purge_wide_area(),
                None => {}
            },
            Command::RunWideArea => self.spawn_walk(),
            Command::Tick(reply) => {
                let readings = self.registry.tick();
                if let Some(projection) = &self.projection {
                    for reading in &readings {
                        projection.latency(&reading.key, reading.average_ms);
                    }
                }
                let _ = reply.send(readings);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.registry.records());
            }
            Command::Transport(reply) => {
                let _ = reply.send(self.policy.state());
            }
            Command::Shutdown => {}
        }
    }

    fn spawn_walk(&mut self) {
        let Some(resolver) = self.wide_area.clone() else {
            debug!("wide-area discovery not configured, ignoring trigger");
            return;
        };
        if self.walk.as_ref().is_some_and(|walk| !walk.is_finished()) {
            debug!("wide-area walk already in flight, skipping trigger");
            return;
        }

        let results = self.walk_results.clone();
        let timeout = self.wide_area_timeout;
        let epoch = self.epoch;
        self.walk = Some(tokio::spawn(async move {
            let walk = resolver.run();
            let observed = match timeout {
                Some(limit) => match time::timeout(limit, walk).await {
                    Ok(observed) => observed,
                    Err(_) => {
                        warn!(domain = resolver.domain(), ?limit, "wide-area walk timed out");
                        return;
                    }
                },
                None => walk.await,
            };
            let _ = results.send(WalkResult { epoch, observed });
        }));
    }

    fn purge_wide_area(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if let Some(walk) = self.walk.take() {
            walk.abort();
        }
        for change in self.registry.purge_origin(Origin::WideArea) {
            self.publish(change);
        }
    }

    fn publish(&self, change: RegistryEvent) {
        if let Some(projection) = &self.projection {
            match &change {
                RegistryEvent::Added(record) => projection.add(record),
                RegistryEvent::Updated(record) => projection.update(record),
                RegistryEvent::Removed(record) => projection.remove(&record.key),
            }
        }
        // No subscribers is fine.
        let _ = self.updates.send(change);
    }
}
