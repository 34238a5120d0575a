//! Local-segment discovery.
//!
//! [`LocalDiscoveryClient`] drives a [`LocalBrowser`] session, resolves each
//! found instance, and forwards [`DiscoveryEvent`]s to the engine queue.

pub mod mdns;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::record::{connection_key, DiscoveryEvent, Observation, Origin};
use crate::Result;

pub use mdns::MdnsBrowser;

/// An instance announced on the local segment, before resolution.
#[derive(Debug, Clone)]
pub struct RawInstance {
    /// Instance name without the service-type suffix.
    pub name: String,
    /// Fully qualified name as the platform reports it.
    pub fullname: String,
}

/// Address and metadata obtained by resolving a [`RawInstance`].
#[derive(Debug, Clone)]
pub struct ResolvedInstance {
    /// Host address, if the platform produced one.
    pub host: Option<String>,
    /// Service port.
    pub port: u16,
    /// Bracketed metadata record.
    pub txt: String,
}

/// Platform browse notification.
#[derive(Debug, Clone)]
pub enum BrowseEvent {
    /// An instance appeared.
    Found(RawInstance),
    /// An instance went away.
    Lost {
        /// Instance name without the service-type suffix.
        name: String,
    },
}

/// Stream of browse notifications.
pub type BrowseStream = Pin<Box<dyn Stream<Item = BrowseEvent> + Send>>;

/// A local-network service-browsing facility.
#[async_trait]
pub trait LocalBrowser: Send + Sync + 'static {
    /// Human-readable name for logging.
    fn name(&self) -> &'static str;

    /// Start browsing for `service_type`.
    fn browse(&self, service_type: &str) -> Result<BrowseStream>;

    /// Stop browsing for `service_type` and drop any cached state.
    fn stop_browse(&self, service_type: &str) -> Result<()>;

    /// Resolve a found instance to host, port and metadata.
    async fn resolve(&self, instance: &RawInstance) -> Result<ResolvedInstance>;
}

struct Session {
    service_type: String,
    task: JoinHandle<()>,
}

/// Local discovery session manager.
pub struct LocalDiscoveryClient {
    browser: Arc<dyn LocalBrowser>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    session: Option<Session>,
}

impl LocalDiscoveryClient {
    /// Create a client that forwards events to `events`.
    pub fn new(browser: Arc<dyn LocalBrowser>, events: mpsc::UnboundedSender<DiscoveryEvent>) -> Self {
        Self {
            browser,
            events,
            session: None,
        }
    }

    /// Start browsing, stopping any previous session first.
    pub fn start(&mut self, service_type: &str) -> Result<()> {
        self.stop();

        let mut stream = self.browser.browse(service_type)?;
        let browser = Arc::clone(&self.browser);
        let events = self.events.clone();
        let source = browser.name();
        debug!(service_type, source, "starting local browse");

        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let forwarded = match event {
                    BrowseEvent::Found(instance) => {
                        match resolve_instance(browser.as_ref(), &instance).await {
                            Ok(obs) => DiscoveryEvent::Observed(obs),
                            Err(e) => {
                                warn!(name = %instance.name, source, error = %e, "resolve failed, skipping instance");
                                continue;
                            }
                        }
                    }
                    BrowseEvent::Lost { name } => {
                        debug!(%name, source, "instance lost");
                        DiscoveryEvent::Lost { name }
                    }
                };
                if events.send(forwarded).is_err() {
                    break;
                }
            }
            debug!(source, "local browse stream ended");
        });

        self.session = Some(Session {
            service_type: service_type.to_string(),
            task,
        });
        Ok(())
    }

    /// Stop the current session, if any.
    pub fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.task.abort();
        if let Err(e) = self.browser.stop_browse(&session.service_type) {
            warn!(service_type = %session.service_type, error = %e, "failed to stop local browse");
        }
        debug!(service_type = %session.service_type, "stopped local browse");
    }

    /// Whether a session is active.
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for LocalDiscoveryClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn resolve_instance(browser: &dyn LocalBrowser, instance: &RawInstance) -> Result<Observation> {
    let resolved = browser.resolve(instance).await?;
    let host = resolved
        .host
        .ok_or_else(|| crate::Error::resolve(format!("{} has no host", instance.name)))?;
    let key = connection_key(&host, resolved.port);
    debug!(%key, name = %instance.name, "resolved local instance");
    Observation::parse(key, instance.name.clone(), resolved.txt, Origin::Local)
}
