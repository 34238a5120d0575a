//! mDNS-based local browsing backend.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use super::{BrowseEvent, BrowseStream, LocalBrowser, RawInstance, ResolvedInstance};
use crate::metadata::render_attributes;
use crate::record::instance_label;
use crate::{Error, Result};

/// Local browser backed by an `mdns-sd` daemon.
///
/// The daemon resolves instances itself; resolved info is cached per
/// session and handed out by [`resolve()`](LocalBrowser::resolve).
#[derive(Clone)]
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    cache: Arc<Mutex<HashMap<String, ResolvedInstance>>>,
}

impl MdnsBrowser {
    /// Create a browser with its own mDNS daemon.
    pub fn new() -> Result<Self> {
        Ok(Self::with_daemon(ServiceDaemon::new()?))
    }

    /// Create a browser around an existing daemon.
    pub fn with_daemon(daemon: ServiceDaemon) -> Self {
        Self {
            daemon,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl LocalBrowser for MdnsBrowser {
    fn name(&self) -> &'static str {
        "mdns"
    }

    fn browse(&self, service_type: &str) -> Result<BrowseStream> {
        let receiver = self.daemon.browse(service_type)?;
        let cache = Arc::clone(&self.cache);
        let service_type = service_type.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        // The daemon hands events over a blocking channel; bridge it on a
        // dedicated thread until the search stops or the consumer goes away.
        std::thread::Builder::new()
            .name("mdns-browse".to_string())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    let forwarded = match event {
                        ServiceEvent::ServiceResolved(info) => {
                            let fullname = info.get_fullname().to_string();
                            trace!(%fullname, "mdns: resolved");
                            if let Ok(mut cache) = cache.lock() {
                                cache.insert(fullname.clone(), resolved_from_info(&info));
                            }
                            BrowseEvent::Found(RawInstance {
                                name: instance_label(&fullname, &service_type),
                                fullname,
                            })
                        }
                        ServiceEvent::ServiceRemoved(_, fullname) => {
                            if let Ok(mut cache) = cache.lock() {
                                cache.remove(&fullname);
                            }
                            BrowseEvent::Lost {
                                name: instance_label(&fullname, &service_type),
                            }
                        }
                        ServiceEvent::SearchStopped(_) => break,
                        other => {
                            trace!(?other, "mdns: ignored event");
                            continue;
                        }
                    };
                    if tx.send(forwarded).is_err() {
                        break;
                    }
                }
                debug!(%service_type, "mdns: browse bridge exited");
            })?;

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn stop_browse(&self, service_type: &str) -> Result<()> {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
        self.daemon.stop_browse(service_type)?;
        debug!(service_type, "mdns: browse stopped");
        Ok(())
    }

    async fn resolve(&self, instance: &RawInstance) -> Result<ResolvedInstance> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| Error::resolve("mdns cache poisoned"))?;
        cache
            .get(&instance.fullname)
            .cloned()
            .ok_or_else(|| Error::resolve(format!("{} not resolved", instance.fullname)))
    }
}

fn resolved_from_info(info: &ServiceInfo) -> ResolvedInstance {
    let addresses = info.get_addresses();
    let host = addresses
        .iter()
        .find(|ip| matches!(ip, IpAddr::V4(_)))
        .or_else(|| addresses.iter().next())
        .map(|ip| ip.to_string());

    let properties = info.get_properties();
    let txt = render_attributes(
        properties
            .iter()
            .map(|p| (p.key(), p.val().map(|_| p.val_str()))),
    );

    ResolvedInstance {
        host,
        port: info.get_port(),
        txt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_info_renders_metadata() {
        let info = ServiceInfo::new(
            "_compute._tcp.local.",
            "gpu-box",
            "gpu-box.local.",
            "10.0.0.7",
            9000,
            &[("0003", "")][..],
        )
        .unwrap();
        let resolved = resolved_from_info(&info);
        assert_eq!(resolved.host.as_deref(), Some("10.0.0.7"));
        assert_eq!(resolved.port, 9000);
        assert!(resolved.txt.starts_with("{0003="));
    }
}
