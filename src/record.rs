//! Candidate records and the observation events that produce them.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::metadata::{DeviceType, ServiceMetadata};
use crate::Result;

/// Discovery channel that produced or last confirmed a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Multicast browsing on the local segment.
    Local,
    /// Unicast DNS-SD walk.
    WideArea,
}

impl Origin {
    /// Short name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::WideArea => "wide-area",
        }
    }
}

/// A resolved service instance as reported by a discovery source.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Connection key, `host:port`.
    pub key: String,
    /// Advertised instance name.
    pub name: String,
    /// Raw metadata record.
    pub txt: String,
    /// Parsed metadata.
    pub metadata: ServiceMetadata,
    /// Source of the observation.
    pub origin: Origin,
    /// When the source produced it.
    pub seen_at: Instant,
}

impl Observation {
    /// Build an observation, parsing its metadata record.
    pub fn parse(
        key: impl Into<String>,
        name: impl Into<String>,
        txt: impl Into<String>,
        origin: Origin,
    ) -> Result<Self> {
        let txt = txt.into();
        let metadata = ServiceMetadata::parse(&txt)?;
        Ok(Self {
            key: key.into(),
            name: name.into(),
            txt,
            metadata,
            origin,
            seen_at: Instant::now(),
        })
    }
}

/// Raw event emitted by a discovery source.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// An instance was seen (or seen again).
    Observed(Observation),
    /// The local platform reported an instance as gone.
    Lost {
        /// Advertised instance name.
        name: String,
    },
}

/// The canonical registry entry for one live candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    /// Connection key, `host:port`.
    pub key: String,
    /// Advertised instance name for the current session.
    pub name: String,
    /// Advertised device kind.
    pub device_type: DeviceType,
    /// Number of advertised devices.
    pub device_count: usize,
    /// Channel that produced or last confirmed the record.
    pub origin: Origin,
    /// Bumped each time the key reappears under a new name.
    pub session_generation: u64,
    /// Last confirming observation.
    pub last_seen: Instant,
}

impl ServiceRecord {
    pub(crate) fn from_observation(obs: &Observation) -> Self {
        Self {
            key: obs.key.clone(),
            name: obs.name.clone(),
            device_type: obs.metadata.device_type,
            device_count: obs.metadata.device_count,
            origin: obs.origin,
            session_generation: 0,
            last_seen: obs.seen_at,
        }
    }

    /// Host portion of the key.
    pub fn host(&self) -> &str {
        host_of(&self.key)
    }
}

/// Build a connection key. IPv6 addresses are bracketed.
pub fn connection_key(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

/// Recover the host from a connection key.
pub fn host_of(key: &str) -> &str {
    let host = match key.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => key,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Strip the service-type suffix from a fully qualified instance name.
pub fn instance_label(fullname: &str, service_type: &str) -> String {
    let service_type = service_type.trim_end_matches('.');
    let fullname = fullname.trim_end_matches('.');
    fullname
        .strip_suffix(service_type)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(fullname)
        .to_string()
}
