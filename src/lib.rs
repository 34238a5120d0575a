//! Discovery of compute offload servers on the local segment (mDNS) and
//! over wide-area DNS-SD, merged into one registry with per-candidate
//! latency tracking.
//!
//! The [`Engine`] ties the pieces together: a [`LocalDiscoveryClient`] and a
//! [`WideAreaResolver`] feed observations to a single worker that owns the
//! [`ServiceRegistry`], a [`ConnectivityPolicy`] decides when the wide-area
//! walk runs, and a [`CandidateList`] presents the result.

#![deny(missing_docs)]

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod local;
pub mod metadata;
pub mod probe;
pub mod projection;
pub mod record;
pub mod registry;
pub mod wide_area;

// Re-export key types
pub use config::{EngineConfig, ProbeConfig};
pub use connectivity::{ConnectivityPolicy, NetworkSignal, PolicyAction, Transport, TransportKind};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use local::{LocalBrowser, LocalDiscoveryClient, MdnsBrowser};
pub use metadata::{DeviceType, ServiceMetadata};
pub use probe::{LatencyProbe, PingProber, Prober, RttSource};
pub use projection::{Candidate, CandidateList, CandidateListProjection, ProjectionUpdate};
pub use record::{DiscoveryEvent, Observation, Origin, ServiceRecord};
pub use registry::{ProbeReading, Reconcile, RegistryEvent, ServiceRegistry};
pub use wide_area::{DnsResolver, HickoryResolver, WideAreaResolver};
