//! Error types for offload-discovery.

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// mDNS daemon error.
    #[error("mDNS error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    /// Unicast DNS lookup error.
    #[error("DNS error: {0}")]
    Dns(#[from] hickory_resolver::error::ResolveError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TXT metadata that does not follow the advertised framing.
    #[error("malformed service metadata: {0}")]
    Metadata(String),

    /// An instance could not be resolved to a usable host and port.
    #[error("resolution failed: {0}")]
    Resolve(String),

    /// A latency sampler could not be started or died.
    #[error("probe error: {0}")]
    Probe(String),

    /// The engine worker is no longer running.
    #[error("engine stopped")]
    EngineStopped,
}

impl Error {
    /// Create a metadata error.
    pub fn metadata<S: Into<String>>(msg: S) -> Self {
        Self::Metadata(msg.into())
    }

    /// Create a resolution error.
    pub fn resolve<S: Into<String>>(msg: S) -> Self {
        Self::Resolve(msg.into())
    }

    /// Create a probe error.
    pub fn probe<S: Into<String>>(msg: S) -> Self {
        Self::Probe(msg.into())
    }
}
