//! Engine configuration.

use std::time::Duration;

/// Options for the latency probes attached to each candidate.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Program used to sample round-trip times. Default: `ping`.
    pub program: String,
    /// Interval between samples. Default: 1 second.
    pub interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            program: "ping".to_string(),
            interval: Duration::from_secs(1),
        }
    }
}

/// Options for the discovery engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Service type without domain, e.g. `_compute._tcp`.
    pub service_type: String,
    /// Multicast domain for local browsing. Default: `local.`.
    pub local_domain: String,
    /// Unicast domain walked for wide-area instances. `None` disables the walk.
    pub wide_area_domain: Option<String>,
    /// Deadline applied around each wide-area walk. Default: 30 seconds.
    pub wide_area_timeout: Option<Duration>,
    /// Latency probe options.
    pub probe: ProbeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_type: "_compute._tcp".to_string(),
            local_domain: "local.".to_string(),
            wide_area_domain: None,
            wide_area_timeout: Some(Duration::from_secs(30)),
            probe: ProbeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Set the advertised service type.
    pub fn service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    /// Enable wide-area discovery under `domain`.
    pub fn wide_area_domain(mut self, domain: impl Into<String>) -> Self {
        self.wide_area_domain = Some(domain.into());
        self
    }

    /// Set (or clear) the wide-area walk deadline.
    pub fn wide_area_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.wide_area_timeout = timeout;
        self
    }

    /// Set the probe options.
    pub fn probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }

    /// Fully qualified service type used for mDNS browsing.
    pub fn local_service_type(&self) -> String {
        let domain = self.local_domain.trim_start_matches('.');
        format!("{}.{}", self.service_type.trim_end_matches('.'), domain)
    }
}
