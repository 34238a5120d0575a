//! Wide-area DNS-SD discovery over unicast DNS.
//!
//! A walk has three stages:
//!
//! 1. PTR `b._dns-sd._udp.<domain>` names the browse domain.
//! 2. PTR `_services._dns-sd._udp.<browse domain>` enumerates service types;
//!    the first one containing the configured service type is selected.
//! 3. PTR `<service type>` enumerates instances, each resolved through
//!    SRV, A and TXT.
//!
//! Failures in stages 1 and 2 end the walk with no observations. A failure
//! while resolving one instance skips only that instance.

pub mod dns;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::metadata::{render_attributes, split_attribute};
use crate::record::{connection_key, instance_label, Observation, Origin};
use crate::{Error, Result};

pub use dns::{DnsResolver, HickoryResolver, SrvAnswer};

/// Label under which a domain lists its browse domains.
pub const BROWSE_DOMAINS_LABEL: &str = "b._dns-sd._udp";

/// Label under which a browse domain enumerates its service types.
pub const SERVICES_LABEL: &str = "_services._dns-sd._udp";

/// Runs DNS-SD walks under one domain.
pub struct WideAreaResolver {
    resolver: Arc<dyn DnsResolver>,
    domain: String,
    service_type: String,
    in_flight: AtomicBool,
}

impl WideAreaResolver {
    /// Create a resolver walking `domain` for instances of `service_type`.
    pub fn new(
        resolver: Arc<dyn DnsResolver>,
        domain: impl Into<String>,
        service_type: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            domain: domain.into(),
            service_type: service_type.into(),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Domain being walked.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Run a walk unless one is already in flight.
    ///
    /// Returns `None` when the trigger was skipped.
    pub async fn try_run(&self) -> Option<Vec<Observation>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(domain = %self.domain, "wide-area walk already in flight, skipping trigger");
            return None;
        }
        let _guard = InFlight(&self.in_flight);
        Some(self.run().await)
    }

    /// Run one full walk and return every instance that resolved.
    pub async fn run(&self) -> Vec<Observation> {
        debug!(domain = %self.domain, service_type = %self.service_type, "starting wide-area walk");

        let browse_domain = match self.browse_domain().await {
            Ok(domain) => domain,
            Err(e) => {
                debug!(domain = %self.domain, error = %e, "no browse domain, walk aborted");
                return Vec::new();
            }
        };

        let service = match self.select_service_type(&browse_domain).await {
            Ok(service) => service,
            Err(e) => {
                warn!(browse_domain = %browse_domain, error = %e, "no matching service type, walk aborted");
                return Vec::new();
            }
        };

        let instances = match first_nonempty(self.resolver.ptr(&service).await, &service) {
            Ok(instances) => instances,
            Err(e) => {
                debug!(%service, error = %e, "no instances");
                return Vec::new();
            }
        };

        let mut observed = Vec::with_capacity(instances.len());
        for instance in instances {
            match self.resolve_instance(&instance, &service).await {
                Ok(obs) => {
                    debug!(key = %obs.key, name = %obs.name, source = "wide-area", "resolved instance");
                    observed.push(obs);
                }
                Err(e) => {
                    warn!(%instance, error = %e, "skipping wide-area instance");
                }
            }
        }

        debug!(
            domain = %self.domain,
            discovered = observed.len(),
            "wide-area walk complete"
        );
        observed
    }

    async fn browse_domain(&self) -> Result<String> {
        let name = fqdn(BROWSE_DOMAINS_LABEL, &self.domain);
        let answers = first_nonempty(self.resolver.ptr(&name).await, &name)?;
        Ok(answers[0].clone())
    }

    async fn select_service_type(&self, browse_domain: &str) -> Result<String> {
        let name = fqdn(SERVICES_LABEL, browse_domain);
        let answers = first_nonempty(self.resolver.ptr(&name).await, &name)?;
        answers
            .into_iter()
            .find(|answer| answer.contains(&self.service_type))
            .ok_or_else(|| {
                Error::resolve(format!(
                    "no service type under {name} contains {}",
                    self.service_type
                ))
            })
    }

    async fn resolve_instance(&self, instance: &str, service: &str) -> Result<Observation> {
        let srv = first_nonempty(self.resolver.srv(instance).await, instance)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::resolve(format!("no SRV answer for {instance}")))?;

        let ip = first_nonempty(self.resolver.a(&srv.target).await, &srv.target)?[0];

        let records = first_nonempty(self.resolver.txt(instance).await, instance)?;
        let txt = render_attributes(records[0].iter().map(|s| split_attribute(s)));

        Observation::parse(
            connection_key(&ip.to_string(), srv.port),
            instance_label(instance, service),
            txt,
            Origin::WideArea,
        )
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn fqdn(label: &str, domain: &str) -> String {
    let domain = domain.trim_matches('.');
    format!("{label}.{domain}.")
}

fn first_nonempty<T>(answers: Result<Vec<T>>, name: &str) -> Result<Vec<T>> {
    let answers = answers?;
    if answers.is_empty() {
        return Err(Error::resolve(format!("empty answer for {name}")));
    }
    Ok(answers)
}
