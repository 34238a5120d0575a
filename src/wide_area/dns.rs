//! Unicast DNS lookups used by the wide-area walk.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use tracing::trace;

use crate::Result;

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvAnswer {
    /// Target host name.
    pub target: String,
    /// Service port.
    pub port: u16,
}

/// A unicast DNS resolver.
///
/// Each query returns its answers in wire order, or an error.
#[async_trait]
pub trait DnsResolver: Send + Sync + 'static {
    /// PTR targets for `name`.
    async fn ptr(&self, name: &str) -> Result<Vec<String>>;

    /// SRV answers for `name`.
    async fn srv(&self, name: &str) -> Result<Vec<SrvAnswer>>;

    /// IPv4 addresses for `name`.
    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>>;

    /// TXT records for `name`, each as its list of character strings.
    async fn txt(&self, name: &str) -> Result<Vec<Vec<String>>>;
}

/// [`DnsResolver`] backed by `hickory-resolver`.
#[derive(Clone)]
pub struct HickoryResolver {
    inner: TokioAsyncResolver,
}

impl HickoryResolver {
    /// Use the system resolver configuration.
    pub fn from_system_conf() -> Result<Self> {
        Ok(Self {
            inner: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    /// Query a single name server directly.
    pub fn with_nameserver(addr: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        Self {
            inner: TokioAsyncResolver::tokio(config, ResolverOpts::default()),
        }
    }
}

#[async_trait]
impl DnsResolver for HickoryResolver {
    async fn ptr(&self, name: &str) -> Result<Vec<String>> {
        trace!(%name, "dns: PTR");
        let lookup = self.inner.lookup(name, RecordType::PTR).await?;
        Ok(lookup
            .iter()
            .filter_map(|rdata| match rdata {
                RData::PTR(ptr) => Some(ptr.0.to_utf8()),
                _ => None,
            })
            .collect())
    }

    async fn srv(&self, name: &str) -> Result<Vec<SrvAnswer>> {
        trace!(%name, "dns: SRV");
        let lookup = self.inner.srv_lookup(name).await?;
        Ok(lookup
            .iter()
            .map(|srv| SrvAnswer {
                target: srv.target().to_utf8(),
                port: srv.port(),
            })
            .collect())
    }

    async fn a(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        trace!(%name, "dns: A");
        let lookup = self.inner.ipv4_lookup(name).await?;
        Ok(lookup.iter().map(|a| a.0).collect())
    }

    async fn txt(&self, name: &str) -> Result<Vec<Vec<String>>> {
        trace!(%name, "dns: TXT");
        let lookup = self.inner.txt_lookup(name).await?;
        Ok(lookup
            .iter()
            .map(|txt| {
                txt.txt_data()
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect()
            })
            .collect())
    }
}
