use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use offload_discovery::{
    projection, CandidateList, Engine, EngineConfig, HickoryResolver, MdnsBrowser, NetworkSignal,
    ProbeConfig, TransportKind,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(name = "discover")]
#[clap(about = "Find compute offload servers on the local network and over wide-area DNS-SD")]
struct Args {
    /// Service type to browse for
    #[clap(long, default_value = "_compute._tcp")]
    service_type: String,

    /// Domain to walk for wide-area instances
    #[clap(long)]
    domain: Option<String>,

    /// Name server for wide-area lookups (defaults to the system resolver)
    #[clap(long)]
    nameserver: Option<SocketAddr>,

    /// Pretend the active network is cellular, triggering the wide-area walk
    #[clap(long)]
    cellular: bool,

    /// Seconds between latency samples and list refreshes
    #[clap(long, default_value = "2")]
    interval: u64,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();

    let interval = Duration::from_secs(args.interval.max(1));
    let mut config = EngineConfig::default()
        .service_type(args.service_type)
        .probe(ProbeConfig {
            interval,
            ..Default::default()
        });
    let wide_area = args.domain.is_some();
    if let Some(domain) = args.domain {
        config = config.wide_area_domain(domain);
    }

    let (projection, mut list) = projection::channel();
    list.on_select(|key| info!(%key, "selected server"));

    let mut builder = Engine::builder(config)
        .projection(projection)
        .local_browser(Arc::new(MdnsBrowser::new()?));
    if wide_area {
        let resolver = match args.nameserver {
            Some(addr) => HickoryResolver::with_nameserver(addr),
            None => HickoryResolver::from_system_conf()?,
        };
        builder = builder.dns_resolver(Arc::new(resolver));
    }

    let mut engine = builder.spawn();
    engine.start_local()?;
    info!(service_type = %engine.config().local_service_type(), "browsing");

    if args.cellular {
        engine.network(NetworkSignal::capabilities([TransportKind::Cellular]))?;
    }

    let mut ticker = tokio::time::interval(interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.tick().await?;
                list.apply_pending();
                print_candidates(&list);
                if list.selected().is_none() {
                    if let Some(key) = list.best().map(|c| c.key.clone()) {
                        list.select(&key);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down...");
                break;
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}

fn print_candidates(list: &CandidateList) {
    if list.is_empty() {
        println!("(no servers found yet)");
        return;
    }
    println!("{:<3} {:<24} {:<22} {:<12} {:>5} {:>10}", "", "name", "key", "device", "count", "rtt");
    for candidate in list.candidates() {
        let marker = if list.selected() == Some(candidate.key.as_str()) { "*" } else { "" };
        let rtt = if candidate.average_ms > 0.0 {
            format!("{:.1} ms", candidate.average_ms)
        } else {
            "-".to_string()
        };
        println!(
            "{:<3} {:<24} {:<22} {:<12} {:>5} {:>10}",
            marker,
            candidate.name,
            candidate.key,
            format!("{:?}/{}", candidate.device_type, candidate.origin.as_str()),
            candidate.device_count,
            rtt,
        );
    }
}
