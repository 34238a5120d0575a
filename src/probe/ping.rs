//! RTT sampling through the system `ping` program.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{Prober, RttSource};
use crate::config::ProbeConfig;
use crate::{Error, Result};

/// Prober that runs one `ping` subprocess per candidate.
#[derive(Debug, Clone)]
pub struct PingProber {
    program: String,
    interval: Duration,
}

impl PingProber {
    /// Create a prober from probe options.
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            program: config.program.clone(),
            interval: config.interval,
        }
    }
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new(&ProbeConfig::default())
    }
}

impl Prober for PingProber {
    fn start(&self, host: &str) -> Result<Box<dyn RttSource>> {
        let handle = Handle::try_current()
            .map_err(|e| Error::probe(format!("no runtime to drive ping: {e}")))?;
        let _guard = handle.enter();

        let mut child = Command::new(&self.program)
            .arg("-i")
            .arg(format!("{:.1}", self.interval.as_secs_f64()))
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::probe("ping stdout unavailable"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let target = host.to_string();
        let reader = handle.spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(rtt) = parse_rtt(&line) {
                    trace!(host = %target, rtt, "ping sample");
                    if tx.send(rtt).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(Box::new(PingSource {
            child,
            reader,
            rx,
        }))
    }
}

struct PingSource {
    child: Child,
    reader: JoinHandle<()>,
    rx: mpsc::UnboundedReceiver<f64>,
}

impl RttSource for PingSource {
    fn try_sample(&mut self) -> Result<Option<f64>> {
        match self.rx.try_recv() {
            Ok(rtt) => Ok(Some(rtt)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::probe("ping exited")),
        }
    }

    fn stop(&mut self) {
        let _ = self.child.start_kill();
        self.reader.abort();
    }
}

/// Extract the `time=<ms>` field from one line of ping output.
pub fn parse_rtt(line: &str) -> Option<f64> {
    let start = line.find("time=")? + "time=".len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}
