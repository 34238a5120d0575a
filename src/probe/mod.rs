//! Per-candidate latency probes.
//!
//! A [`LatencyProbe`] is created when a record enters the registry and torn
//! down when it leaves. Sampling is cooperative: nothing happens until the
//! owner calls [`tick()`](LatencyProbe::tick).

pub mod ping;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::Result;

pub use ping::PingProber;

/// A running RTT measurement against one host.
pub trait RttSource: Send {
    /// Return the next sample in milliseconds if one is ready.
    ///
    /// An error means the source is dead and will never yield again.
    fn try_sample(&mut self) -> Result<Option<f64>>;

    /// Terminate the measurement.
    fn stop(&mut self);
}

/// Starts RTT measurements.
pub trait Prober: Send + Sync + 'static {
    /// Begin measuring round-trip time to `host`.
    fn start(&self, host: &str) -> Result<Box<dyn RttSource>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Idle,
    Running,
    Disabled,
    Stopped,
}

/// Running latency estimate for one candidate.
pub struct LatencyProbe {
    host: String,
    prober: Arc<dyn Prober>,
    source: Option<Box<dyn RttSource>>,
    state: ProbeState,
    sum: f64,
    count: u64,
}

impl LatencyProbe {
    /// Create an idle probe for `host`.
    pub fn new(host: impl Into<String>, prober: Arc<dyn Prober>) -> Self {
        Self {
            host: host.into(),
            prober,
            source: None,
            state: ProbeState::Idle,
            sum: 0.0,
            count: 0,
        }
    }

    /// Target host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Start the underlying measurement. Failure disables the probe.
    pub fn start(&mut self) {
        if self.state != ProbeState::Idle {
            return;
        }
        match self.prober.start(&self.host) {
            Ok(source) => {
                debug!(host = %self.host, "probe started");
                self.source = Some(source);
                self.state = ProbeState::Running;
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "probe failed to start, sampling disabled");
                self.state = ProbeState::Disabled;
            }
        }
    }

    /// Zero the running sum and count.
    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    /// Collect whatever samples are ready and return the current average.
    pub fn tick(&mut self) -> f64 {
        if self.state != ProbeState::Running {
            return self.average();
        }
        loop {
            let Some(source) = self.source.as_mut() else {
                break;
            };
            match source.try_sample() {
                Ok(Some(rtt)) => {
                    self.sum += rtt;
                    self.count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(host = %self.host, error = %e, "probe died, sampling disabled");
                    self.teardown();
                    self.state = ProbeState::Disabled;
                    break;
                }
            }
        }
        self.average()
    }

    /// Mean RTT in milliseconds since the last reset, or 0 without samples.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Number of samples since the last reset.
    pub fn samples(&self) -> u64 {
        self.count
    }

    /// Whether sampling is currently active.
    pub fn is_running(&self) -> bool {
        self.state == ProbeState::Running
    }

    /// Terminate the measurement. Later calls are no-ops.
    pub fn stop(&mut self) {
        if self.state == ProbeState::Stopped {
            return;
        }
        self.teardown();
        self.state = ProbeState::Stopped;
        debug!(host = %self.host, "probe stopped");
    }

    fn teardown(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.stop();
        }
    }
}

impl Drop for LatencyProbe {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LatencyProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyProbe")
            .field("host", &self.host)
            .field("state", &self.state)
            .field("average", &self.average())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testing::ScriptedProber;
    use super::*;

    fn probe(prober: &ScriptedProber) -> LatencyProbe {
        LatencyProbe::new("10.0.0.2", Arc::new(prober.clone()))
    }

    #[test]
    fn averages_samples() {
        let prober = ScriptedProber::default();
        let mut p = probe(&prober);
        p.start();
        for rtt in [10.0, 20.0, 30.0] {
            prober.push(rtt);
            p.tick();
        }
        assert_eq!(p.average(), 20.0);
        assert_eq!(p.samples(), 3);
    }

    #[test]
    fn tick_before_start_returns_zero() {
        let prober = ScriptedProber::default();
        prober.push(5.0);
        let mut p = probe(&prober);
        assert_eq!(p.tick(), 0.0);
        assert_eq!(p.samples(), 0);
    }

    #[test]
    fn reset_zeroes_average() {
        let prober = ScriptedProber::default();
        let mut p = probe(&prober);
        p.start();
        prober.push(8.0);
        assert_eq!(p.tick(), 8.0);
        p.reset();
        assert_eq!(p.average(), 0.0);
        assert!(p.is_running());
    }

    #[test]
    fn start_failure_disables_sampling() {
        let prober = ScriptedProber {
            fail_start: true,
            ..Default::default()
        };
        let mut p = probe(&prober);
        p.start();
        prober.push(1.0);
        assert_eq!(p.tick(), 0.0);
        assert!(!p.is_running());
    }

    #[test]
    fn source_failure_keeps_last_average() {
        let prober = ScriptedProber::default();
        let mut p = probe(&prober);
        p.start();
        prober.push(12.0);
        prober.push_failure();
        prober.push(99.0);
        assert_eq!(p.tick(), 12.0);
        assert!(!p.is_running());
        assert_eq!(p.tick(), 12.0);
        assert_eq!(prober.stops(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_runs_on_drop() {
        let prober = ScriptedProber::default();
        let mut p = probe(&prober);
        p.start();
        p.stop();
        p.stop();
        drop(p);
        assert_eq!(prober.stops(), 1);

        let mut q = probe(&prober);
        q.start();
        drop(q);
        assert_eq!(prober.stops(), 2);
    }
}
