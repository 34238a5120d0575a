//! Insertion-ordered candidate list for the presentation layer.
//!
//! The engine holds the producing half, [`CandidateListProjection`], and
//! pushes diffs into it from its worker. The presentation layer owns the
//! consuming half, [`CandidateList`], and applies those diffs on its own
//! context, so the list is only ever mutated by a single consumer.

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::metadata::DeviceType;
use crate::record::{Origin, ServiceRecord};

/// One row of the candidate list.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Connection key, `host:port`.
    pub key: String,
    /// Advertised instance name.
    pub name: String,
    /// Advertised device kind.
    pub device_type: DeviceType,
    /// Number of advertised devices.
    pub device_count: usize,
    /// Source of the record.
    pub origin: Origin,
    /// Latest mean RTT in milliseconds, 0 until sampled.
    pub average_ms: f64,
}

impl From<&ServiceRecord> for Candidate {
    fn from(record: &ServiceRecord) -> Self {
        Self {
            key: record.key.clone(),
            name: record.name.clone(),
            device_type: record.device_type,
            device_count: record.device_count,
            origin: record.origin,
            average_ms: 0.0,
        }
    }
}

/// Diff delivered to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionUpdate {
    /// Append a new candidate.
    Added(Candidate),
    /// Replace a candidate in place. The latency average survives only if
    /// the name is unchanged.
    Updated(Candidate),
    /// Drop a candidate.
    Removed {
        /// Connection key.
        key: String,
    },
    /// New latency average for a candidate.
    Latency {
        /// Connection key.
        key: String,
        /// Mean RTT in milliseconds.
        average_ms: f64,
    },
}

/// Create a connected producer/consumer pair.
pub fn channel() -> (CandidateListProjection, CandidateList) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CandidateListProjection { tx },
        CandidateList {
            rx,
            candidates: Vec::new(),
            selected: None,
            on_select: None,
        },
    )
}

/// Producing half of the projection.
#[derive(Debug, Clone)]
pub struct CandidateListProjection {
    tx: mpsc::UnboundedSender<ProjectionUpdate>,
}

impl CandidateListProjection {
    /// Announce a new record.
    pub fn add(&self, record: &ServiceRecord) {
        self.publish(ProjectionUpdate::Added(record.into()));
    }

    /// Announce an in-place change to a record.
    pub fn update(&self, record: &ServiceRecord) {
        self.publish(ProjectionUpdate::Updated(record.into()));
    }

    /// Announce a removal.
    pub fn remove(&self, key: &str) {
        self.publish(ProjectionUpdate::Removed {
            key: key.to_string(),
        });
    }

    /// Announce a latency average.
    pub fn latency(&self, key: &str, average_ms: f64) {
        self.publish(ProjectionUpdate::Latency {
            key: key.to_string(),
            average_ms,
        });
    }

    /// Send a raw update. Dropped silently once the consumer is gone.
    pub fn publish(&self, update: ProjectionUpdate) {
        if self.tx.send(update).is_err() {
            trace!("candidate list dropped, discarding update");
        }
    }

    /// Whether the consumer is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

type SelectCallback = Box<dyn FnMut(&str) + Send>;

/// Consuming half of the projection.
pub struct CandidateList {
    rx: mpsc::UnboundedReceiver<ProjectionUpdate>,
    candidates: Vec<Candidate>,
    selected: Option<String>,
    on_select: Option<SelectCallback>,
}

impl CandidateList {
    /// Register the callback invoked with the canonical key on selection.
    pub fn on_select<F>(&mut self, f: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_select = Some(Box::new(f));
    }

    /// Apply every update already queued. Returns how many were applied.
    pub fn apply_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.rx.try_recv() {
            self.apply(update);
            applied += 1;
        }
        applied
    }

    /// Wait for the next update, apply it and return it.
    ///
    /// Returns `None` once every producer is gone.
    pub async fn next_update(&mut self) -> Option<ProjectionUpdate> {
        let update = self.rx.recv().await?;
        self.apply(update.clone());
        Some(update)
    }

    /// Apply one update.
    pub fn apply(&mut self, update: ProjectionUpdate) {
        match update {
            ProjectionUpdate::Added(candidate) => {
                match self.position(&candidate.key) {
                    Some(i) => self.candidates[i] = candidate,
                    None => self.candidates.push(candidate),
                }
            }
            ProjectionUpdate::Updated(candidate) => {
                if let Some(i) = self.position(&candidate.key) {
                    let previous = &self.candidates[i];
                    // A new name is a new session; its samples start over.
                    let average_ms = if previous.name == candidate.name {
                        previous.average_ms
                    } else {
                        0.0
                    };
                    self.candidates[i] = Candidate {
                        average_ms,
                        ..candidate
                    };
                }
            }
            ProjectionUpdate::Removed { key } => {
                self.candidates.retain(|c| c.key != key);
                if self.selected.as_deref() == Some(key.as_str()) {
                    debug!(%key, "selected candidate removed, clearing selection");
                    self.selected = None;
                }
            }
            ProjectionUpdate::Latency { key, average_ms } => {
                if let Some(i) = self.position(&key) {
                    self.candidates[i].average_ms = average_ms;
                }
            }
        }
    }

    /// Current candidates in insertion order.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Look up a candidate.
    pub fn get(&self, key: &str) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.key == key)
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Select a live candidate and notify the selection callback.
    ///
    /// Returns `false` when `key` is not in the list.
    pub fn select(&mut self, key: &str) -> bool {
        if self.position(key).is_none() {
            return false;
        }
        self.selected = Some(key.to_string());
        if let Some(callback) = self.on_select.as_mut() {
            callback(key);
        }
        true
    }

    /// Currently selected key.
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Candidate with the lowest measured latency.
    ///
    /// Candidates without samples are skipped.
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates
            .iter()
            .filter(|c| c.average_ms > 0.0)
            .min_by(|a, b| a.average_ms.total_cmp(&b.average_ms))
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.candidates.iter().position(|c| c.key == key)
    }
}

impl std::fmt::Debug for CandidateList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateList")
            .field("candidates", &self.candidates)
            .field("selected", &self.selected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use super::*;

    fn record(key: &str, name: &str) -> ServiceRecord {
        ServiceRecord {
            key: key.to_string(),
            name: name.to_string(),
            device_type: DeviceType::Cpu,
            device_count: 4,
            origin: Origin::Local,
            session_generation: 0,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn keeps_insertion_order_across_updates() {
        let (projection, mut list) = channel();
        projection.add(&record("a:1", "a"));
        projection.add(&record("b:1", "b"));
        projection.add(&record("c:1", "c"));
        projection.latency("a:1", 12.5);
        projection.update(&record("a:1", "a2"));
        projection.remove("b:1");
        assert_eq!(list.apply_pending(), 6);

        let names: Vec<_> = list.candidates().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a2", "c"]);
        assert_eq!(list.get("a:1").unwrap().average_ms, 0.0);
    }

    #[test]
    fn renamed_candidate_drops_old_latency() {
        let (projection, mut list) = channel();
        projection.add(&record("a:1", "a"));
        projection.add(&record("b:1", "b"));
        projection.latency("a:1", 5.0);
        projection.latency("b:1", 30.0);
        list.apply_pending();
        assert_eq!(list.best().map(|c| c.key.as_str()), Some("a:1"));

        let mut adopted = record("b:1", "b");
        adopted.origin = Origin::WideArea;
        projection.update(&adopted);
        projection.update(&record("a:1", "a-restarted"));
        list.apply_pending();

        assert_eq!(list.get("b:1").unwrap().average_ms, 30.0);
        assert_eq!(list.get("b:1").unwrap().origin, Origin::WideArea);
        assert_eq!(list.get("a:1").unwrap().average_ms, 0.0);
        assert_eq!(list.best().map(|c| c.key.as_str()), Some("b:1"));
    }

    #[test]
    fn removing_selection_clears_it() {
        let (projection, mut list) = channel();
        let chosen = Arc::new(Mutex::new(Vec::new()));
        list.on_select({
            let chosen = chosen.clone();
            move |key| chosen.lock().unwrap().push(key.to_string())
        });

        projection.add(&record("10.0.0.1:9000", "a"));
        list.apply_pending();
        assert!(!list.select("10.0.0.9:9000"));
        assert!(list.select("10.0.0.1:9000"));
        assert_eq!(list.selected(), Some("10.0.0.1:9000"));
        assert_eq!(*chosen.lock().unwrap(), ["10.0.0.1:9000"]);

        projection.remove("10.0.0.1:9000");
        list.apply_pending();
        assert_eq!(list.selected(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn best_skips_unsampled() {
        let (projection, mut list) = channel();
        for key in ["a:1", "b:1", "c:1"] {
            projection.add(&record(key, key));
        }
        projection.latency("b:1", 40.0);
        projection.latency("c:1", 15.0);
        list.apply_pending();
        assert_eq!(list.best().map(|c| c.key.as_str()), Some("c:1"));
    }

    #[test]
    fn next_update_waits_for_producer() {
        let (projection, mut list) = channel();
        let mut next = tokio_test::task::spawn(list.next_update());
        tokio_test::assert_pending!(next.poll());

        projection.add(&record("a:1", "a"));
        assert!(next.is_woken());
        let update = tokio_test::assert_ready!(next.poll());
        assert!(matches!(update, Some(ProjectionUpdate::Added(_))));
        drop(next);
        assert_eq!(list.len(), 1);
    }

    #[tokio::test]
    async fn next_update_ends_with_producers() {
        let (projection, mut list) = channel();
        projection.add(&record("a:1", "a"));
        drop(projection);
        assert!(matches!(list.next_update().await, Some(ProjectionUpdate::Added(_))));
        assert_eq!(list.len(), 1);
        assert!(list.next_update().await.is_none());
    }
}
