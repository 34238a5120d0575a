//! Service registry merging local and wide-area observations.
//!
//! Single source of truth mapping a connection key to its
//! [`ServiceRecord`]. Every live record owns exactly one [`LatencyProbe`];
//! the probe is started on insert and stopped on removal.
//!
//! A session replace can leave one name live under two keys. Name lookups
//! then resolve to the record that took the name most recently.
//!
//! The registry itself is not synchronized. The engine owns it from one
//! worker task, which serializes events arriving from both sources.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::probe::{LatencyProbe, Prober};
use crate::record::{Observation, Origin, ServiceRecord};

/// Membership change emitted by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A new record was inserted.
    Added(ServiceRecord),
    /// A record's session was replaced in place.
    Updated(ServiceRecord),
    /// A record left the registry.
    Removed(ServiceRecord),
}

/// Which reconciliation rule an observation hit.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconcile {
    /// New key, no name collision.
    Inserted(ServiceRecord),
    /// Same key and name: a reconnect.
    Refreshed(ServiceRecord),
    /// Same key and name, now confirmed by the other source.
    Adopted(ServiceRecord),
    /// Same key, new name: a new session.
    Replaced(ServiceRecord),
    /// New key whose name is already live under another key; dropped.
    Ambiguous {
        /// Key already holding the name.
        existing: String,
    },
}

impl Reconcile {
    /// The membership notification for this outcome, if any.
    pub fn into_event(self) -> Option<RegistryEvent> {
        match self {
            Reconcile::Inserted(record) => Some(RegistryEvent::Added(record)),
            Reconcile::Replaced(record) | Reconcile::Adopted(record) => {
                Some(RegistryEvent::Updated(record))
            }
            Reconcile::Refreshed(_) | Reconcile::Ambiguous { .. } => None,
        }
    }
}

/// Latest average for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReading {
    /// Connection key.
    pub key: String,
    /// Mean RTT in milliseconds, 0 without samples.
    pub average_ms: f64,
}

struct Entry {
    record: ServiceRecord,
    probe: LatencyProbe,
    seq: u64,
    // Sequence number of the last insert or rename.
    named: u64,
}

/// Canonical set of live candidates.
pub struct ServiceRegistry {
    entries: HashMap<String, Entry>,
    prober: Arc<dyn Prober>,
    next_seq: u64,
}

impl ServiceRegistry {
    /// Create an empty registry whose probes are started through `prober`.
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self {
            entries: HashMap::new(),
            prober,
            next_seq: 0,
        }
    }

    /// Merge one observation into the registry.
    pub fn reconcile(&mut self, obs: Observation) -> Reconcile {
        if let Some(entry) = self.entries.get_mut(&obs.key) {
            let previous = entry.record.origin;
            entry.record.last_seen = obs.seen_at;
            entry.record.origin = obs.origin;

            if entry.record.name == obs.name {
                debug!(key = %obs.key, name = %obs.name, source = obs.origin.as_str(), "reconnect");
                if previous != obs.origin {
                    return Reconcile::Adopted(entry.record.clone());
                }
                return Reconcile::Refreshed(entry.record.clone());
            }

            debug!(
                key = %obs.key,
                old = %entry.record.name,
                new = %obs.name,
                "session replaced"
            );
            entry.record.name = obs.name;
            entry.named = self.next_seq;
            self.next_seq += 1;
            entry.record.device_type = obs.metadata.device_type;
            entry.record.device_count = obs.metadata.device_count;
            entry.record.session_generation += 1;
            entry.probe.reset();
            return Reconcile::Replaced(entry.record.clone());
        }

        if let Some(existing) = self.key_for_name(&obs.name) {
            warn!(
                name = %obs.name,
                key = %obs.key,
                existing = %existing,
                "name already registered under another key, dropping observation"
            );
            return Reconcile::Ambiguous {
                existing: existing.to_string(),
            };
        }

        let record = ServiceRecord::from_observation(&obs);
        let mut probe = LatencyProbe::new(record.host(), Arc::clone(&self.prober));
        probe.start();

        debug!(key = %record.key, name = %record.name, source = record.origin.as_str(), "added");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            record.key.clone(),
            Entry {
                record: record.clone(),
                probe,
                seq,
                named: seq,
            },
        );
        Reconcile::Inserted(record)
    }

    /// Remove the local-origin record advertised as `name`.
    ///
    /// If several local records carry the name, the one that took it most
    /// recently is removed.
    pub fn remove_local(&mut self, name: &str) -> Option<RegistryEvent> {
        let key = self
            .entries
            .values()
            .filter(|e| e.record.origin == Origin::Local && e.record.name == name)
            .max_by_key(|e| e.named)
            .map(|e| e.record.key.clone());

        match key {
            Some(key) => self.remove(&key).map(RegistryEvent::Removed),
            None => {
                debug!(%name, "local loss for unknown or wide-area record, ignoring");
                None
            }
        }
    }

    /// Remove every record from `origin`.
    pub fn purge_origin(&mut self, origin: Origin) -> Vec<RegistryEvent> {
        let mut keys: Vec<(u64, String)> = self
            .entries
            .values()
            .filter(|e| e.record.origin == origin)
            .map(|e| (e.seq, e.record.key.clone()))
            .collect();
        keys.sort();

        let removed: Vec<RegistryEvent> = keys
            .into_iter()
            .filter_map(|(_, key)| self.remove(&key))
            .map(RegistryEvent::Removed)
            .collect();
        debug!(source = origin.as_str(), count = removed.len(), "purged");
        removed
    }

    /// Remove a record by key, stopping its probe. Unknown keys are a no-op.
    pub fn remove(&mut self, key: &str) -> Option<ServiceRecord> {
        let mut entry = self.entries.remove(key)?;
        entry.probe.stop();
        Some(entry.record)
    }

    /// Sample every probe and return the current averages in insertion order.
    pub fn tick(&mut self) -> Vec<ProbeReading> {
        let mut entries: Vec<&mut Entry> = self.entries.values_mut().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| ProbeReading {
                key: e.record.key.clone(),
                average_ms: e.probe.tick(),
            })
            .collect()
    }

    /// Current average for `key`.
    pub fn average(&self, key: &str) -> Option<f64> {
        self.entries.get(key).map(|e| e.probe.average())
    }

    /// Whether the probe for `key` is sampling.
    pub fn probe_running(&self, key: &str) -> Option<bool> {
        self.entries.get(key).map(|e| e.probe.is_running())
    }

    /// Look up a record.
    pub fn get(&self, key: &str) -> Option<&ServiceRecord> {
        self.entries.get(key).map(|e| &e.record)
    }

    /// Whether `key` is live.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot of all records in insertion order.
    pub fn records(&self) -> Vec<ServiceRecord> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key_for_name(&self, name: &str) -> Option<&str> {
        self.entries
            .values()
            .filter(|e| e.record.name == name)
            .max_by_key(|e| e.named)
            .map(|e| e.record.key.as_str())
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("records", &self.records())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::metadata::DeviceType;
    use crate::probe::testing::ScriptedProber;

    fn obs(key: &str, name: &str, origin: Origin) -> Observation {
        Observation::parse(key, name, "{0003=null}", origin).unwrap()
    }

    fn registry() -> (ServiceRegistry, ScriptedProber) {
        let prober = ScriptedProber::default();
        (ServiceRegistry::new(Arc::new(prober.clone())), prober)
    }

    #[test]
    fn repeated_observation_keeps_one_record() {
        let (mut reg, prober) = registry();
        assert!(matches!(
            reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local)),
            Reconcile::Inserted(_)
        ));
        for _ in 0..5 {
            assert!(matches!(
                reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local)),
                Reconcile::Refreshed(_)
            ));
        }
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("10.0.0.1:9000").unwrap().session_generation, 0);
        assert_eq!(prober.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_keeps_probe_samples() {
        let (mut reg, prober) = registry();
        reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local));
        prober.push(10.0);
        reg.tick();
        reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local));
        assert_eq!(reg.average("10.0.0.1:9000"), Some(10.0));
    }

    #[test]
    fn new_name_on_same_key_replaces_session() {
        let (mut reg, prober) = registry();
        reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local));
        prober.push(10.0);
        reg.tick();

        let replaced = Observation::parse("10.0.0.1:9000", "b", "{1000003=null}", Origin::Local)
            .unwrap();
        let outcome = reg.reconcile(replaced);
        let Reconcile::Replaced(record) = outcome else {
            panic!("expected replace, got {outcome:?}");
        };
        assert_eq!(record.name, "b");
        assert_eq!(record.session_generation, 1);
        assert_eq!(record.device_type, DeviceType::Gpu);
        assert_eq!(record.device_count, 7);
        assert_eq!(reg.average("10.0.0.1:9000"), Some(0.0));
        assert_eq!(reg.probe_running("10.0.0.1:9000"), Some(true));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn generation_never_decreases() {
        let (mut reg, _) = registry();
        let mut last = 0;
        for name in ["a", "b", "b", "c", "a"] {
            reg.reconcile(obs("10.0.0.1:9000", name, Origin::Local));
            let generation = reg.get("10.0.0.1:9000").unwrap().session_generation;
            assert!(generation >= last);
            last = generation;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn same_name_under_second_key_is_dropped() {
        let (mut reg, prober) = registry();
        reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local));
        let outcome = reg.reconcile(obs("10.0.0.2:9000", "a", Origin::WideArea));
        assert_eq!(
            outcome,
            Reconcile::Ambiguous {
                existing: "10.0.0.1:9000".to_string()
            }
        );
        assert_eq!(reg.len(), 1);
        assert!(!reg.contains("10.0.0.2:9000"));
        assert_eq!(prober.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_local_only_touches_local_records() {
        let (mut reg, prober) = registry();
        reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local));
        reg.reconcile(obs("10.0.0.2:9000", "b", Origin::WideArea));

        assert!(reg.remove_local("b").is_none());
        assert!(reg.contains("10.0.0.2:9000"));

        let event = reg.remove_local("a").unwrap();
        assert!(matches!(event, RegistryEvent::Removed(ref r) if r.key == "10.0.0.1:9000"));
        assert_eq!(prober.stops(), 1);

        assert!(reg.remove_local("a").is_none());
        assert_eq!(prober.stops(), 1);
    }

    #[test]
    fn purge_removes_only_wide_area() {
        let (mut reg, prober) = registry();
        reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local));
        reg.reconcile(obs("10.0.0.2:9000", "b", Origin::WideArea));
        reg.reconcile(obs("10.0.0.3:9000", "c", Origin::WideArea));

        let removed = reg.purge_origin(Origin::WideArea);
        let keys: Vec<_> = removed
            .iter()
            .map(|e| match e {
                RegistryEvent::Removed(r) => r.key.clone(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(keys, ["10.0.0.2:9000", "10.0.0.3:9000"]);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.probe_running("10.0.0.1:9000"), Some(true));
        assert_eq!(prober.stops(), 2);

        assert!(reg.purge_origin(Origin::WideArea).is_empty());
        assert_eq!(prober.stops(), 2);
    }

    #[test]
    fn refresh_from_other_source_moves_origin() {
        let (mut reg, _) = registry();
        reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local));
        let outcome = reg.reconcile(obs("10.0.0.1:9000", "a", Origin::WideArea));
        assert!(matches!(
            outcome.into_event(),
            Some(RegistryEvent::Updated(ref r)) if r.origin == Origin::WideArea
        ));
        assert_eq!(reg.get("10.0.0.1:9000").unwrap().origin, Origin::WideArea);
        assert!(reg.remove_local("a").is_none());
    }

    #[test]
    fn loss_of_shared_name_removes_latest_holder() {
        for _ in 0..50 {
            let (mut reg, prober) = registry();
            reg.reconcile(obs("10.0.0.1:9000", "a", Origin::Local));
            reg.reconcile(obs("10.0.0.2:9000", "b", Origin::Local));
            reg.reconcile(obs("10.0.0.2:9000", "a", Origin::Local));

            let first = reg.remove_local("a").unwrap();
            assert!(matches!(first, RegistryEvent::Removed(ref r) if r.key == "10.0.0.2:9000"));
            assert!(reg.contains("10.0.0.1:9000"));

            let second = reg.remove_local("a").unwrap();
            assert!(matches!(second, RegistryEvent::Removed(ref r) if r.key == "10.0.0.1:9000"));
            assert!(reg.is_empty());
            assert_eq!(prober.stops(), 2);
        }
    }

    #[test]
    fn records_keep_insertion_order() {
        let (mut reg, _) = registry();
        for (i, name) in ["z", "y", "x"].iter().enumerate() {
            reg.reconcile(obs(&format!("10.0.0.{i}:1"), name, Origin::Local));
        }
        let names: Vec<_> = reg.records().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["z", "y", "x"]);
    }
}
