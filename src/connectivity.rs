//! Transport-change policy gating wide-area discovery.

use std::collections::HashSet;

use tracing::debug;

/// Kind of link a network offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Mobile data.
    Cellular,
    /// Wireless LAN.
    Wifi,
    /// Wired LAN.
    Ethernet,
    /// Virtual private network.
    Vpn,
    /// Anything else.
    Other,
}

/// Notification from the platform's network monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkSignal {
    /// A network became available. Carries no capability data.
    Available,
    /// The capabilities of the active network changed.
    CapabilitiesChanged {
        /// Transports the network offers.
        transports: HashSet<TransportKind>,
    },
    /// The active network was lost.
    Lost,
}

impl NetworkSignal {
    /// Capabilities-changed signal for the given transports.
    pub fn capabilities(transports: impl IntoIterator<Item = TransportKind>) -> Self {
        NetworkSignal::CapabilitiesChanged {
            transports: transports.into_iter().collect(),
        }
    }
}

/// Classified transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Only wide-area discovery can reach servers.
    CellularLike,
    /// Anything else.
    Other,
}

/// Action the engine takes on a transport transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Start a wide-area walk.
    RunWideArea,
    /// Purge every wide-area record.
    PurgeWideArea,
}

/// Two-state transport machine.
#[derive(Debug, Default)]
pub struct ConnectivityPolicy {
    state: Option<Transport>,
}

impl ConnectivityPolicy {
    /// Policy with no classification yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current classification, `None` before the first classifying signal.
    pub fn state(&self) -> Option<Transport> {
        self.state
    }

    /// Feed a signal; returns an action when the state transitions.
    pub fn observe(&mut self, signal: &NetworkSignal) -> Option<PolicyAction> {
        let next = match signal {
            NetworkSignal::Available => return None,
            NetworkSignal::CapabilitiesChanged { transports }
                if transports.contains(&TransportKind::Cellular) =>
            {
                Transport::CellularLike
            }
            NetworkSignal::CapabilitiesChanged { .. } | NetworkSignal::Lost => Transport::Other,
        };

        if self.state == Some(next) {
            return None;
        }
        debug!(from = ?self.state, to = ?next, "transport transition");
        self.state = Some(next);

        Some(match next {
            Transport::CellularLike => PolicyAction::RunWideArea,
            Transport::Other => PolicyAction::PurgeWideArea,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cellular_triggers_walk_once() {
        let mut policy = ConnectivityPolicy::new();
        let cellular = NetworkSignal::capabilities([TransportKind::Cellular]);

        assert_eq!(policy.observe(&cellular), Some(PolicyAction::RunWideArea));
        assert_eq!(policy.observe(&cellular), None);
        assert_eq!(policy.state(), Some(Transport::CellularLike));
    }

    #[test]
    fn leaving_cellular_purges() {
        let mut policy = ConnectivityPolicy::new();
        policy.observe(&NetworkSignal::capabilities([
            TransportKind::Cellular,
            TransportKind::Vpn,
        ]));

        let wifi = NetworkSignal::capabilities([TransportKind::Wifi]);
        assert_eq!(policy.observe(&wifi), Some(PolicyAction::PurgeWideArea));
        assert_eq!(policy.observe(&NetworkSignal::Lost), None);
        assert_eq!(
            policy.observe(&NetworkSignal::capabilities([TransportKind::Cellular])),
            Some(PolicyAction::RunWideArea)
        );
        assert_eq!(policy.observe(&NetworkSignal::Lost), Some(PolicyAction::PurgeWideArea));
    }

    #[test]
    fn first_classification_counts() {
        let mut policy = ConnectivityPolicy::new();
        assert_eq!(
            policy.observe(&NetworkSignal::capabilities([TransportKind::Ethernet])),
            Some(PolicyAction::PurgeWideArea)
        );
    }

    #[test]
    fn available_is_ignored() {
        let mut policy = ConnectivityPolicy::new();
        assert_eq!(policy.observe(&NetworkSignal::Available), None);
        assert_eq!(policy.state(), None);
    }
}
