//! Port abstraction for the PakBus router
//!
//! A port owns one physical link (serial line, modem, socket). The router
//! never touches the link itself: it tells the port when a message is
//! waiting and the port pulls it with `Router::get_next_port_message`.
//! Port callbacks run while the router is busy and must not call back into
//! the router; they should record the request and act on it afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hop_metric::HopMetric;
use crate::message::{Message, NodeAddress, Priority, BROADCAST_ADDRESS};

/// Handle for a registered port. Handles are never reused by a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId(pub u32);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// What the router needs from a link
pub trait Port: Send + Sync {
    /// Name used in logs and snapshots
    fn port_name(&self) -> String;

    /// A message for `physical_destination` is queued and can be pulled
    fn on_message_ready(&self, physical_destination: NodeAddress, priority: Priority);

    /// Transmit a link-local broadcast right away
    fn broadcast_message(&self, message: &Message);

    /// Queued messages for `physical_destination` were withdrawn
    fn on_message_aborted(&self, _physical_destination: NodeAddress) {}

    /// Seconds between beacons sent on this link; zero disables beacons
    fn beacon_interval(&self) -> u16 {
        0
    }

    /// Seconds a neighbour on this link may stay silent before it is checked
    fn verify_interval(&self) -> u16 {
        0
    }

    /// Worst case round trip on this link in milliseconds
    fn worst_case_response(&self) -> u32;

    fn hop_metric(&self) -> HopMetric {
        HopMetric::from_response_time(self.worst_case_response())
    }

    /// True if a conversation between the two nodes is open on this link
    fn has_session(&self, _source: NodeAddress, _destination: NodeAddress) -> bool {
        false
    }

    /// True for links that must be dialed before they carry traffic
    fn link_is_dialed(&self) -> bool {
        false
    }

    fn link_is_active(&self) -> bool {
        true
    }

    /// The link should be closed once the current traffic drains
    fn must_close_link(&self) -> bool {
        false
    }

    fn on_neighbour_lost(&self, _address: NodeAddress) {}

    fn can_accept_neighbour(&self, address: NodeAddress) -> bool {
        address > 0 && address < BROADCAST_ADDRESS
    }

    /// Cap transaction timeouts on this link at 35 seconds
    fn should_cap_timeout(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl Port for Minimal {
        fn port_name(&self) -> String {
            "minimal".into()
        }
        fn on_message_ready(&self, _physical_destination: NodeAddress, _priority: Priority) {}
        fn broadcast_message(&self, _message: &Message) {}
        fn worst_case_response(&self) -> u32 {
            4_000
        }
    }

    #[test]
    fn test_default_hop_metric_from_worst_case() {
        assert_eq!(Minimal.hop_metric().code(), 2);
    }

    #[test]
    fn test_default_neighbour_acceptance() {
        assert!(!Minimal.can_accept_neighbour(0));
        assert!(Minimal.can_accept_neighbour(1));
        assert!(Minimal.can_accept_neighbour(4094));
        assert!(!Minimal.can_accept_neighbour(BROADCAST_ADDRESS));
    }

    #[test]
    fn test_default_link_flags() {
        assert!(Minimal.link_is_active());
        assert!(!Minimal.link_is_dialed());
        assert!(Minimal.should_cap_timeout());
        assert!(!Minimal.has_session(1, 2));
        assert_eq!(PortId(3).to_string(), "port#3");
    }
}
