//! Routing records — neighbours, routers, links and routes
//!
//! Plain data kept by the topology. The small predicates here hold the
//! timing rules for neighbour verification and neighbour list retries.

use serde::{Deserialize, Serialize};

use crate::hop_metric::HopMetric;
use crate::message::{NeighbourEntry, NodeAddress};
use crate::transport::PortId;

/// Verification interval used when neither side configures one on a
/// capping port
pub const DEFAULT_VERIFICATION_INTERVAL_MSEC: u32 = 300_000;

/// A node reachable in one hop over a local port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbour {
    pub address: NodeAddress,
    pub is_router: bool,
    pub hop_metric: HopMetric,
    pub port: PortId,
    pub physical_address: NodeAddress,
    /// When the neighbour was last heard from
    pub beacon_base: u64,
    /// Zero means the neighbour is never verified
    pub verification_interval_msec: u32,
    /// Zero when settled, otherwise the number of hello attempts owed or made
    pub hello_tries: u32,
    pub hello_delay_base: u64,
    pub hello_delay_msec: u32,
    /// Set until the first hello exchange completes
    pub needs_hello_info: bool,
}

impl Neighbour {
    /// A neighbour just heard on `port` that still needs a hello
    pub fn discovered(address: NodeAddress, port: PortId, hop_metric: HopMetric, now: u64) -> Self {
        Self {
            address,
            is_router: false,
            hop_metric,
            port,
            physical_address: address,
            beacon_base: now,
            verification_interval_msec: 0,
            hello_tries: 1,
            hello_delay_base: now,
            hello_delay_msec: 0,
            needs_hello_info: true,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.hello_tries == 0 && !self.needs_hello_info
    }

    /// A hello is owed and its retry delay has passed
    pub fn hello_due(&self, now: u64) -> bool {
        self.hello_tries > 0 && now >= self.hello_delay_base + self.hello_delay_msec as u64
    }

    /// Ask for a hello as soon as the router slot is free
    pub fn force_hello(&mut self, now: u64) {
        self.hello_tries = self.hello_tries.max(1);
        self.hello_delay_base = now;
        self.hello_delay_msec = 0;
    }

    /// Heard nothing for longer than the verification interval
    pub fn verification_expired(&self, now: u64) -> bool {
        self.verification_interval_msec > 0
            && now.saturating_sub(self.beacon_base) > self.verification_interval_msec as u64
    }

    pub fn entry(&self) -> NeighbourEntry {
        NeighbourEntry {
            address: self.address,
            is_router: self.is_router,
            hop_metric: self.hop_metric,
        }
    }
}

/// Neighbour list synchronisation state for a known router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterRecord {
    pub address: NodeAddress,
    /// Version of the router's list we hold, if any
    pub neighbour_list_version: Option<u8>,
    /// Our list changed since it was last sent there
    pub send_change: bool,
    /// The router needs our whole list
    pub send_all: bool,
    /// We need the router's whole list
    pub get_all: bool,
    pub validated: bool,
    pub retry_base: u64,
    pub retry_delay_msec: u32,
    /// Version of our list the router last acknowledged
    pub last_sent_version: Option<u8>,
}

impl RouterRecord {
    /// A router we have not exchanged lists with yet
    pub fn new(address: NodeAddress, now: u64) -> Self {
        Self {
            address,
            neighbour_list_version: None,
            send_change: false,
            send_all: true,
            get_all: true,
            validated: false,
            retry_base: now,
            retry_delay_msec: 0,
            last_sent_version: None,
        }
    }

    pub fn needs_sync(&self) -> bool {
        self.get_all || self.send_all || self.send_change
    }

    /// How long ago the retry delay ran out, if it has
    pub fn retry_overdue(&self, now: u64) -> Option<u64> {
        let due = self.retry_base + self.retry_delay_msec as u64;
        now.checked_sub(due)
    }

    pub fn postpone(&mut self, now: u64, delay_msec: u32) {
        self.retry_base = now;
        self.retry_delay_msec = delay_msec;
    }
}

/// How a link table update changes an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkChange {
    /// Add the link or update its hop metric
    Added,
    Deleted,
}

/// Undirected edge between two nodes; `id1 < id2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub id1: NodeAddress,
    pub id2: NodeAddress,
    pub hop_metric: HopMetric,
}

impl Link {
    pub fn new(a: NodeAddress, b: NodeAddress, hop_metric: HopMetric) -> Self {
        Self {
            id1: a.min(b),
            id2: a.max(b),
            hop_metric,
        }
    }

    pub fn key(a: NodeAddress, b: NodeAddress) -> (NodeAddress, NodeAddress) {
        (a.min(b), a.max(b))
    }

    pub fn touches(&self, node: NodeAddress) -> bool {
        self.id1 == node || self.id2 == node
    }

    /// The endpoint that is not `node`
    pub fn other(&self, node: NodeAddress) -> Option<NodeAddress> {
        if self.id1 == node {
            Some(self.id2)
        } else if self.id2 == node {
            Some(self.id1)
        } else {
            None
        }
    }
}

/// Cheapest known next hop toward a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: NodeAddress,
    pub neighbour_id: NodeAddress,
    pub port: PortId,
    pub response_time_msec: u32,
}

/// Negotiated verification interval for a neighbour.
///
/// The smaller of 2.5 times what the neighbour reported and 3 times what the
/// port is configured for. When neither is set a capping port falls back to
/// five minutes and other ports never verify.
pub fn calculate_verification_interval(
    reported_sec: u16,
    port_verify_sec: u16,
    port_caps_timeout: bool,
) -> u32 {
    let reported = (reported_sec > 0).then(|| reported_sec as u32 * 2_500);
    let configured = (port_verify_sec > 0).then(|| port_verify_sec as u32 * 3_000);
    match (reported, configured) {
        (Some(r), Some(c)) => r.min(c),
        (Some(r), None) => r,
        (None, Some(c)) => c,
        (None, None) if port_caps_timeout => DEFAULT_VERIFICATION_INTERVAL_MSEC,
        (None, None) => 0,
    }
}

/// Whether a broadcast from a neighbour counts as hearing from it.
///
/// The neighbour beacons at roughly its verification interval divided by
/// 2.5. If that rate and the port's own beacon rate differ by more than a
/// factor of 2.5 the broadcast says nothing about the neighbour's schedule.
pub fn broadcast_is_beacon(port_beacon_sec: u16, neighbour_verification_msec: u32) -> bool {
    if port_beacon_sec == 0 || neighbour_verification_msec == 0 {
        return true;
    }
    let port_msec = port_beacon_sec as u64 * 1_000;
    let neighbour_msec = neighbour_verification_msec as u64 * 2 / 5;
    let (low, high) = if port_msec <= neighbour_msec {
        (port_msec, neighbour_msec)
    } else {
        (neighbour_msec, port_msec)
    };
    high * 2 <= low * 5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verification_interval_takes_minimum() {
        assert_eq!(calculate_verification_interval(60, 60, true), 150_000);
        assert_eq!(calculate_verification_interval(100, 20, true), 60_000);
        assert_eq!(calculate_verification_interval(10, 0, false), 25_000);
        assert_eq!(calculate_verification_interval(0, 10, false), 30_000);
    }

    #[test]
    fn test_verification_interval_defaults() {
        assert_eq!(calculate_verification_interval(0, 0, true), 300_000);
        assert_eq!(calculate_verification_interval(0, 0, false), 0);
    }

    #[test]
    fn test_broadcast_is_beacon() {
        // neighbour verifies every 150 s, so it beacons every 60 s
        assert!(broadcast_is_beacon(60, 150_000));
        assert!(broadcast_is_beacon(150, 150_000));
        assert!(!broadcast_is_beacon(151, 150_000));
        assert!(!broadcast_is_beacon(10, 150_000));
        assert!(broadcast_is_beacon(0, 150_000));
        assert!(broadcast_is_beacon(60, 0));
    }

    #[test]
    fn test_neighbour_hello_schedule() {
        let mut n = Neighbour::discovered(5, PortId(1), HopMetric::from_code(1), 1_000);
        assert!(n.hello_due(1_000));
        assert!(!n.is_settled());
        n.hello_tries = 2;
        n.hello_delay_base = 1_000;
        n.hello_delay_msec = 500;
        assert!(!n.hello_due(1_499));
        assert!(n.hello_due(1_500));
        n.force_hello(1_600);
        assert_eq!(n.hello_tries, 2);
        assert!(n.hello_due(1_600));
    }

    #[test]
    fn test_neighbour_verification_expiry() {
        let mut n = Neighbour::discovered(5, PortId(1), HopMetric::default(), 0);
        assert!(!n.verification_expired(10_000_000));
        n.verification_interval_msec = 1_000;
        assert!(!n.verification_expired(1_000));
        assert!(n.verification_expired(1_001));
    }

    #[test]
    fn test_link_is_normalised() {
        let link = Link::new(9, 3, HopMetric::from_code(2));
        assert_eq!((link.id1, link.id2), (3, 9));
        assert_eq!(link.other(3), Some(9));
        assert_eq!(link.other(4), None);
        assert!(link.touches(9));
        assert_eq!(Link::key(9, 3), (3, 9));
    }

    #[test]
    fn test_router_retry() {
        let mut r = RouterRecord::new(7, 100);
        assert!(r.needs_sync());
        assert_eq!(r.retry_overdue(150), Some(50));
        r.postpone(150, 1_000);
        assert_eq!(r.retry_overdue(1_000), None);
        assert_eq!(r.retry_overdue(1_200), Some(50));
    }
}
