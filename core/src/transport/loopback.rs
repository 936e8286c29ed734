// Loopback — an in-memory port pair for simulation and tests
//
// Each router owns a `LoopbackPort`; a `LoopbackLink` moves traffic between
// the two by pulling messages from one router and feeding the other through
// the serial frame codec, so every hop exercises encode, quoting and
// signature checks exactly as a real serial line would.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Port, PortId};
use crate::message::{Message, NodeAddress, Priority, BROADCAST_ADDRESS};
use crate::router::Router;
use crate::serial::{encode_frame, FrameEvent, SerialDecoder};

/// Upper bound on pump rounds, guards against two routers chattering forever
const MAX_PUMP_ROUNDS: usize = 256;

/// Link characteristics reported to the router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackSettings {
    pub name: String,
    pub worst_case_response_msec: u32,
    pub beacon_interval_sec: u16,
    pub verify_interval_sec: u16,
    /// Behave like a dialed link that must be connected before use
    pub dialed: bool,
    pub cap_timeout: bool,
    pub must_close: bool,
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            name: "loopback".to_string(),
            worst_case_response_msec: 500,
            beacon_interval_sec: 0,
            verify_interval_sec: 0,
            dialed: false,
            cap_timeout: true,
            must_close: false,
        }
    }
}

/// Callback recorded by a loopback port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackEvent {
    Ready {
        physical_destination: NodeAddress,
        priority: Priority,
    },
    Broadcast(Message),
    Aborted(NodeAddress),
    NeighbourLost(NodeAddress),
}

#[derive(Debug, Default)]
struct PortState {
    connected: bool,
    ready: BTreeSet<NodeAddress>,
    broadcasts: Vec<Message>,
    events: Vec<LoopbackEvent>,
}

#[derive(Debug)]
pub struct LoopbackPort {
    settings: LoopbackSettings,
    state: Mutex<PortState>,
}

impl LoopbackPort {
    pub fn new(settings: LoopbackSettings) -> Arc<Self> {
        let connected = !settings.dialed;
        Arc::new(Self {
            settings,
            state: Mutex::new(PortState {
                connected,
                ..PortState::default()
            }),
        })
    }

    pub fn settings(&self) -> &LoopbackSettings {
        &self.settings
    }

    /// Bring a dialed link up or down
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Drain the callbacks recorded so far
    pub fn take_events(&self) -> Vec<LoopbackEvent> {
        std::mem::take(&mut self.state.lock().events)
    }

    fn take_ready(&self) -> Vec<NodeAddress> {
        std::mem::take(&mut self.state.lock().ready).into_iter().collect()
    }

    fn take_broadcasts(&self) -> Vec<Message> {
        std::mem::take(&mut self.state.lock().broadcasts)
    }
}

impl Port for LoopbackPort {
    fn port_name(&self) -> String {
        self.settings.name.clone()
    }

    fn on_message_ready(&self, physical_destination: NodeAddress, priority: Priority) {
        let mut state = self.state.lock();
        state.ready.insert(physical_destination);
        state.events.push(LoopbackEvent::Ready {
            physical_destination,
            priority,
        });
    }

    fn broadcast_message(&self, message: &Message) {
        let mut state = self.state.lock();
        state.broadcasts.push(message.clone());
        state.events.push(LoopbackEvent::Broadcast(message.clone()));
    }

    fn on_message_aborted(&self, physical_destination: NodeAddress) {
        self.state
            .lock()
            .events
            .push(LoopbackEvent::Aborted(physical_destination));
    }

    fn beacon_interval(&self) -> u16 {
        self.settings.beacon_interval_sec
    }

    fn verify_interval(&self) -> u16 {
        self.settings.verify_interval_sec
    }

    fn worst_case_response(&self) -> u32 {
        self.settings.worst_case_response_msec
    }

    fn has_session(&self, _source: NodeAddress, _destination: NodeAddress) -> bool {
        self.settings.dialed && self.is_connected()
    }

    fn link_is_dialed(&self) -> bool {
        self.settings.dialed
    }

    fn link_is_active(&self) -> bool {
        self.is_connected()
    }

    fn must_close_link(&self) -> bool {
        self.settings.must_close
    }

    fn on_neighbour_lost(&self, address: NodeAddress) {
        self.state
            .lock()
            .events
            .push(LoopbackEvent::NeighbourLost(address));
    }

    fn should_cap_timeout(&self) -> bool {
        self.settings.cap_timeout
    }
}

struct LinkEnd {
    port: Arc<LoopbackPort>,
    id: PortId,
    decoder: SerialDecoder,
}

/// A wire between two routers' loopback ports
pub struct LoopbackLink {
    a: LinkEnd,
    b: LinkEnd,
}

impl LoopbackLink {
    /// Register one port on each router and join them
    pub fn connect(
        router_a: &mut Router,
        port_a: &Arc<LoopbackPort>,
        router_b: &mut Router,
        port_b: &Arc<LoopbackPort>,
    ) -> Self {
        let id_a = router_a.register_port(port_a);
        let id_b = router_b.register_port(port_b);
        Self {
            a: LinkEnd {
                port: Arc::clone(port_a),
                id: id_a,
                decoder: SerialDecoder::new(),
            },
            b: LinkEnd {
                port: Arc::clone(port_b),
                id: id_b,
                decoder: SerialDecoder::new(),
            },
        }
    }

    /// Port ids on router A and router B
    pub fn port_ids(&self) -> (PortId, PortId) {
        (self.a.id, self.b.id)
    }

    /// Move traffic both ways until the link is quiet. Returns the number of
    /// packets delivered.
    pub fn pump(&mut self, a: &mut Router, b: &mut Router) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_PUMP_ROUNDS {
            let moved = Self::transfer(&self.a, a, &mut self.b, b)
                + Self::transfer(&self.b, b, &mut self.a, a);
            if moved == 0 {
                return delivered;
            }
            delivered += moved;
        }
        warn!("Loopback link still busy after {} rounds", MAX_PUMP_ROUNDS);
        delivered
    }

    /// Carry everything `from` has ready over to `to`
    fn transfer(from: &LinkEnd, sender: &mut Router, to: &mut LinkEnd, receiver: &mut Router) -> usize {
        if !from.port.is_connected() || !to.port.is_connected() {
            return 0;
        }
        let peer = receiver.this_node();
        let mut packets = Vec::new();
        for message in from.port.take_broadcasts() {
            packets.push(message.to_bytes());
        }
        for physical_destination in from.port.take_ready() {
            while let Some(message) = sender.get_next_port_message(from.id, physical_destination) {
                if physical_destination == peer || physical_destination == BROADCAST_ADDRESS {
                    packets.push(message.to_bytes());
                } else {
                    debug!("{} has no node {}, dropping {}", from.port.port_name(), physical_destination, message);
                }
            }
        }

        let mut delivered = 0;
        for packet in packets {
            for event in to.decoder.feed(&encode_frame(&packet)) {
                match event {
                    FrameEvent::Packet(bytes) => {
                        if let Err(e) = receiver.on_packet(to.id, &bytes) {
                            warn!("Loopback delivery failed: {}", e);
                        }
                        delivered += 1;
                    }
                    other => warn!("Loopback frame error: {:?}", other),
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::timer::ManualClock;

    #[test]
    fn test_dialed_port_starts_disconnected() {
        let port = LoopbackPort::new(LoopbackSettings {
            dialed: true,
            ..LoopbackSettings::default()
        });
        assert!(!port.link_is_active());
        assert!(!port.has_session(1, 2));
        port.set_connected(true);
        assert!(port.link_is_active());
        assert!(port.has_session(1, 2));
    }

    #[test]
    fn test_port_records_callbacks() {
        let port = LoopbackPort::new(LoopbackSettings::default());
        port.on_message_ready(5, Priority::High);
        port.on_message_aborted(5);
        port.on_neighbour_lost(5);
        assert_eq!(
            port.take_events(),
            vec![
                LoopbackEvent::Ready {
                    physical_destination: 5,
                    priority: Priority::High
                },
                LoopbackEvent::Aborted(5),
                LoopbackEvent::NeighbourLost(5),
            ]
        );
        assert!(port.take_events().is_empty());
    }

    #[test]
    fn test_connect_registers_both_ports() {
        let clock = Arc::new(ManualClock::new(0));
        let mut a = Router::new(RouterConfig::for_node(1), clock.clone()).unwrap();
        let mut b = Router::new(RouterConfig::for_node(2), clock).unwrap();
        let port_a = LoopbackPort::new(LoopbackSettings::default());
        let port_b = LoopbackPort::new(LoopbackSettings::default());
        let mut link = LoopbackLink::connect(&mut a, &port_a, &mut b, &port_b);
        let (id_a, id_b) = link.port_ids();
        assert_eq!(a.snapshot().ports, vec![(id_a, "loopback".to_string())]);
        assert_eq!(b.snapshot().ports, vec![(id_b, "loopback".to_string())]);
        assert_eq!(link.pump(&mut a, &mut b), 0);
    }
}
