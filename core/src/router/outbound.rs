// Outbound path: route resolution, the unrouted queue, delivery faults and
// the port pull that seals encrypted messages

use std::cmp::Reverse;
use tracing::{debug, warn};

use super::{QueuedMessage, Router, RouterEvent};
use crate::crypto::seal_envelope;
use crate::message::pakctrl::delivery_failure_body;
use crate::message::{
    is_valid_node_address, message_types, ExpectMore, FailureCode, Message, NodeAddress, ProtocolType,
    BROADCAST_ADDRESS,
};
use crate::routing::Route;
use crate::tran::{MessageSerial, TranCore, TranKey, TranKind};
use crate::transport::PortId;
use crate::PakBusError;

/// Ceiling for transaction timeouts on ports that cap them
const MAX_CAPPED_TIMEOUT_MSEC: u32 = 35_000;

impl Router {
    /// Dynamic route, else static route, else (for leaf nodes) any router neighbour
    pub(crate) fn resolve_route(&self, destination: NodeAddress) -> Option<Route> {
        self.topology
            .find_route(destination)
            .or_else(|| self.leaf_route(destination))
    }

    /// Leaf nodes send whatever they cannot route to their best router neighbour
    fn leaf_route(&self, destination: NodeAddress) -> Option<Route> {
        if !self.config.is_leaf_node {
            return None;
        }
        self.topology
            .neighbours()
            .filter(|n| n.is_router && n.is_settled())
            .min_by_key(|n| (n.hop_metric, n.address))
            .map(|n| Route {
                destination,
                neighbour_id: n.address,
                port: n.port,
                response_time_msec: n.hop_metric.response_time_msec(),
            })
    }

    /// Link address of the next hop for a table route
    fn physical_address_of(&self, route: &Route) -> NodeAddress {
        self.topology
            .neighbour(route.neighbour_id)
            .map_or(route.neighbour_id, |n| n.physical_address)
    }

    /// Response timeout for a transaction: base plus 1.25 times the route's
    /// response time, capped on ports that ask for it.
    pub(crate) fn tran_time_out(&self, core: &TranCore, kind: &TranKind) -> u32 {
        let base = kind.base_timeout_msec(self.config.transaction_base_timeout_msec);
        let destination = core.key.destination;
        let (response_time, port) = match self.resolve_route(destination) {
            Some(route) => (route.response_time_msec, Some(route.port)),
            None => match self.topology.neighbour(destination) {
                Some(n) => (n.hop_metric.response_time_msec(), Some(n.port)),
                None => (0, None),
            },
        };
        let caps = port
            .and_then(|id| self.port(id))
            .map_or(true, |p| p.should_cap_timeout());
        let timeout = base
            .saturating_add(response_time)
            .saturating_add(response_time / 4);
        if caps {
            timeout.min(MAX_CAPPED_TIMEOUT_MSEC)
        } else {
            timeout
        }
    }

    fn take_serial(&mut self) -> MessageSerial {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }

    /// Send a message that belongs to no transaction
    pub fn send_message(&mut self, mut message: Message) -> Result<MessageSerial, PakBusError> {
        if !Self::is_broadcast_or_valid(message.destination) {
            return Err(PakBusError::InvalidAddress(message.destination));
        }
        message.source = self.this_node();
        let serial = self.route_message(message, None);
        self.pump_events();
        Ok(serial)
    }

    /// Hand a message to the port that reaches its destination.
    ///
    /// Broadcasts go out on every port at once and are also handled here.
    /// Messages for this node are delivered through the event queue. Anything
    /// else waits in the unrouted queue until its port pulls it; a message
    /// nobody can carry is answered with an unreachable delivery fault.
    pub(crate) fn route_message(&mut self, mut message: Message, owner: Option<TranKey>) -> MessageSerial {
        let serial = self.take_serial();
        let this_node = self.this_node();

        if message.is_broadcast() {
            message.physical_source = this_node;
            message.physical_destination = BROADCAST_ADDRESS;
            let ports: Vec<_> = self.ports.values().filter_map(|e| e.port.upgrade()).collect();
            for port in ports {
                port.broadcast_message(&message);
            }
            self.stats.messages_sent += 1;
            if let Some(key) = owner {
                self.events.push_back(RouterEvent::TranSending(key, serial));
            }
            if message.source != this_node {
                self.events.push_back(RouterEvent::Deliver {
                    port: None,
                    message,
                });
            }
            return serial;
        }

        if message.destination == this_node {
            if let Some(key) = owner {
                self.events.push_back(RouterEvent::TranSending(key, serial));
            }
            self.events.push_back(RouterEvent::Deliver {
                port: None,
                message,
            });
            return serial;
        }

        let table_route = self.topology.find_route(message.destination);
        let hop = match (table_route, message.own_route) {
            (Some(route), _) => Some((route.port, self.physical_address_of(&route))),
            (None, Some(own)) => Some((own.port, own.physical_destination)),
            (None, None) => self
                .leaf_route(message.destination)
                .map(|route| (route.port, self.physical_address_of(&route))),
        };
        let Some((port_id, physical_destination)) = hop else {
            debug!("No route for {}", message);
            self.send_delivery_fault(&message, FailureCode::UnreachableDestination);
            return serial;
        };
        let Some(port) = self.port(port_id) else {
            debug!("{} is gone, dropping {}", port_id, message);
            self.send_delivery_fault(&message, FailureCode::UnreachableDestination);
            return serial;
        };

        if message.will_close {
            self.supersede_queued(&message, owner);
        }
        let priority = message.priority;
        self.unrouted.push(QueuedMessage {
            serial,
            message,
            port: port_id,
            physical_destination,
            owner,
            queued_at: self.now(),
        });
        port.on_message_ready(physical_destination, priority);
        serial
    }

    /// A closing message replaces earlier chatter to the same destination
    /// that has not gone out yet. Messages of other live transactions stay.
    fn supersede_queued(&mut self, closing: &Message, owner: Option<TranKey>) {
        let (superseded, kept): (Vec<QueuedMessage>, Vec<QueuedMessage>) =
            std::mem::take(&mut self.unrouted).into_iter().partition(|queued| {
                let other_owner = queued.owner.map_or(false, |key| {
                    Some(key) != owner && self.transactions.contains_key(&key)
                });
                !queued.message.will_close
                    && queued.message.destination == closing.destination
                    && !other_owner
            });
        self.unrouted = kept;
        if superseded.is_empty() {
            return;
        }
        debug!(
            "{} queued messages to {} superseded by closing message",
            superseded.len(),
            closing.destination
        );
        for queued in superseded {
            if let Some(port) = self.port(queued.port) {
                port.on_message_aborted(queued.physical_destination);
            }
        }
    }

    /// Report a message we could not deliver back to its source.
    ///
    /// Never answers a failure report or a response, and never when the
    /// report itself would run out of hops.
    pub(crate) fn send_delivery_fault(&mut self, failed: &Message, code: FailureCode) {
        if failed.hop_count >= self.config.max_hop_count {
            return;
        }
        if failed.protocol == ProtocolType::Control
            && failed.message_type() == Some(message_types::DELIVERY_FAILURE)
        {
            return;
        }
        if failed.is_response() || !is_valid_node_address(failed.source) {
            return;
        }

        let mut fault = Message::pakctrl(
            message_types::DELIVERY_FAILURE,
            failed.transaction_no().unwrap_or(0),
            &delivery_failure_body(code, failed),
        );
        fault.source = self.this_node();
        fault.destination = failed.source;
        fault.priority = failed.priority;
        fault.expect_more = ExpectMore::Last;
        self.stats.delivery_faults_sent += 1;
        debug!("Delivery fault ({}) to {} for {}", code, failed.source, failed);
        self.route_message(fault, None);
    }

    /// Pull the next message queued for `physical_destination` on `port`.
    ///
    /// Highest priority goes first, oldest first within a priority.
    pub fn get_next_port_message(
        &mut self,
        port: PortId,
        physical_destination: NodeAddress,
    ) -> Option<Message> {
        let message = self.take_port_message(port, physical_destination);
        self.pump_events();
        message
    }

    fn take_port_message(&mut self, port_id: PortId, physical_destination: NodeAddress) -> Option<Message> {
        let pos = self
            .unrouted
            .iter()
            .enumerate()
            .filter(|(_, q)| q.port == port_id && q.physical_destination == physical_destination)
            .max_by_key(|(_, q)| (q.message.priority, Reverse(q.serial)))
            .map(|(pos, _)| pos)?;
        let queued = self.unrouted.remove(pos);
        let port = self.port(port_id);
        let this_node = self.this_node();

        let mut message = queued.message;
        message.physical_source = this_node;
        message.physical_destination = physical_destination;
        let last_on_port = !self.unrouted.iter().any(|q| q.port == port_id);
        if last_on_port && port.as_ref().map_or(false, |p| p.must_close_link()) {
            message.will_close = true;
            message.expect_more = ExpectMore::Last;
        }

        if message.should_encrypt
            && message.source == this_node
            && message.protocol != ProtocolType::Encrypted
        {
            if let Some(cipher) = self.ciphers.for_address(message.destination) {
                match seal_envelope(cipher.as_ref(), self.config.envelope_byte_order, &message) {
                    Ok(sealed) => message = sealed,
                    Err(e) => {
                        warn!("Could not encrypt {}: {}", message, e);
                        if let Some(key) = queued.owner {
                            self.events.push_back(RouterEvent::TranFailure(
                                key,
                                FailureCode::UnsupportedEncryptionCipher,
                            ));
                        }
                        return None;
                    }
                }
            }
        }

        if let Some(key) = queued.owner {
            self.events
                .push_back(RouterEvent::TranSending(key, queued.serial));
        }
        self.stats.messages_sent += 1;
        debug!("{} takes {}", port_id, message);
        Some(message)
    }

    /// Drop everything queued on a port. Owners fail with `code`, other
    /// traffic is reported back to its source.
    pub(crate) fn withdraw_port_messages(&mut self, port_id: PortId, code: FailureCode) {
        let (withdrawn, kept): (Vec<QueuedMessage>, Vec<QueuedMessage>) = std::mem::take(&mut self.unrouted)
            .into_iter()
            .partition(|q| q.port == port_id);
        self.unrouted = kept;
        for queued in withdrawn {
            self.fail_queued(queued, code);
        }
    }

    pub(crate) fn fail_queued(&mut self, queued: QueuedMessage, code: FailureCode) {
        if let Some(port) = self.port(queued.port) {
            port.on_message_aborted(queued.physical_destination);
        }
        match queued.owner {
            Some(key) => self.events.push_back(RouterEvent::TranFailure(key, code)),
            None => self.send_delivery_fault(&queued.message, code),
        }
    }
}
