// Inbound path: neighbour bookkeeping, forwarding, decryption and dispatch
// of everything addressed to this node

use std::sync::Weak;
use tracing::{debug, info, warn};

use super::{Router, RouterEvent, TranSlot};
use crate::crypto::{envelope_cipher_code, open_envelope};
use crate::message::pakctrl::{format_settings, parse_setting_names, parse_settings};
use crate::message::{
    is_valid_node_address, message_types, DeliveryFailure, FailureCode, HelloInfo, Message,
    NeighbourList, NodeAddress, OwnRoute, Priority, ProtocolType,
};
use crate::routing::Neighbour;
use crate::tran::echo::{echo_ack_payload, parse_relay_request};
use crate::tran::settings::{SETTINGS_APPLIED, SETTINGS_REJECTED};
use crate::tran::{TranEcho, TranKey, TranKind};
use crate::transport::PortId;
use crate::PakBusError;

impl Router {
    /// A port received a message
    pub fn on_message(&mut self, port: PortId, message: Message) -> Result<(), PakBusError> {
        if !self.ports.contains_key(&port) {
            return Err(PakBusError::PortNotRegistered(port));
        }
        self.stats.messages_received += 1;
        debug!("{} received {}", port, message);
        self.note_physical_source(port, &message);

        let this_node = self.this_node();
        if message.destination != this_node && !message.is_broadcast() {
            self.forward(message);
        } else {
            self.dispatch_local(Some(port), message, false);
        }
        self.pump_events();
        Ok(())
    }

    /// A port received a raw packet. Packets that do not parse are dropped.
    pub fn on_packet(&mut self, port: PortId, packet: &[u8]) -> Result<(), PakBusError> {
        match Message::from_bytes(packet) {
            Ok(message) => self.on_message(port, message),
            Err(e) => {
                warn!("Dropping bad packet on {}: {}", port, e);
                Ok(())
            }
        }
    }

    /// Refresh or create the neighbour that physically sent a message
    fn note_physical_source(&mut self, port_id: PortId, message: &Message) {
        let physical = message.physical_source;
        if !is_valid_node_address(physical) || physical == self.this_node() {
            return;
        }
        let now = self.now();
        if let Some(neighbour) = self.topology.neighbour_mut(physical) {
            if neighbour.port == port_id && !message.is_broadcast() {
                neighbour.beacon_base = now;
            }
            return;
        }
        let Some(port) = self.port(port_id) else {
            return;
        };
        if port.can_accept_neighbour(physical) {
            info!("Neighbour {} heard on {}", physical, port_id);
            self.topology
                .insert_neighbour(Neighbour::discovered(physical, port_id, port.hop_metric(), now));
            self.do_next_router_transaction();
        }
    }

    fn forward(&mut self, mut message: Message) {
        if self.config.is_leaf_node {
            debug!("Leaf node does not forward {}", message);
            return;
        }
        if message.hop_count >= self.config.max_hop_count {
            self.stats.dropped_hop_limit += 1;
            debug!("Hop limit reached, dropping {}", message);
            return;
        }
        message.hop_count += 1;
        message.own_route = None;
        self.stats.forwarded += 1;
        self.route_message(message, None);
    }

    /// Handle a message addressed to this node or broadcast
    pub(crate) fn dispatch_local(&mut self, port: Option<PortId>, message: Message, decrypted: bool) {
        if message.is_broadcast() && message.source == self.this_node() {
            return;
        }
        match message.protocol {
            ProtocolType::Encrypted => self.on_encrypted_message(port, message),
            ProtocolType::Bmp5 | ProtocolType::Datagram
                if self.config.require_encryption
                    && !decrypted
                    && self.ciphers.for_address(message.source).is_some() =>
            {
                warn!("Plaintext {} from {} refused", message.protocol, message.source);
                self.send_delivery_fault(&message, FailureCode::EncryptionRequired);
            }
            ProtocolType::Control => self.on_control_message(port, message),
            ProtocolType::Bmp5 => self.on_bmp5_message(message),
            ProtocolType::Datagram => {
                if !self.deliver_to_application(&message) {
                    debug!("No handler for datagram from {}", message.source);
                }
            }
        }
    }

    fn on_encrypted_message(&mut self, port: Option<PortId>, message: Message) {
        let source = message.source;
        let cipher = self
            .ciphers
            .for_address(source)
            .filter(|c| envelope_cipher_code(&message.body) == Some(c.cipher_code() & 0x0f));
        let Some(cipher) = cipher else {
            warn!("No cipher for encrypted message from {}", source);
            self.send_delivery_fault(&message, FailureCode::UnsupportedEncryptionCipher);
            return;
        };
        match open_envelope(cipher.as_ref(), self.config.envelope_byte_order, &message) {
            Ok(opened) => self.dispatch_local(port, opened, true),
            Err(e) => {
                self.stats.decrypt_failures += 1;
                warn!("Dropping encrypted message from {}: {}", source, e);
            }
        }
    }

    fn on_control_message(&mut self, port: Option<PortId>, message: Message) {
        let Some(message_type) = message.message_type() else {
            return;
        };
        match message_type {
            message_types::DELIVERY_FAILURE => self.on_delivery_failure(&message),
            t if t & 0x80 != 0 => self.deliver_response(message),
            message_types::HELLO_CMD => self.on_hello_command(port, message),
            message_types::HELLO_REQUEST => self.on_hello_request(port, &message),
            message_types::GET_NEIGHBOURS_CMD => self.on_get_neighbours_command(port, message),
            message_types::SEND_NEIGHBOURS_CMD => self.on_send_neighbours_command(port, message),
            message_types::ECHO_CMD => {
                let (seconds, nanos) = self.wall_time();
                let payload = echo_ack_payload(message.payload(), seconds, nanos);
                self.reply(port, &message, message_types::ECHO_ACK, &payload);
            }
            message_types::RELAY_ECHO_CMD => self.on_relay_echo_command(message),
            message_types::GET_STRING_SETTINGS_CMD => self.on_get_settings_command(port, message),
            message_types::SET_STRING_SETTINGS_CMD => self.on_set_settings_command(port, message),
            message_types::BYE_CMD => debug!("Bye from {}", message.source),
            other => {
                debug!("Unsupported PakCtrl type {:#04x} from {}", other, message.source);
                self.send_delivery_fault(&message, FailureCode::UnsupportedMessageType);
            }
        }
    }

    fn deliver_response(&mut self, message: Message) {
        let Some(id) = message.transaction_no() else {
            return;
        };
        let key = TranKey {
            destination: message.source,
            id,
        };
        if self.transactions.contains_key(&key) {
            self.events.push_back(RouterEvent::TranMessage(key, message));
        } else {
            debug!("No transaction {} for {}", key, message);
        }
    }

    fn on_delivery_failure(&mut self, message: &Message) {
        let report = match DeliveryFailure::parse(message.payload()) {
            Ok(report) => report,
            Err(e) => {
                warn!("Malformed delivery failure from {}: {}", message.source, e);
                return;
            }
        };
        let failed = &report.failed;
        let key = failed.transaction_no().map(|id| TranKey {
            destination: failed.destination,
            id,
        });
        match key {
            Some(key) if failed.source == self.this_node() && self.transactions.contains_key(&key) => {
                debug!("Transaction {} failed: {}", key, report.code);
                self.events
                    .push_back(RouterEvent::TranFailure(key, report.code));
            }
            None if failed.protocol == ProtocolType::Encrypted && failed.source == self.this_node() => {
                // the transaction number is sealed, so every exchange waiting on the node fails
                let waiting: Vec<TranKey> = self
                    .transactions
                    .iter()
                    .filter(|(key, slot)| {
                        key.destination == failed.destination
                            && matches!(slot, TranSlot::Ready(tran) if tran.core.first_message_sent)
                    })
                    .map(|(key, _)| *key)
                    .collect();
                debug!(
                    "Encrypted traffic to {} refused ({}), failing {} transactions",
                    failed.destination,
                    report.code,
                    waiting.len()
                );
                for key in waiting {
                    self.events.push_back(RouterEvent::TranFailure(key, report.code));
                }
            }
            _ => debug!(
                "Delivery failure ({}) from {} matches no transaction",
                report.code, message.source
            ),
        }
    }

    fn on_bmp5_message(&mut self, message: Message) {
        if message.is_response() {
            if let Some(id) = message.transaction_no() {
                let key = TranKey {
                    destination: message.source,
                    id,
                };
                if self.transactions.contains_key(&key) {
                    self.events.push_back(RouterEvent::TranMessage(key, message));
                    return;
                }
            }
        }
        if self.deliver_to_application(&message) {
            return;
        }
        if !message.is_response() {
            self.send_delivery_fault(&message, FailureCode::UnreachableHighLevelProtocol);
        }
    }

    fn deliver_to_application(&self, message: &Message) -> bool {
        self.app_handler
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(false, |handler| handler.on_message(message))
    }

    /// Answer `request`. Direct neighbours are answered on the link the
    /// request came in on.
    fn reply(&mut self, port: Option<PortId>, request: &Message, message_type: u8, payload: &[u8]) {
        let mut reply = Message::pakctrl(message_type, request.transaction_no().unwrap_or(0), payload);
        reply.source = self.this_node();
        reply.destination = request.source;
        reply.priority = request.priority;
        if let Some(port) = port {
            if request.physical_source == request.source {
                reply.own_route = Some(OwnRoute {
                    port,
                    physical_destination: request.physical_source,
                });
            }
        }
        self.route_message(reply, None);
    }

    /// Run an echo for a remote requester; the outcome goes back in a relay report
    fn on_relay_echo_command(&mut self, message: Message) {
        let (target, packet_size) = match parse_relay_request(message.payload()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed relay echo from {}: {}", message.source, e);
                self.send_delivery_fault(&message, FailureCode::MalformedMessage);
                return;
            }
        };
        let echo = TranEcho::for_requester(
            packet_size as usize,
            message.source,
            message.transaction_no().unwrap_or(0),
            message.priority,
        );
        debug!("Echoing {} for {}", target, message.source);
        if let Err(e) = self.open_transaction(target, message.priority, TranKind::Echo(echo), false) {
            warn!("Relay echo to {} for {} refused: {}", target, message.source, e);
            self.send_delivery_fault(&message, FailureCode::MalformedMessage);
        }
    }

    /// Report a relayed echo's outcome to the node that asked for it
    pub(crate) fn send_relay_report(
        &mut self,
        requester: NodeAddress,
        transaction_no: u8,
        priority: Priority,
        payload: &[u8],
    ) {
        let mut report = Message::pakctrl(message_types::RELAY_ECHO_ACK, transaction_no, payload);
        report.source = self.this_node();
        report.destination = requester;
        report.priority = priority;
        self.route_message(report, None);
    }

    fn on_hello_command(&mut self, port: Option<PortId>, message: Message) {
        let Some(port_id) = port else {
            return;
        };
        let info = match HelloInfo::parse(message.payload()) {
            Ok(info) => info,
            Err(e) => {
                warn!("Malformed hello from {}: {}", message.source, e);
                self.send_delivery_fault(&message, FailureCode::MalformedMessage);
                return;
            }
        };
        if message.source != message.physical_source {
            debug!(
                "Hello from {} relayed by {} ignored",
                message.source, message.physical_source
            );
            return;
        }
        self.settle_neighbour(message.source, port_id, info);
        let Some(port) = self.port(port_id) else {
            return;
        };
        let local = self.local_hello_info(port.as_ref());
        self.reply(Some(port_id), &message, message_types::HELLO_ACK, &local.encode());
    }

    fn on_hello_request(&mut self, port: Option<PortId>, message: &Message) {
        let Some(port_id) = port else {
            return;
        };
        let source = message.physical_source;
        self.observe_beacon(port_id, source, message.is_broadcast());
        if !message.is_broadcast() {
            let now = self.now();
            if let Some(neighbour) = self.topology.neighbour_mut(source) {
                neighbour.force_hello(now);
            }
        }
    }

    fn on_get_neighbours_command(&mut self, port: Option<PortId>, message: Message) {
        let version = self.topology.list_version();
        let entries = self.topology.neighbour_list_entries();
        if let Some(record) = self.topology.router_mut(message.source) {
            record.last_sent_version = Some(version);
            record.send_all = false;
            record.send_change = false;
        }
        let payload = NeighbourList::encode_ack(version, &entries);
        self.reply(port, &message, message_types::GET_NEIGHBOURS_ACK, &payload);
    }

    fn on_send_neighbours_command(&mut self, port: Option<PortId>, message: Message) {
        if self.config.is_leaf_node {
            self.send_delivery_fault(&message, FailureCode::UnsupportedMessageType);
            return;
        }
        let list = match NeighbourList::parse(message.payload()) {
            Ok(list) => list,
            Err(e) => {
                warn!("Malformed neighbour list from {}: {}", message.source, e);
                self.send_delivery_fault(&message, FailureCode::MalformedMessage);
                return;
            }
        };
        let now = self.now();
        if !self.topology.apply_neighbour_list(message.source, &list, now) {
            debug!(
                "Neighbour list {} from {} is out of sync",
                list.version(),
                message.source
            );
        }
        self.reply(port, &message, message_types::SEND_NEIGHBOURS_ACK, &[]);
    }

    fn on_get_settings_command(&mut self, port: Option<PortId>, message: Message) {
        let names = match parse_setting_names(message.payload()) {
            Ok(names) => names,
            Err(e) => {
                warn!("Malformed settings request from {}: {}", message.source, e);
                self.send_delivery_fault(&message, FailureCode::MalformedMessage);
                return;
            }
        };
        let settings = match self.settings_handler.as_ref().and_then(Weak::upgrade) {
            Some(handler) => handler.get_settings(&names),
            None => self.builtin_settings(&names),
        };
        self.reply(
            port,
            &message,
            message_types::GET_STRING_SETTINGS_ACK,
            &format_settings(&settings),
        );
    }

    fn on_set_settings_command(&mut self, port: Option<PortId>, message: Message) {
        let settings = match parse_settings(message.payload()) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Malformed settings from {}: {}", message.source, e);
                self.send_delivery_fault(&message, FailureCode::MalformedMessage);
                return;
            }
        };
        let (outcome, fail_offset) = match self.settings_handler.as_ref().and_then(Weak::upgrade) {
            Some(handler) => match handler.set_settings(&settings) {
                Ok(()) => (SETTINGS_APPLIED, 0),
                Err(index) => (SETTINGS_REJECTED, setting_offset(&settings, index)),
            },
            None => (SETTINGS_REJECTED, 0),
        };
        let mut payload = vec![outcome];
        payload.extend_from_slice(&fail_offset.to_be_bytes());
        self.reply(port, &message, message_types::SET_STRING_SETTINGS_ACK, &payload);
    }

    /// Settings every router answers without a handler
    fn builtin_settings(&self, names: &[String]) -> Vec<(String, String)> {
        let all = [
            ("PakBusAddress", self.this_node().to_string()),
            ("IsRouter", u8::from(!self.config.is_leaf_node).to_string()),
            ("MaxHopCount", self.config.max_hop_count.to_string()),
            (
                "NeighbourCount",
                self.topology.neighbours().count().to_string(),
            ),
        ];
        all.into_iter()
            .filter(|(name, _)| names.is_empty() || names.iter().any(|n| n == name))
            .map(|(name, value)| (name.to_string(), value))
            .collect()
    }
}

/// Byte offset of setting `index` in the formatted command
fn setting_offset(settings: &[(String, String)], index: usize) -> u16 {
    let offset: usize = settings
        .iter()
        .take(index)
        .map(|(name, value)| name.len() + value.len() + 2)
        .sum();
    offset.min(u16::MAX as usize) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_offset() {
        let settings = vec![
            ("Baud".to_string(), "9600".to_string()),
            ("Addr".to_string(), "3".to_string()),
        ];
        assert_eq!(setting_offset(&settings, 0), 0);
        assert_eq!(setting_offset(&settings, 1), 10);
        assert_eq!(setting_offset(&settings, 2), 17);
    }
}
