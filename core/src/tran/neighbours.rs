// Neighbour list synchronisation between routers

use tracing::debug;

use super::TranCore;
use crate::message::{message_types, FailureCode, Message, NeighbourList, NodeAddress};
use crate::router::Router;

/// Fetch a router's complete neighbour list
#[derive(Debug, Clone)]
pub struct GetNeighboursTran {
    pub router_address: NodeAddress,
}

impl GetNeighboursTran {
    pub fn new(router_address: NodeAddress) -> Self {
        Self { router_address }
    }

    pub(crate) fn on_focus_start(&mut self, core: &mut TranCore, router: &mut Router) {
        let message = Message::pakctrl(message_types::GET_NEIGHBOURS_CMD, core.key.id, &[]);
        router.send_tran_message(core, message);
    }

    pub(crate) fn on_message(&mut self, core: &mut TranCore, router: &mut Router, message: Message) {
        if message.message_type() != Some(message_types::GET_NEIGHBOURS_ACK) {
            return;
        }
        match NeighbourList::parse_ack(message.payload()) {
            Ok(list) => router.on_neighbour_list_received(self.router_address, &list),
            Err(e) => {
                debug!("Malformed neighbour list from {}: {}", self.router_address, e);
                router.on_neighbour_sync_failed(self.router_address, FailureCode::MalformedMessage);
            }
        }
        router.close_transaction(core);
    }

    pub(crate) fn on_failure(&mut self, core: &mut TranCore, router: &mut Router, code: FailureCode) {
        router.on_neighbour_sync_failed(self.router_address, code);
        router.close_transaction(core);
    }
}

/// Push our neighbour list (complete or changes) to a router
#[derive(Debug, Clone)]
pub struct SendNeighboursTran {
    pub router_address: NodeAddress,
    version_sent: Option<u8>,
}

impl SendNeighboursTran {
    pub fn new(router_address: NodeAddress) -> Self {
        Self {
            router_address,
            version_sent: None,
        }
    }

    pub(crate) fn on_focus_start(&mut self, core: &mut TranCore, router: &mut Router) {
        let list = router.neighbour_list_for(self.router_address);
        self.version_sent = Some(list.version());
        let message =
            Message::pakctrl(message_types::SEND_NEIGHBOURS_CMD, core.key.id, &list.encode());
        router.send_tran_message(core, message);
    }

    pub(crate) fn on_message(&mut self, core: &mut TranCore, router: &mut Router, message: Message) {
        if message.message_type() != Some(message_types::SEND_NEIGHBOURS_ACK) {
            return;
        }
        if let Some(version) = self.version_sent {
            router.on_neighbour_list_sent(self.router_address, version);
        }
        router.close_transaction(core);
    }

    pub(crate) fn on_failure(&mut self, core: &mut TranCore, router: &mut Router, code: FailureCode) {
        router.on_neighbour_sync_failed(self.router_address, code);
        router.close_transaction(core);
    }
}
