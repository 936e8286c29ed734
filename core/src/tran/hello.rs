// Hello — negotiate router flag, hop metric and verification interval with a neighbour

use tracing::debug;

use super::{TranCore, TranFailure};
use crate::message::{message_types, ExpectMore, FailureCode, HelloInfo, Message, NodeAddress, OwnRoute};
use crate::router::Router;
use crate::transport::PortId;

#[derive(Debug, Clone)]
pub struct HelloTran {
    pub neighbour: NodeAddress,
    port: Option<PortId>,
}

impl HelloTran {
    pub fn new(neighbour: NodeAddress) -> Self {
        Self {
            neighbour,
            port: None,
        }
    }

    pub(crate) fn on_focus_start(&mut self, core: &mut TranCore, router: &mut Router) {
        let Some((port_id, port)) = router.hello_link(self.neighbour) else {
            debug!("Hello to {} dropped, neighbour is gone", self.neighbour);
            router.close_transaction(core);
            return;
        };
        if port.link_is_dialed() && !port.link_is_active() {
            debug!("Hello to {} deferred, {} is not connected", self.neighbour, port_id);
            router.on_hello_skipped(self.neighbour);
            router.close_transaction(core);
            return;
        }

        self.port = Some(port_id);
        let info = router.local_hello_info(port.as_ref());
        let mut message = Message::pakctrl(message_types::HELLO_CMD, core.key.id, &info.encode());
        message.expect_more = ExpectMore::ExpectMore;
        message.own_route = Some(OwnRoute {
            port: port_id,
            physical_destination: self.neighbour,
        });
        router.send_tran_message(core, message);
    }

    pub(crate) fn on_message(&mut self, core: &mut TranCore, router: &mut Router, message: Message) {
        if message.message_type() != Some(message_types::HELLO_ACK) {
            return;
        }
        match (HelloInfo::parse(message.payload()), self.port) {
            (Ok(info), Some(port)) => router.on_hello_response(self.neighbour, port, info),
            (Err(e), _) => {
                debug!("Malformed hello ack from {}: {}", self.neighbour, e);
                router.on_hello_failed(self.neighbour, FailureCode::MalformedMessage);
            }
            (Ok(_), None) => {}
        }
        router.close_transaction(core);
    }

    pub(crate) fn on_failure(&mut self, core: &mut TranCore, router: &mut Router, code: FailureCode) {
        debug!(
            "Hello to {} failed: {:?}",
            self.neighbour,
            TranFailure::from(code)
        );
        router.on_hello_failed(self.neighbour, code);
        router.close_transaction(core);
    }
}
