// Terminate — end a conversation with a will-close bye
//
// The bye needs no answer: the transaction succeeds as soon as a port takes
// the message. A give-up timer armed when the transaction opens bounds the
// whole attempt, focus wait included.

use std::sync::Weak;

use super::{notify, TranClient, TranCore, TranFailure, TranKey};
use crate::message::{message_types, ExpectMore, FailureCode, Message};
use crate::router::Router;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Sent,
    Failed(TranFailure),
}

pub struct TerminateTran {
    client: Option<Weak<dyn TranClient<TerminateOutcome>>>,
}

impl TerminateTran {
    pub fn new(client: Option<Weak<dyn TranClient<TerminateOutcome>>>) -> Self {
        Self { client }
    }

    fn finish(&mut self, core: &mut TranCore, router: &mut Router, outcome: TerminateOutcome) {
        if let Some(client) = self.client.take() {
            notify(&client, core.key, outcome);
        }
        router.close_transaction(core);
    }

    pub(crate) fn on_focus_start(&mut self, core: &mut TranCore, router: &mut Router) {
        let mut message = Message::pakctrl(message_types::BYE_CMD, core.key.id, &[]);
        message.will_close = true;
        message.expect_more = ExpectMore::Last;
        router.send_tran_message(core, message);
    }

    pub(crate) fn on_sending_message(&mut self, core: &mut TranCore, router: &mut Router) {
        self.finish(core, router, TerminateOutcome::Sent);
    }

    pub(crate) fn on_failure(&mut self, core: &mut TranCore, router: &mut Router, code: FailureCode) {
        self.finish(core, router, TerminateOutcome::Failed(code.into()));
    }

    pub(crate) fn on_close(&mut self, key: TranKey) {
        if let Some(client) = self.client.take() {
            notify(&client, key, TerminateOutcome::Failed(TranFailure::Aborted));
        }
    }
}
