// Command — an opaque request on behalf of an application
//
// File transfer, device configuration and similar collaborators build their
// own request bodies; the router supplies the transaction number, focus,
// timeouts and retries. The first message back on the same transaction
// number completes it.

use std::sync::Weak;
use tracing::debug;

use super::{notify, TranClient, TranCore, TranFailure, TranKey};
use crate::message::{FailureCode, Message};
use crate::router::Router;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Response(Message),
    Failed(TranFailure),
}

pub struct TranCommand {
    request: Message,
    retries: u32,
    /// Overrides the router's base timeout
    pub base_timeout_msec: Option<u32>,
    client: Option<Weak<dyn TranClient<CommandOutcome>>>,
}

impl TranCommand {
    pub fn new(request: Message, client: Weak<dyn TranClient<CommandOutcome>>) -> Self {
        Self {
            request,
            retries: 0,
            base_timeout_msec: None,
            client: Some(client),
        }
    }

    pub fn with_base_timeout(mut self, msec: u32) -> Self {
        self.base_timeout_msec = Some(msec);
        self
    }

    fn finish(&mut self, core: &mut TranCore, router: &mut Router, outcome: CommandOutcome) {
        if let Some(client) = self.client.take() {
            notify(&client, core.key, outcome);
        }
        router.close_transaction(core);
    }

    pub(crate) fn on_focus_start(&mut self, core: &mut TranCore, router: &mut Router) {
        router.send_tran_message(core, self.request.clone());
    }

    pub(crate) fn on_message(&mut self, core: &mut TranCore, router: &mut Router, message: Message) {
        debug!("Command {} answered with {}", core.key, message);
        self.finish(core, router, CommandOutcome::Response(message));
    }

    pub(crate) fn on_failure(&mut self, core: &mut TranCore, router: &mut Router, code: FailureCode) {
        if code == FailureCode::TimedOutOrResourceError && self.retries < router.max_tran_retries() {
            self.retries += 1;
            router.send_tran_message(core, self.request.clone());
            return;
        }
        self.finish(core, router, CommandOutcome::Failed(code.into()));
    }

    pub(crate) fn on_close(&mut self, key: TranKey) {
        if let Some(client) = self.client.take() {
            notify(&client, key, CommandOutcome::Failed(TranFailure::Aborted));
        }
    }
}
