// String settings over PakCtrl
//
// Devices without a native settings protocol take `name=value;` strings.
// Get sends `name;name;` and receives `name=value;`; set sends
// `name=value;` and receives an outcome byte plus the offset of the first
// setting that failed.

use std::sync::Weak;
use tracing::debug;

use super::{notify, TranClient, TranCore, TranFailure, TranKey};
use crate::message::pakctrl::{format_setting_names, format_settings, parse_settings};
use crate::message::{message_types, FailureCode, Message};
use crate::router::Router;

/// Set acknowledgement outcome meaning every setting was applied
pub const SETTINGS_APPLIED: u8 = 1;

/// Set acknowledgement outcome for a setting the device refused
pub const SETTINGS_REJECTED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetSettingsOutcome {
    Success(Vec<(String, String)>),
    /// The acknowledgement did not parse
    Malformed,
    Failed(TranFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetSettingsOutcome {
    Applied,
    Rejected { outcome: u8, fail_offset: u16 },
    Failed(TranFailure),
}

/// Shared retry bookkeeping for the two settings transactions
fn should_retry(retries: &mut u32, router: &Router, code: FailureCode) -> bool {
    if code == FailureCode::TimedOutOrResourceError && *retries < router.max_tran_retries() {
        *retries += 1;
        true
    } else {
        false
    }
}

pub struct TranGetSettings {
    names: Vec<String>,
    retries: u32,
    client: Option<Weak<dyn TranClient<GetSettingsOutcome>>>,
}

impl TranGetSettings {
    pub fn new(names: Vec<String>, client: Weak<dyn TranClient<GetSettingsOutcome>>) -> Self {
        Self {
            names,
            retries: 0,
            client: Some(client),
        }
    }

    fn send(&self, core: &mut TranCore, router: &mut Router) {
        let message = Message::pakctrl(
            message_types::GET_STRING_SETTINGS_CMD,
            core.key.id,
            &format_setting_names(&self.names),
        );
        router.send_tran_message(core, message);
    }

    fn finish(&mut self, core: &mut TranCore, router: &mut Router, outcome: GetSettingsOutcome) {
        if let Some(client) = self.client.take() {
            notify(&client, core.key, outcome);
        }
        router.close_transaction(core);
    }

    pub(crate) fn on_focus_start(&mut self, core: &mut TranCore, router: &mut Router) {
        self.send(core, router);
    }

    pub(crate) fn on_message(&mut self, core: &mut TranCore, router: &mut Router, message: Message) {
        if message.message_type() != Some(message_types::GET_STRING_SETTINGS_ACK) {
            return;
        }
        let outcome = match parse_settings(message.payload()) {
            Ok(settings) => GetSettingsOutcome::Success(settings),
            Err(e) => {
                debug!("Bad settings from {}: {}", core.key.destination, e);
                GetSettingsOutcome::Malformed
            }
        };
        self.finish(core, router, outcome);
    }

    pub(crate) fn on_failure(&mut self, core: &mut TranCore, router: &mut Router, code: FailureCode) {
        if should_retry(&mut self.retries, router, code) {
            self.send(core, router);
        } else {
            self.finish(core, router, GetSettingsOutcome::Failed(code.into()));
        }
    }

    pub(crate) fn on_close(&mut self, key: TranKey) {
        if let Some(client) = self.client.take() {
            notify(&client, key, GetSettingsOutcome::Failed(TranFailure::Aborted));
        }
    }
}

pub struct TranSetSettings {
    settings: Vec<(String, String)>,
    retries: u32,
    client: Option<Weak<dyn TranClient<SetSettingsOutcome>>>,
}

impl TranSetSettings {
    pub fn new(
        settings: Vec<(String, String)>,
        client: Weak<dyn TranClient<SetSettingsOutcome>>,
    ) -> Self {
        Self {
            settings,
            retries: 0,
            client: Some(client),
        }
    }

    fn send(&self, core: &mut TranCore, router: &mut Router) {
        let message = Message::pakctrl(
            message_types::SET_STRING_SETTINGS_CMD,
            core.key.id,
            &format_settings(&self.settings),
        );
        router.send_tran_message(core, message);
    }

    fn finish(&mut self, core: &mut TranCore, router: &mut Router, outcome: SetSettingsOutcome) {
        if let Some(client) = self.client.take() {
            notify(&client, core.key, outcome);
        }
        router.close_transaction(core);
    }

    pub(crate) fn on_focus_start(&mut self, core: &mut TranCore, router: &mut Router) {
        self.send(core, router);
    }

    pub(crate) fn on_message(&mut self, core: &mut TranCore, router: &mut Router, message: Message) {
        if message.message_type() != Some(message_types::SET_STRING_SETTINGS_ACK) {
            return;
        }
        let outcome = match message.payload() {
            [SETTINGS_APPLIED, ..] => SetSettingsOutcome::Applied,
            [outcome, hi, lo, ..] => SetSettingsOutcome::Rejected {
                outcome: *outcome,
                fail_offset: u16::from_be_bytes([*hi, *lo]),
            },
            [outcome, ..] => SetSettingsOutcome::Rejected {
                outcome: *outcome,
                fail_offset: 0,
            },
            [] => SetSettingsOutcome::Failed(TranFailure::Malformed),
        };
        self.finish(core, router, outcome);
    }

    pub(crate) fn on_failure(&mut self, core: &mut TranCore, router: &mut Router, code: FailureCode) {
        if should_retry(&mut self.retries, router, code) {
            self.send(core, router);
        } else {
            self.finish(core, router, SetSettingsOutcome::Failed(code.into()));
        }
    }

    pub(crate) fn on_close(&mut self, key: TranKey) {
        if let Some(client) = self.client.take() {
            notify(&client, key, SetSettingsOutcome::Failed(TranFailure::Aborted));
        }
    }
}
