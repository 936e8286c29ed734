//! Transactions — one outstanding exchange with one destination
//!
//! A transaction is keyed by `(destination, id)`. It moves through
//! idle → awaiting focus → active → closing → closed. The router owns every
//! transaction and drives it through the hooks below; each kind decides its
//! own retry policy and reports a typed outcome to its client.
//!
//! Kinds:
//! - Hello: negotiate link parameters with a neighbour
//! - GetNeighbours / SendNeighbours: router to router neighbour list sync
//! - Terminate: close a link with a will-close bye
//! - Echo: round trip timing with integrity check, optionally relayed
//! - GetSettings / SetSettings: string settings over PakCtrl
//! - Command: an opaque request supplied by an application

pub mod command;
pub mod echo;
pub mod hello;
pub mod neighbours;
pub mod settings;
pub mod terminate;

pub use command::{CommandOutcome, TranCommand};
pub use echo::{EchoOutcome, EchoReport, TranEcho};
pub use hello::HelloTran;
pub use neighbours::{GetNeighboursTran, SendNeighboursTran};
pub use settings::{GetSettingsOutcome, SetSettingsOutcome, TranGetSettings, TranSetSettings};
pub use terminate::{TerminateOutcome, TerminateTran};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Weak;

use crate::message::{FailureCode, Message, NodeAddress, Priority};
use crate::router::Router;
use crate::timer::TimerId;

/// Identifies a message queued by the router
pub type MessageSerial = u64;

/// Key of a live transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TranKey {
    pub destination: NodeAddress,
    pub id: u8,
}

impl fmt::Display for TranKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.destination, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranState {
    Idle,
    AwaitingFocus,
    Active,
    Closing,
    Closed,
}

/// Timers a transaction can own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranTimer {
    Watchdog,
    /// Give-up timer that runs regardless of focus
    Closing,
    /// Grace period after the route to the destination vanished
    Unroutable,
}

/// Client facing reason a transaction failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranFailure {
    TimedOut,
    Unreachable,
    HighLevelProtocolUnreachable,
    UnsupportedMessage,
    Malformed,
    StaticRouteFailed,
    PacketTooBig,
    UnsupportedCipher,
    EncryptionRequired,
    /// Closed before it reached an outcome
    Aborted,
    Other(u8),
}

impl From<FailureCode> for TranFailure {
    fn from(code: FailureCode) -> Self {
        match code {
            FailureCode::UnreachableDestination => TranFailure::Unreachable,
            FailureCode::UnreachableHighLevelProtocol => TranFailure::HighLevelProtocolUnreachable,
            FailureCode::TimedOutOrResourceError => TranFailure::TimedOut,
            FailureCode::UnsupportedMessageType => TranFailure::UnsupportedMessage,
            FailureCode::MalformedMessage => TranFailure::Malformed,
            FailureCode::FailedStaticRoute => TranFailure::StaticRouteFailed,
            FailureCode::PacketTooBig64
            | FailureCode::PacketTooBig90
            | FailureCode::PacketTooBig128
            | FailureCode::PacketTooBig256
            | FailureCode::PacketTooBig512 => TranFailure::PacketTooBig,
            FailureCode::UnsupportedEncryptionCipher => TranFailure::UnsupportedCipher,
            FailureCode::EncryptionRequired => TranFailure::EncryptionRequired,
            FailureCode::Unknown(other) => TranFailure::Other(other),
        }
    }
}

/// Wire code for a failure that is reported on to another node
impl From<TranFailure> for FailureCode {
    fn from(failure: TranFailure) -> Self {
        match failure {
            TranFailure::TimedOut | TranFailure::Aborted => FailureCode::TimedOutOrResourceError,
            TranFailure::Unreachable => FailureCode::UnreachableDestination,
            TranFailure::HighLevelProtocolUnreachable => FailureCode::UnreachableHighLevelProtocol,
            TranFailure::UnsupportedMessage => FailureCode::UnsupportedMessageType,
            TranFailure::Malformed => FailureCode::MalformedMessage,
            TranFailure::StaticRouteFailed => FailureCode::FailedStaticRoute,
            TranFailure::PacketTooBig => FailureCode::PacketTooBig64,
            TranFailure::UnsupportedCipher => FailureCode::UnsupportedEncryptionCipher,
            TranFailure::EncryptionRequired => FailureCode::EncryptionRequired,
            TranFailure::Other(code) => FailureCode::Unknown(code),
        }
    }
}

/// Receives the outcome of a transaction.
///
/// Called while the router is busy; implementations must not call back
/// into the router.
pub trait TranClient<O>: Send + Sync {
    fn on_complete(&self, key: TranKey, outcome: O);
}

/// Deliver an outcome if the client is still alive
pub(crate) fn notify<O>(client: &Weak<dyn TranClient<O>>, key: TranKey, outcome: O) {
    if let Some(client) = client.upgrade() {
        client.on_complete(key, outcome);
    }
}

/// State shared by every transaction kind
#[derive(Debug, Clone)]
pub struct TranCore {
    pub key: TranKey,
    pub priority: Priority,
    pub state: TranState,
    /// Runs in the router's maintenance slot instead of the focus queue
    pub router_sponsored: bool,
    /// Already had a hello inserted ahead of it
    pub preempted: bool,
    pub round_trip_base: u64,
    pub first_message_sent: bool,
    pub watchdog: TimerId,
    pub closing_timer: TimerId,
    pub unroutable_timer: TimerId,
    /// Messages queued but not yet handed to a port
    pub pending_messages: Vec<MessageSerial>,
    /// Caller supplied tag for progress reporting
    pub report_id: u64,
}

impl TranCore {
    pub fn new(key: TranKey, priority: Priority, router_sponsored: bool) -> Self {
        Self {
            key,
            priority,
            state: TranState::Idle,
            router_sponsored,
            preempted: false,
            round_trip_base: 0,
            first_message_sent: false,
            watchdog: 0,
            closing_timer: 0,
            unroutable_timer: 0,
            pending_messages: Vec::new(),
            report_id: 0,
        }
    }

    /// Stuck: sent something but nothing will ever fire for it
    pub fn is_still_valid(&self) -> bool {
        !(self.first_message_sent && self.watchdog == 0 && self.closing_timer == 0)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, TranState::Closing | TranState::Closed)
    }
}

pub enum TranKind {
    Hello(HelloTran),
    GetNeighbours(GetNeighboursTran),
    SendNeighbours(SendNeighboursTran),
    Terminate(TerminateTran),
    Echo(TranEcho),
    GetSettings(TranGetSettings),
    SetSettings(TranSetSettings),
    Command(TranCommand),
}

impl TranKind {
    pub fn name(&self) -> &'static str {
        match self {
            TranKind::Hello(_) => "hello",
            TranKind::GetNeighbours(_) => "get_neighbours",
            TranKind::SendNeighbours(_) => "send_neighbours",
            TranKind::Terminate(_) => "terminate",
            TranKind::Echo(_) => "echo",
            TranKind::GetSettings(_) => "get_settings",
            TranKind::SetSettings(_) => "set_settings",
            TranKind::Command(_) => "command",
        }
    }

    /// Base of the response timeout before route latency is added
    pub fn base_timeout_msec(&self, default_msec: u32) -> u32 {
        match self {
            TranKind::Command(t) => t.base_timeout_msec.unwrap_or(default_msec),
            TranKind::Echo(t) => t.base_timeout_msec(default_msec),
            _ => default_msec,
        }
    }
}

pub struct Transaction {
    pub core: TranCore,
    pub kind: TranKind,
}

impl Transaction {
    pub fn new(core: TranCore, kind: TranKind) -> Self {
        Self { core, kind }
    }

    pub(crate) fn on_focus_start(&mut self, router: &mut Router) {
        let core = &mut self.core;
        match &mut self.kind {
            TranKind::Hello(t) => t.on_focus_start(core, router),
            TranKind::GetNeighbours(t) => t.on_focus_start(core, router),
            TranKind::SendNeighbours(t) => t.on_focus_start(core, router),
            TranKind::Terminate(t) => t.on_focus_start(core, router),
            TranKind::Echo(t) => t.on_focus_start(core, router),
            TranKind::GetSettings(t) => t.on_focus_start(core, router),
            TranKind::SetSettings(t) => t.on_focus_start(core, router),
            TranKind::Command(t) => t.on_focus_start(core, router),
        }
    }

    pub(crate) fn on_message(&mut self, router: &mut Router, message: Message) {
        let core = &mut self.core;
        match &mut self.kind {
            TranKind::Hello(t) => t.on_message(core, router, message),
            TranKind::GetNeighbours(t) => t.on_message(core, router, message),
            TranKind::SendNeighbours(t) => t.on_message(core, router, message),
            TranKind::Terminate(_) => {}
            TranKind::Echo(t) => t.on_message(core, router, message),
            TranKind::GetSettings(t) => t.on_message(core, router, message),
            TranKind::SetSettings(t) => t.on_message(core, router, message),
            TranKind::Command(t) => t.on_message(core, router, message),
        }
    }

    pub(crate) fn on_failure(&mut self, router: &mut Router, code: FailureCode) {
        let core = &mut self.core;
        match &mut self.kind {
            TranKind::Hello(t) => t.on_failure(core, router, code),
            TranKind::GetNeighbours(t) => t.on_failure(core, router, code),
            TranKind::SendNeighbours(t) => t.on_failure(core, router, code),
            TranKind::Terminate(t) => t.on_failure(core, router, code),
            TranKind::Echo(t) => t.on_failure(core, router, code),
            TranKind::GetSettings(t) => t.on_failure(core, router, code),
            TranKind::SetSettings(t) => t.on_failure(core, router, code),
            TranKind::Command(t) => t.on_failure(core, router, code),
        }
    }

    /// A queued message was handed to a port
    pub(crate) fn on_sending_message(&mut self, router: &mut Router) {
        if let TranKind::Terminate(t) = &mut self.kind {
            t.on_sending_message(&mut self.core, router);
        }
    }

    /// The transaction left the router's table
    pub(crate) fn on_close(&mut self) {
        let key = self.core.key;
        match &mut self.kind {
            TranKind::Terminate(t) => t.on_close(key),
            TranKind::Echo(t) => t.on_close(key),
            TranKind::GetSettings(t) => t.on_close(key),
            TranKind::SetSettings(t) => t.on_close(key),
            TranKind::Command(t) => t.on_close(key),
            TranKind::Hello(_) | TranKind::GetNeighbours(_) | TranKind::SendNeighbours(_) => {}
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("kind", &self.kind.name())
            .field("core", &self.core)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_translation() {
        assert_eq!(TranFailure::from(FailureCode::TimedOutOrResourceError), TranFailure::TimedOut);
        assert_eq!(TranFailure::from(FailureCode::UnreachableDestination), TranFailure::Unreachable);
        assert_eq!(TranFailure::from(FailureCode::PacketTooBig256), TranFailure::PacketTooBig);
        assert_eq!(TranFailure::from(FailureCode::EncryptionRequired), TranFailure::EncryptionRequired);
        assert_eq!(TranFailure::from(FailureCode::Unknown(40)), TranFailure::Other(40));
    }

    #[test]
    fn test_still_valid_rules() {
        let mut core = TranCore::new(TranKey { destination: 2, id: 1 }, Priority::Normal, false);
        assert!(core.is_still_valid());
        core.first_message_sent = true;
        assert!(!core.is_still_valid());
        core.watchdog = 4;
        assert!(core.is_still_valid());
        core.watchdog = 0;
        core.closing_timer = 9;
        assert!(core.is_still_valid());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(TranKey { destination: 12, id: 200 }.to_string(), "12/200");
    }
}
