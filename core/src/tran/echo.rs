// Echo — round trip timing with an integrity check on the returned padding
//
// Command payload: 8 byte time placeholder, random padding, 2 byte
// signature nullifier. The responder answers with its clock followed by
// the padding and nullifier it received. Because the nullifier drives the
// signature of padding + nullifier to zero, the requester can verify the
// echo without remembering what it sent.
//
// An echo can also run on another node's behalf. The requester sends a
// relay command naming the target and packet size; the relay echoes the
// target itself and answers with the outcome once it has one.

use rand::RngCore;
use std::sync::Weak;
use tracing::debug;

use super::{notify, TranClient, TranCore, TranFailure, TranKey};
use crate::message::pakctrl::{decode_nsec, encode_nsec};
use crate::message::{
    append_sig_nullifier, calc_sig, message_types, FailureCode, Message, NodeAddress, Priority,
    ProtocolError, SIG_SEED,
};
use crate::router::Router;

const TIME_LEN: usize = 8;
const NULLIFIER_LEN: usize = 2;
const RELAY_REQUEST_LEN: usize = 4;
const RELAY_REPORT_LEN: usize = 14;
/// The relay runs its own echo with retries before it can answer
const RELAY_TIMEOUT_FACTOR: u32 = 4;

const REPORT_SUCCESS: u8 = 0;
const REPORT_CORRUPTED: u8 = 1;
const REPORT_FAILED: u8 = 2;

/// Smallest echo payload: the time placeholder and the nullifier
pub const MIN_ECHO_PAYLOAD: usize = TIME_LEN + NULLIFIER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReport {
    pub round_trip_msec: u64,
    /// Responder clock, seconds since 1990
    pub responder_seconds: u32,
    pub responder_nanos: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    Success(EchoReport),
    /// The echoed padding failed its signature check
    CorruptedEcho,
    Failed(TranFailure),
}

/// Build an echo command payload of `packet_size` bytes (at least ten)
pub fn echo_payload(packet_size: usize) -> Vec<u8> {
    let size = packet_size.max(MIN_ECHO_PAYLOAD);
    let mut padding = vec![0u8; size - MIN_ECHO_PAYLOAD];
    rand::thread_rng().fill_bytes(&mut padding);
    append_sig_nullifier(&mut padding);

    let mut payload = vec![0u8; TIME_LEN];
    payload.extend_from_slice(&padding);
    payload
}

/// Answer an echo command payload with our clock
pub fn echo_ack_payload(command_payload: &[u8], seconds: u32, nanos: u32) -> Vec<u8> {
    let mut payload = encode_nsec(seconds, nanos).to_vec();
    payload.extend_from_slice(command_payload.get(TIME_LEN..).unwrap_or_default());
    payload
}

/// Body of a relay command: the node to echo and the packet size to use
pub fn relay_request_payload(target: NodeAddress, packet_size: u16) -> Vec<u8> {
    let mut payload = target.to_be_bytes().to_vec();
    payload.extend_from_slice(&packet_size.to_be_bytes());
    payload
}

pub fn parse_relay_request(payload: &[u8]) -> Result<(NodeAddress, u16), ProtocolError> {
    if payload.len() < RELAY_REQUEST_LEN {
        return Err(ProtocolError::BufferTooShort {
            need: RELAY_REQUEST_LEN,
            got: payload.len(),
        });
    }
    Ok((
        u16::from_be_bytes([payload[0], payload[1]]),
        u16::from_be_bytes([payload[2], payload[3]]),
    ))
}

/// Outcome of a relayed echo as carried back to the requester:
/// status, failure code, round trip msec, responder seconds and nanos
pub fn relay_report_payload(outcome: &EchoOutcome) -> Vec<u8> {
    let (status, failure, report) = match outcome {
        EchoOutcome::Success(report) => (REPORT_SUCCESS, 0, Some(*report)),
        EchoOutcome::CorruptedEcho => (REPORT_CORRUPTED, 0, None),
        EchoOutcome::Failed(failure) => (REPORT_FAILED, FailureCode::from(*failure).as_u8(), None),
    };
    let report = report.unwrap_or(EchoReport {
        round_trip_msec: 0,
        responder_seconds: 0,
        responder_nanos: 0,
    });
    let round_trip = u32::try_from(report.round_trip_msec).unwrap_or(u32::MAX);

    let mut payload = vec![status, failure];
    payload.extend_from_slice(&round_trip.to_be_bytes());
    payload.extend_from_slice(&encode_nsec(report.responder_seconds, report.responder_nanos));
    payload
}

pub fn parse_relay_report(payload: &[u8]) -> Result<EchoOutcome, ProtocolError> {
    if payload.len() < RELAY_REPORT_LEN {
        return Err(ProtocolError::BufferTooShort {
            need: RELAY_REPORT_LEN,
            got: payload.len(),
        });
    }
    match payload[0] {
        REPORT_SUCCESS => {
            let round_trip = u32::from_be_bytes([payload[2], payload[3], payload[4], payload[5]]);
            let (seconds, nanos) = decode_nsec(&payload[6..])?;
            Ok(EchoOutcome::Success(EchoReport {
                round_trip_msec: round_trip as u64,
                responder_seconds: seconds,
                responder_nanos: nanos,
            }))
        }
        REPORT_CORRUPTED => Ok(EchoOutcome::CorruptedEcho),
        REPORT_FAILED => Ok(EchoOutcome::Failed(FailureCode::from_u8(payload[1]).into())),
        other => Err(ProtocolError::Malformed(format!("relay echo status {}", other))),
    }
}

/// Who hears about the outcome
enum Reporter {
    Client(Weak<dyn TranClient<EchoOutcome>>),
    /// A remote node that asked us to run the echo
    Requester {
        address: NodeAddress,
        transaction_no: u8,
        priority: Priority,
    },
}

pub struct TranEcho {
    packet_size: usize,
    /// Set when the destination is asked to echo this node for us
    relay_target: Option<NodeAddress>,
    retries: u32,
    sent_at: u64,
    reporter: Option<Reporter>,
}

impl TranEcho {
    pub fn new(packet_size: usize, client: Weak<dyn TranClient<EchoOutcome>>) -> Self {
        Self {
            packet_size,
            relay_target: None,
            retries: 0,
            sent_at: 0,
            reporter: Some(Reporter::Client(client)),
        }
    }

    /// Ask the transaction's destination to echo `target` and report back
    pub fn through_relay(
        target: NodeAddress,
        packet_size: usize,
        client: Weak<dyn TranClient<EchoOutcome>>,
    ) -> Self {
        Self {
            relay_target: Some(target),
            ..Self::new(packet_size, client)
        }
    }

    /// Echo on behalf of `requester`, answering its relay command `transaction_no`
    pub fn for_requester(
        packet_size: usize,
        requester: NodeAddress,
        transaction_no: u8,
        priority: Priority,
    ) -> Self {
        Self {
            packet_size,
            relay_target: None,
            retries: 0,
            sent_at: 0,
            reporter: Some(Reporter::Requester {
                address: requester,
                transaction_no,
                priority,
            }),
        }
    }

    pub fn is_relayed(&self) -> bool {
        self.relay_target.is_some()
    }

    pub(crate) fn base_timeout_msec(&self, default_msec: u32) -> u32 {
        if self.is_relayed() {
            default_msec.saturating_mul(RELAY_TIMEOUT_FACTOR)
        } else {
            default_msec
        }
    }

    fn send(&mut self, core: &mut TranCore, router: &mut Router) {
        let message = match self.relay_target {
            Some(target) => {
                let size = u16::try_from(self.packet_size).unwrap_or(u16::MAX);
                let payload = relay_request_payload(target, size);
                Message::pakctrl(message_types::RELAY_ECHO_CMD, core.key.id, &payload)
            }
            None => {
                let payload = echo_payload(self.packet_size);
                Message::pakctrl(message_types::ECHO_CMD, core.key.id, &payload)
            }
        };
        self.sent_at = router.now();
        router.send_tran_message(core, message);
    }

    fn finish(&mut self, core: &mut TranCore, router: &mut Router, outcome: EchoOutcome) {
        match self.reporter.take() {
            Some(Reporter::Client(client)) => notify(&client, core.key, outcome),
            Some(Reporter::Requester {
                address,
                transaction_no,
                priority,
            }) => {
                debug!("Reporting echo of {} to {}: {:?}", core.key.destination, address, outcome);
                router.send_relay_report(address, transaction_no, priority, &relay_report_payload(&outcome));
            }
            None => {}
        }
        router.close_transaction(core);
    }

    pub(crate) fn on_focus_start(&mut self, core: &mut TranCore, router: &mut Router) {
        self.send(core, router);
    }

    pub(crate) fn on_message(&mut self, core: &mut TranCore, router: &mut Router, message: Message) {
        let outcome = match (message.message_type(), self.relay_target) {
            (Some(message_types::ECHO_ACK), None) => self.check_ack(core, router, message.payload()),
            (Some(message_types::RELAY_ECHO_ACK), Some(target)) => {
                match parse_relay_report(message.payload()) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        debug!("Bad relay report from {} about {}: {}", core.key.destination, target, e);
                        EchoOutcome::Failed(TranFailure::Malformed)
                    }
                }
            }
            _ => return,
        };
        self.finish(core, router, outcome);
    }

    fn check_ack(&self, core: &TranCore, router: &Router, payload: &[u8]) -> EchoOutcome {
        match decode_nsec(payload) {
            Ok((seconds, nanos)) if payload.len() >= MIN_ECHO_PAYLOAD
                && calc_sig(&payload[TIME_LEN..], SIG_SEED) == 0 =>
            {
                EchoOutcome::Success(EchoReport {
                    round_trip_msec: router.now().saturating_sub(self.sent_at),
                    responder_seconds: seconds,
                    responder_nanos: nanos,
                })
            }
            _ => {
                debug!("Echo from {} came back corrupted", core.key.destination);
                EchoOutcome::CorruptedEcho
            }
        }
    }

    pub(crate) fn on_failure(&mut self, core: &mut TranCore, router: &mut Router, code: FailureCode) {
        if code == FailureCode::TimedOutOrResourceError && self.retries < router.max_tran_retries() {
            self.retries += 1;
            debug!("Echo {} timed out, retry {}", core.key, self.retries);
            self.send(core, router);
            return;
        }
        self.finish(core, router, EchoOutcome::Failed(code.into()));
    }

    pub(crate) fn on_close(&mut self, key: TranKey) {
        match self.reporter.take() {
            Some(Reporter::Client(client)) => {
                notify(&client, key, EchoOutcome::Failed(TranFailure::Aborted))
            }
            Some(Reporter::Requester { address, .. }) => {
                debug!("Echo {} for {} closed without a report", key, address)
            }
            None => {}
        }
    }
}
