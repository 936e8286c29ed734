// Integration tests for settings, command and terminate transactions

mod common;

use common::{Pair, Recorder};
use pakbus_core::message::message_types;
use pakbus_core::tran::echo::echo_payload;
use pakbus_core::{
    ApplicationHandler, CommandOutcome, GetSettingsOutcome, Message, Priority, SetSettingsOutcome,
    SettingsHandler, TerminateOutcome, TranClient, TranFailure,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

/// Accepts `Baud` and `Name`, refuses anything else
struct DeviceSettings {
    values: Mutex<BTreeMap<String, String>>,
}

impl DeviceSettings {
    fn new() -> Arc<Self> {
        let mut values = BTreeMap::new();
        values.insert("Baud".to_string(), "9600".to_string());
        values.insert("Name".to_string(), "logger".to_string());
        Arc::new(Self {
            values: Mutex::new(values),
        })
    }
}

impl SettingsHandler for DeviceSettings {
    fn get_settings(&self, names: &[String]) -> Vec<(String, String)> {
        let values = self.values.lock();
        values
            .iter()
            .filter(|(name, _)| names.is_empty() || names.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn set_settings(&self, settings: &[(String, String)]) -> Result<(), usize> {
        let mut values = self.values.lock();
        for (index, (name, value)) in settings.iter().enumerate() {
            match values.get_mut(name) {
                Some(slot) => *slot = value.clone(),
                None => return Err(index),
            }
        }
        Ok(())
    }
}

/// Swallows BMP5 traffic
#[derive(Default)]
struct Bmp5Sink {
    seen: Mutex<Vec<Message>>,
}

impl ApplicationHandler for Bmp5Sink {
    fn on_message(&self, message: &Message) -> bool {
        self.seen.lock().push(message.clone());
        true
    }
}

fn settled_pair() -> Pair {
    let mut pair = Pair::new(1, 2, 500);
    pair.settle();
    pair
}

#[test]
fn test_get_builtin_settings() {
    let mut pair = settled_pair();
    let client = Recorder::<GetSettingsOutcome>::new();

    let key = pair
        .a
        .open_get_settings(2, vec!["PakBusAddress".to_string()], Priority::Normal, &client)
        .unwrap();
    pair.pump();

    assert_eq!(
        client.outcome_for(key),
        Some(GetSettingsOutcome::Success(vec![(
            "PakBusAddress".to_string(),
            "2".to_string()
        )]))
    );
}

#[test]
fn test_get_all_builtin_settings() {
    let mut pair = settled_pair();
    let client = Recorder::<GetSettingsOutcome>::new();

    let key = pair
        .a
        .open_get_settings(2, Vec::new(), Priority::Normal, &client)
        .unwrap();
    pair.pump();

    let Some(GetSettingsOutcome::Success(settings)) = client.outcome_for(key) else {
        panic!("settings request failed");
    };
    let settings: BTreeMap<String, String> = settings.into_iter().collect();
    assert_eq!(settings.get("IsRouter").map(String::as_str), Some("1"));
    assert_eq!(settings.get("NeighbourCount").map(String::as_str), Some("1"));
    assert_eq!(settings.len(), 4);
}

#[test]
fn test_set_without_handler_is_rejected() {
    let mut pair = settled_pair();
    let client = Recorder::<SetSettingsOutcome>::new();

    let key = pair
        .a
        .open_set_settings(
            2,
            vec![("Baud".to_string(), "115200".to_string())],
            Priority::Normal,
            &client,
        )
        .unwrap();
    pair.pump();

    assert_eq!(
        client.outcome_for(key),
        Some(SetSettingsOutcome::Rejected {
            outcome: 2,
            fail_offset: 0
        })
    );
}

#[test]
fn test_settings_handler_applies_and_rejects() {
    let mut pair = settled_pair();
    let device = DeviceSettings::new();
    pair.b.set_settings_handler(&device);
    let set_client = Recorder::<SetSettingsOutcome>::new();
    let get_client = Recorder::<GetSettingsOutcome>::new();

    let applied = pair
        .a
        .open_set_settings(
            2,
            vec![("Baud".to_string(), "115200".to_string())],
            Priority::Normal,
            &set_client,
        )
        .unwrap();
    pair.pump();
    assert_eq!(set_client.outcome_for(applied), Some(SetSettingsOutcome::Applied));

    let rejected = pair
        .a
        .open_set_settings(
            2,
            vec![
                ("Name".to_string(), "site4".to_string()),
                ("Bogus".to_string(), "1".to_string()),
            ],
            Priority::Normal,
            &set_client,
        )
        .unwrap();
    pair.pump();
    assert_eq!(
        set_client.outcome_for(rejected),
        Some(SetSettingsOutcome::Rejected {
            outcome: 2,
            fail_offset: 11
        })
    );

    let key = pair
        .a
        .open_get_settings(2, vec!["Baud".to_string()], Priority::Normal, &get_client)
        .unwrap();
    pair.pump();
    assert_eq!(
        get_client.outcome_for(key),
        Some(GetSettingsOutcome::Success(vec![(
            "Baud".to_string(),
            "115200".to_string()
        )]))
    );
}

#[test]
fn test_command_gets_response() {
    let mut pair = settled_pair();
    let client = Recorder::<CommandOutcome>::new();

    let request = Message::pakctrl(message_types::ECHO_CMD, 0, &echo_payload(20)).with_destination(2);
    let key = pair
        .a
        .open_command(request, Priority::Normal, Some(2_000), &client)
        .unwrap();
    pair.pump();

    match client.outcome_for(key) {
        Some(CommandOutcome::Response(response)) => {
            assert_eq!(response.message_type(), Some(message_types::ECHO_ACK));
            assert_eq!(response.transaction_no(), Some(key.id));
            assert_eq!(response.source, 2);
        }
        other => panic!("unexpected command outcome {:?}", other),
    }
}

#[test]
fn test_command_rejects_responses() {
    let mut pair = settled_pair();
    let client = Recorder::<CommandOutcome>::new();
    let response = Message::pakctrl(message_types::ECHO_ACK, 0, &[]).with_destination(2);
    assert!(pair
        .a
        .open_command(response, Priority::Normal, None, &client)
        .is_err());
    assert_eq!(pair.a.transaction_count(), 0);
}

#[test]
fn test_bmp5_command_without_application() {
    let mut pair = settled_pair();
    let client = Recorder::<CommandOutcome>::new();

    let request = Message::bmp5(0x17, 0, &[0, 0]).with_destination(2);
    let key = pair
        .a
        .open_command(request, Priority::Normal, None, &client)
        .unwrap();
    pair.pump();

    assert_eq!(
        client.outcome_for(key),
        Some(CommandOutcome::Failed(TranFailure::HighLevelProtocolUnreachable))
    );
}

#[test]
fn test_bmp5_request_reaches_application() {
    let mut pair = settled_pair();
    let sink = Arc::new(Bmp5Sink::default());
    pair.b.set_application_handler(&sink);
    let client = Recorder::<CommandOutcome>::new();

    let request = Message::bmp5(0x17, 0, &[0, 0]).with_destination(2);
    let key = pair
        .a
        .open_command(request, Priority::Normal, None, &client)
        .unwrap();
    pair.pump();

    let seen = sink.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].source, 1);
    assert_eq!(seen[0].transaction_no(), Some(key.id));
    assert!(client.outcome_for(key).is_none());
}

#[test]
fn test_terminate_completes_when_sent() {
    let mut pair = settled_pair();
    let client = Recorder::<TerminateOutcome>::new();
    let weak = Arc::downgrade(&client);
    let weak: Weak<dyn TranClient<TerminateOutcome>> = weak;

    let key = pair.a.open_terminate(2, Priority::Normal, Some(weak)).unwrap();
    assert!(client.outcome_for(key).is_none());
    pair.pump();

    assert_eq!(client.outcome_for(key), Some(TerminateOutcome::Sent));
    assert!(!pair.a.is_transaction_live(key));
}

#[test]
fn test_terminate_gives_up() {
    let mut pair = settled_pair();
    let client = Recorder::<TerminateOutcome>::new();
    let weak = Arc::downgrade(&client);
    let weak: Weak<dyn TranClient<TerminateOutcome>> = weak;

    let key = pair.a.open_terminate(2, Priority::Normal, Some(weak)).unwrap();
    let give_up = pair.a.config().terminate_give_up_msec as u64;
    pair.clock.advance(give_up);
    pair.a.poll();

    assert_eq!(
        client.outcome_for(key),
        Some(TerminateOutcome::Failed(TranFailure::TimedOut))
    );
}
