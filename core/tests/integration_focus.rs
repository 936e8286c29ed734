// Integration tests for transaction ids and focus arbitration
//
// A single router with ports nobody services: messages stay queued, so
// whichever transaction holds focus keeps it until it is cancelled.

mod common;

use common::{router, Recorder};
use pakbus_core::message::{message_types, HelloInfo};
use pakbus_core::{
    EchoOutcome, HopMetric, LoopbackEvent, LoopbackPort, LoopbackSettings, ManualClock, Message,
    Priority, Router, TranFailure, TranState,
};
use std::sync::Arc;

/// Router 1 with static routes to 10, 11 and 12 over an idle port
fn idle_router() -> (Router, Arc<LoopbackPort>) {
    let clock = Arc::new(ManualClock::new(0));
    let mut router = router(&clock, 1);
    let port = LoopbackPort::new(LoopbackSettings::default());
    let id = router.register_port(&port);
    for destination in [10, 11, 12] {
        router.set_static_route(destination, id, destination, 1_000).unwrap();
    }
    (router, port)
}

#[test]
fn test_high_priority_wins_focus() {
    let (mut router, _port) = idle_router();
    let client = Recorder::<EchoOutcome>::new();

    let blocker = router.open_echo(10, 20, Priority::Normal, &client).unwrap();
    assert_eq!(router.focus_holder(), Some(blocker));

    let low = router.open_echo(11, 20, Priority::Low, &client).unwrap();
    let high = router.open_echo(12, 20, Priority::High, &client).unwrap();
    assert_eq!(router.waiting_transactions(), vec![high, low]);
    assert_eq!(router.transaction_state(low), Some(TranState::AwaitingFocus));

    router.cancel_transaction(blocker);
    assert_eq!(
        client.outcome_for(blocker),
        Some(EchoOutcome::Failed(TranFailure::Aborted))
    );
    assert_eq!(router.focus_holder(), Some(high));
    assert_eq!(router.transaction_state(high), Some(TranState::Active));
    assert_eq!(router.waiting_transactions(), vec![low]);

    router.cancel_transaction(high);
    assert_eq!(router.focus_holder(), Some(low));
    assert!(router.waiting_transactions().is_empty());

    println!("✓ Focus follows priority, then arrival order");
}

#[test]
fn test_equal_priority_keeps_arrival_order() {
    let (mut router, _port) = idle_router();
    let client = Recorder::<EchoOutcome>::new();

    let blocker = router.open_echo(10, 20, Priority::Normal, &client).unwrap();
    let first = router.open_echo(11, 20, Priority::Normal, &client).unwrap();
    let second = router.open_echo(12, 20, Priority::Normal, &client).unwrap();
    assert_eq!(router.waiting_transactions(), vec![first, second]);

    router.cancel_transaction(blocker);
    assert_eq!(router.focus_holder(), Some(first));
}

#[test]
fn test_dialed_session_preferred() {
    let (mut router, _port) = idle_router();
    let dialed = LoopbackPort::new(LoopbackSettings {
        name: "modem".to_string(),
        dialed: true,
        ..LoopbackSettings::default()
    });
    dialed.set_connected(true);
    let dialed_id = router.register_port(&dialed);
    router.set_static_route(20, dialed_id, 20, 1_000).unwrap();

    let client = Recorder::<EchoOutcome>::new();
    let blocker = router.open_echo(10, 20, Priority::Normal, &client).unwrap();
    let plain = router.open_echo(11, 20, Priority::High, &client).unwrap();
    let over_session = router.open_echo(20, 20, Priority::Low, &client).unwrap();
    assert_eq!(router.waiting_transactions(), vec![plain, over_session]);

    router.cancel_transaction(blocker);
    assert_eq!(router.focus_holder(), Some(over_session));
}

#[test]
fn test_transaction_ids_are_unique() {
    let (mut router, _port) = idle_router();
    let client = Recorder::<EchoOutcome>::new();

    let keys: Vec<_> = (0..20)
        .map(|_| router.open_echo(10, 20, Priority::Normal, &client).unwrap())
        .collect();
    let ids: Vec<u8> = keys.iter().map(|k| k.id).collect();
    assert_eq!(ids, (1..=20).collect::<Vec<u8>>());
    assert_eq!(router.transaction_count(), 20);
    assert_eq!(router.focus_holder(), Some(keys[0]));
}

#[test]
fn test_freed_id_is_reused_when_the_rest_are_live() {
    let (mut router, _port) = idle_router();
    let client = Recorder::<EchoOutcome>::new();

    let keys: Vec<_> = (0..255)
        .map(|_| router.open_echo(10, 20, Priority::Normal, &client).unwrap())
        .collect();
    router.cancel_transaction(keys[6]);
    let reused = router.open_echo(10, 20, Priority::Normal, &client).unwrap();
    assert_eq!(reused.id, 7);
}

#[test]
#[should_panic(expected = "exhausted")]
fn test_id_exhaustion_is_fatal() {
    let (mut router, _port) = idle_router();
    let client = Recorder::<EchoOutcome>::new();
    for _ in 0..256 {
        router.open_echo(10, 20, Priority::Normal, &client).unwrap();
    }
}

#[test]
fn test_hello_runs_ahead_of_new_neighbour() {
    let clock = Arc::new(ManualClock::new(0));
    let mut router = router(&clock, 1);
    let port = LoopbackPort::new(LoopbackSettings::default());
    let id = router.register_port(&port);

    router.on_beacon(id, 5, false).unwrap();
    let hello_key = router.router_transaction().expect("hello started");
    assert_eq!(hello_key.destination, 5);

    let client = Recorder::<EchoOutcome>::new();
    let echo = router.open_echo(5, 20, Priority::Normal, &client).unwrap();
    assert_eq!(router.focus_holder(), None);
    assert_eq!(router.waiting_transactions(), vec![echo]);

    let hello = router.get_next_port_message(id, 5).expect("hello queued");
    assert_eq!(hello.message_type(), Some(message_types::HELLO_CMD));

    let info = HelloInfo {
        is_router: false,
        hop_metric: HopMetric::from_code(1),
        verify_interval: 0,
    };
    let mut ack = Message::pakctrl(
        message_types::HELLO_ACK,
        hello.transaction_no().unwrap(),
        &info.encode(),
    );
    ack.source = 5;
    ack.destination = 1;
    ack.physical_source = 5;
    ack.physical_destination = 1;
    router.on_message(id, ack).unwrap();

    assert!(router.topology().neighbour(5).unwrap().is_settled());
    assert!(router.router_transaction().is_none());
    assert_eq!(router.focus_holder(), Some(echo));
}

#[test]
fn test_bye_supersedes_queued_application_traffic() {
    let (mut router, port) = idle_router();
    router.send_message(Message::bmp5(0x17, 0, &[0, 0]).with_destination(10)).unwrap();
    router.send_message(Message::bmp5(0x17, 0, &[0, 0]).with_destination(11)).unwrap();
    assert_eq!(router.queued_message_count(), 2);
    port.take_events();

    router.open_terminate(10, Priority::Normal, None).unwrap();

    // the bye to 10 and the message to 11
    assert_eq!(router.queued_message_count(), 2);
    assert!(port.take_events().contains(&LoopbackEvent::Aborted(10)));
}

#[test]
fn test_report_id_shows_in_snapshot() {
    let (mut router, _port) = idle_router();
    let client = Recorder::<EchoOutcome>::new();
    let key = router.open_echo(10, 20, Priority::Normal, &client).unwrap();

    assert!(router.set_report_id(key, 42));
    let snapshot = router.snapshot();
    let summary = snapshot.transactions.iter().find(|t| t.key == key).unwrap();
    assert_eq!(summary.report_id, 42);

    router.cancel_transaction(key);
    assert!(!router.set_report_id(key, 7));
}
