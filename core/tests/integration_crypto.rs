// Integration tests for sealed traffic between routers holding ciphers

mod common;

use common::{Pair, Recorder};
use pakbus_core::{
    ChaChaCipher, CommandOutcome, EchoOutcome, Message, Priority, ProtocolType, RouterConfig,
    TranFailure,
};
use std::sync::Arc;

/// A and B share a passphrase; B may insist on encrypted application traffic
fn secured_pair(require_encryption: bool) -> Pair {
    let mut config_a = RouterConfig::for_node(1);
    config_a.ciphers.insert(2, "field station".to_string());
    let mut config_b = RouterConfig::for_node(2);
    config_b.ciphers.insert(1, "field station".to_string());
    config_b.require_encryption = require_encryption;

    let mut pair = Pair::with_configs(config_a, config_b, 500);
    pair.settle();
    pair.pump();
    pair
}

#[test]
fn test_echo_is_sealed_on_the_wire() {
    let mut pair = secured_pair(false);
    assert!(pair.b.topology().neighbour(1).map_or(false, |n| n.is_settled()));
    let (port_a, port_b) = pair.link.port_ids();
    assert_eq!(pair.a.queued_message_count(), 0);

    let client = Recorder::<EchoOutcome>::new();
    let key = pair.a.open_echo(2, 40, Priority::Normal, &client).unwrap();
    let sealed = pair.a.get_next_port_message(port_a, 2).unwrap();
    assert_eq!(sealed.protocol, ProtocolType::Encrypted);
    assert_eq!(sealed.message_type(), None);
    assert_eq!((sealed.source, sealed.destination), (1, 2));

    pair.b.on_message(port_b, sealed).unwrap();
    pair.pump();

    assert!(matches!(client.outcome_for(key), Some(EchoOutcome::Success(_))));
    assert_eq!(pair.a.stats().decrypt_failures, 0);
    assert_eq!(pair.b.stats().decrypt_failures, 0);

    println!("✓ Echo sealed by A, opened by B and answered");
}

#[test]
fn test_receiver_without_cipher_reports_fault() {
    let mut pair = Pair::new(1, 2, 500);
    pair.settle();
    pair.pump();
    pair.a
        .set_cipher(2, Arc::new(ChaChaCipher::from_passphrase("only a knows")));
    let faults_before = pair.b.stats().delivery_faults_sent;

    let client = Recorder::<EchoOutcome>::new();
    let key = pair.a.open_echo(2, 40, Priority::Normal, &client).unwrap();
    pair.pump();

    assert_eq!(
        client.outcome_for(key),
        Some(EchoOutcome::Failed(TranFailure::UnsupportedCipher))
    );
    assert!(pair.b.stats().delivery_faults_sent > faults_before);
    assert!(!pair.a.is_transaction_live(key));
}

#[test]
fn test_wrong_passphrase_is_dropped() {
    let mut pair = Pair::new(1, 2, 500);
    pair.settle();
    pair.pump();
    pair.a.set_cipher(2, Arc::new(ChaChaCipher::from_passphrase("north")));
    pair.b.set_cipher(1, Arc::new(ChaChaCipher::from_passphrase("south")));

    let client = Recorder::<EchoOutcome>::new();
    let key = pair.a.open_echo(2, 40, Priority::Normal, &client).unwrap();
    pair.pump();

    assert_eq!(pair.b.stats().decrypt_failures, 1);
    assert!(client.outcome_for(key).is_none());
    assert!(pair.a.is_transaction_live(key));
}

#[test]
fn test_plaintext_refused_when_encryption_required() {
    let mut pair = secured_pair(true);
    let client = Recorder::<CommandOutcome>::new();

    let mut request = Message::bmp5(0x17, 0, &[0, 0]).with_destination(2);
    request.should_encrypt = false;
    let key = pair
        .a
        .open_command(request, Priority::Normal, None, &client)
        .unwrap();
    pair.pump();

    assert_eq!(
        client.outcome_for(key),
        Some(CommandOutcome::Failed(TranFailure::EncryptionRequired))
    );
}

#[test]
fn test_sealed_bmp5_passes_when_encryption_required() {
    let mut pair = secured_pair(true);
    let client = Recorder::<CommandOutcome>::new();

    let request = Message::bmp5(0x17, 0, &[0, 0]).with_destination(2);
    let key = pair
        .a
        .open_command(request, Priority::Normal, None, &client)
        .unwrap();
    pair.pump();

    // B has no application, so the sealed request gets past the encryption check
    assert_eq!(
        client.outcome_for(key),
        Some(CommandOutcome::Failed(TranFailure::HighLevelProtocolUnreachable))
    );
}
