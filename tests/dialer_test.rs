//! The committee overlay dialer: two-way handshakes under a shared deadline, committee
//! reconciliation, and RSA-encrypted node identity publication.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};

use dpor_rs::config::DialerConfig;
use dpor_rs::dialer::{Dialer, MsgReadWriter, PeerRole};
use dpor_rs::errors::ProtocolError;
use dpor_rs::lbft::messages::{HandshakeStatus, Message};
use dpor_rs::types::Term;

use common::*;

fn test_dialer(seed: u8, timeout_ms: u64) -> Dialer {
    let config = DialerConfig {
        handshake_timeout: Duration::from_millis(timeout_ms),
        ..DialerConfig::default()
    };
    Dialer::new(config, keypair(seed).address(), format!("enode://{seed}@127.0.0.1:30303"))
}

#[test]
fn two_way_handshake_succeeds() {
    let alice = test_dialer(1, 1000);
    let bob = test_dialer(2, 1000);
    let alice_addr = keypair(1).address();
    let bob_addr = keypair(2).address();

    let (conn_a, conn_b) = ChannelConn::pair();

    let handle = thread::spawn(move || {
        bob.handshake(conn_b, &|addr| {
            (*addr == alice_addr).then_some(PeerRole::Proposer)
        })
    });

    let (role, peer) = alice
        .handshake(conn_a, &|addr| (*addr == bob_addr).then_some(PeerRole::Validator))
        .unwrap();
    assert_eq!(role, PeerRole::Validator);
    assert_eq!(peer, bob_addr);

    let (role, peer) = handle.join().unwrap().unwrap();
    assert_eq!(role, PeerRole::Proposer);
    assert_eq!(peer, alice_addr);
}

#[test]
fn silent_peer_times_out_the_handshake() {
    let alice = test_dialer(1, 100);
    let (conn_a, _conn_b) = ChannelConn::pair();

    let err = alice.handshake(conn_a, &|_| Some(PeerRole::Validator)).unwrap_err();
    assert_eq!(err, ProtocolError::HandshakeTimeout);
}

#[test]
fn version_mismatch_terminates_the_connection() {
    let alice = test_dialer(1, 1000);
    let (conn_a, conn_b) = ChannelConn::pair();

    thread::spawn(move || {
        // Consume alice's status, answer with an alien protocol version.
        let _ = conn_b.read_msg();
        let _ = conn_b.write_msg(&Message::Status(HandshakeStatus {
            version: 999,
            address: keypair(2).address(),
        }));
    });

    let err = alice.handshake(conn_a, &|_| Some(PeerRole::Validator)).unwrap_err();
    assert_eq!(err, ProtocolError::VersionMismatch { ours: 1, theirs: 999 });
}

#[test]
fn unknown_peers_are_rejected_after_the_exchange() {
    let alice = test_dialer(1, 1000);
    let (conn_a, conn_b) = ChannelConn::pair();

    thread::spawn(move || {
        let _ = conn_b.read_msg();
        let _ = conn_b.write_msg(&Message::Status(HandshakeStatus {
            version: 1,
            address: keypair(9).address(),
        }));
    });

    let err = alice.handshake(conn_a, &|_| None).unwrap_err();
    assert_eq!(err, ProtocolError::NotInCommittee);
}

#[test]
fn update_committees_dials_additions_and_drops_leavers() {
    let dialer = test_dialer(1, 1000);
    let members = committee();

    let dial = |_: &dpor_rs::types::Address| -> Option<Arc<dyn MsgReadWriter>> {
        let (ours, _theirs) = ChannelConn::pair();
        Some(ours as Arc<dyn MsgReadWriter>)
    };

    // Term 0: everyone but ourselves is dialed.
    dialer.update_committees(Term::new(0), &members, &members, &[], &[], &dial);
    assert_eq!(dialer.proposer_count(), 3);
    assert_eq!(dialer.validator_count(), 3);

    // Term 1 keeps only two members; the others are dropped.
    let kept = &members[1..3];
    dialer.update_committees(Term::new(1), kept, kept, &[], &[], &dial);
    assert_eq!(dialer.proposer_count(), 2);
    assert_eq!(dialer.validator_count(), 2);
    assert!(dialer.proposer(&members[3]).is_none());
}

#[test]
fn node_identity_is_published_encrypted_per_peer() {
    let dialer = test_dialer(1, 1000);
    let peer = keypair(2).address();

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
    let public_der = private_key.to_public_key().to_public_key_der().unwrap().as_bytes().to_vec();

    let registry = MemNodeRegistry::new();
    registry.keys.lock().unwrap().insert(peer, public_der);

    dialer.publish_node_identity(Term::new(2), &[peer], &registry).unwrap();

    let infos = registry.node_infos.lock().unwrap();
    assert_eq!(infos.len(), 1);
    let (term, to, ciphertext) = &infos[0];
    assert_eq!(*term, Term::new(2));
    assert_eq!(*to, peer);

    // Only the peer can read the enode identifier back.
    let plaintext = private_key.decrypt(Pkcs1v15Encrypt, ciphertext).unwrap();
    assert_eq!(plaintext, b"enode://1@127.0.0.1:30303");
}

#[test]
fn publishing_without_a_registered_key_fails() {
    let dialer = test_dialer(1, 1000);
    let registry = MemNodeRegistry::new();
    let err = dialer
        .publish_node_identity(Term::new(0), &[keypair(2).address()], &registry)
        .unwrap_err();
    assert_eq!(err, dpor_rs::errors::DialerError::NoPubkey);
}
