//! End-to-end scenarios for the messenger core.
//!
//! Two in-process endpoints talk over in-memory duplex pipes: full
//! handshake, encrypted framing, padding, and the event queue, without a
//! network or a daemon.

use std::sync::Arc;

use cwtch_core::guard::{hex_fingerprint, word_fingerprint, PrivacyGuard, WORD_ALPHABET};
use cwtch_core::overlay::{OverlayConfig, OverlayService};
use cwtch_core::peers::{PeerEvent, PeerManager, PeerState};
use cwtch_core::protocol::channel::{PeerChannel, Role};
use cwtch_core::protocol::framing::TYPE_MSG;
use cwtch_core::{Error, Identity};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

fn offline_overlay() -> Arc<OverlayService> {
    Arc::new(OverlayService::new(OverlayConfig {
        listen_port: 0,
        offline_mode: true,
        ..OverlayConfig::default()
    }))
}

fn manager(dir: &std::path::Path) -> PeerManager {
    PeerManager::new(
        offline_overlay(),
        Arc::new(Identity::generate().unwrap()),
        Arc::new(PrivacyGuard::new(dir)),
        false,
    )
}

/// Scenario 1: two peers handshake over a duplex pipe, exchange "hello"
/// both ways, and both receiver loops deliver exactly the sent text.
#[tokio::test]
async fn handshake_then_echo() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let alice = manager(dir_a.path());
    let bob = manager(dir_b.path());

    let mut alice_events = alice.take_events().unwrap();
    let mut bob_events = bob.take_events().unwrap();

    let (a, b) = tokio::io::duplex(64 * 1024);
    let bob_task = tokio::spawn(async move {
        bob.attach_incoming(Box::new(b), "alice-inbound").await.unwrap();
        bob
    });
    alice
        .connect_transport("bob.onion", Box::new(a))
        .await
        .unwrap();
    let bob = bob_task.await.unwrap();

    // Both sides report the connection before any message.
    assert!(matches!(
        alice_events.recv().await.unwrap(),
        PeerEvent::ConnectionStatus { connected: true, .. }
    ));
    assert!(matches!(
        bob_events.recv().await.unwrap(),
        PeerEvent::ConnectionStatus { connected: true, .. }
    ));
    assert_eq!(alice.peer("bob.onion").unwrap().state, PeerState::Connected);

    assert!(alice.send("bob.onion", "hello").await);
    let echo_to = match bob_events.recv().await.unwrap() {
        PeerEvent::Message { address, text } => {
            assert_eq!(text, "hello");
            address
        }
        other => panic!("expected message, got {other:?}"),
    };

    assert!(bob.send(&echo_to, "hello").await);
    match alice_events.recv().await.unwrap() {
        PeerEvent::Message { text, .. } => assert_eq!(text, "hello"),
        other => panic!("expected message, got {other:?}"),
    }
}

/// The real accept path: one endpoint listens through its (offline)
/// overlay service, the other dials it over TCP, and the responder
/// handshake runs off the accept queue.
#[tokio::test]
async fn tcp_accept_path() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let overlay_a = offline_overlay();
    let alice = PeerManager::new(
        Arc::clone(&overlay_a),
        Arc::new(Identity::generate().unwrap()),
        Arc::new(PrivacyGuard::new(dir_a.path())),
        false,
    );
    let mut alice_events = alice.take_events().unwrap();

    overlay_a.start().await.unwrap();
    alice.start();

    let bob = manager(dir_b.path());
    let mut bob_events = bob.take_events().unwrap();

    let stream = tokio::net::TcpStream::connect(overlay_a.local_addr().unwrap())
        .await
        .unwrap();
    bob.connect_transport("alice.onion", Box::new(stream))
        .await
        .unwrap();

    assert!(matches!(
        bob_events.recv().await.unwrap(),
        PeerEvent::ConnectionStatus { connected: true, .. }
    ));
    let alice_saw = alice_events.recv().await.unwrap();
    let peer_addr = match alice_saw {
        PeerEvent::ConnectionStatus { address, connected: true } => address,
        other => panic!("expected connect event, got {other:?}"),
    };

    assert!(bob.send("alice.onion", "over tcp").await);
    match alice_events.recv().await.unwrap() {
        PeerEvent::Message { text, address } => {
            assert_eq!(text, "over tcp");
            assert_eq!(address, peer_addr);
        }
        other => panic!("expected message, got {other:?}"),
    }

    alice.shutdown().await;
    bob.shutdown().await;
    overlay_a.stop().await;
}

/// Scenario 2: with padding on, a 1-byte and a 200-byte message occupy
/// the same 256-byte block, so their transmitted lengths are identical.
#[test]
fn padding_hides_length() {
    let dir = tempfile::tempdir().unwrap();
    let guard = PrivacyGuard::new(dir.path());
    assert!(guard.is_message_padding());

    let short = guard.pad_message("a");
    let long = guard.pad_message(&"a".repeat(200));

    assert_eq!(short.len(), long.len());
    assert_eq!(BASE64.decode(&short).unwrap().len(), 256);
    assert_eq!(BASE64.decode(&long).unwrap().len(), 256);

    assert_eq!(guard.unpad_message(&short), "a");
    assert_eq!(guard.unpad_message(&long), "a".repeat(200));
}

/// Scenario 3: one flipped ciphertext bit makes `receive` fail
/// authentication; no plaintext surfaces.
#[tokio::test]
async fn tamper_detection() {
    use cwtch_core::crypto::SessionKey;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let key = SessionKey::from([0x5Au8; 32]);

    // Alice seals a frame; we capture the raw record off the wire.
    let (a, b) = tokio::io::duplex(4096);
    let mut alice = PeerChannel::new(Box::new(a), key.clone(), Role::Initiator);
    alice.send(TYPE_MSG, b"meet at midnight").await.unwrap();

    let (mut tap, _unused_write) = tokio::io::split(b);
    let mut len_bytes = [0u8; 4];
    tap.read_exact(&mut len_bytes).await.unwrap();
    let mut record = vec![0u8; u32::from_be_bytes(len_bytes) as usize];
    tap.read_exact(&mut record).await.unwrap();

    // Corrupt one bit and deliver it to Bob.
    record[7] ^= 0x01;
    let (mut wire, bob_side) = tokio::io::duplex(4096);
    wire.write_all(&len_bytes).await.unwrap();
    wire.write_all(&record).await.unwrap();

    let mut bob = PeerChannel::new(Box::new(bob_side), key, Role::Responder);
    assert!(matches!(bob.receive().await, Err(Error::AuthFail)));
}

/// Scenario 4: storage round-trips under the right passphrase and fails
/// authentication under the wrong one.
#[test]
fn storage_roundtrip_and_wrong_passphrase() {
    let dir = tempfile::tempdir().unwrap();

    let guard = PrivacyGuard::new(dir.path());
    let mut pass = b"pw".to_vec();
    guard.unlock(&mut pass).unwrap();
    guard.save("a.dat", &[0x01, 0x02, 0x03]).unwrap();
    assert_eq!(guard.load("a.dat").unwrap(), Some(vec![0x01, 0x02, 0x03]));

    let wrong = PrivacyGuard::new(dir.path());
    let mut pass = b"wrong".to_vec();
    wrong.unlock(&mut pass).unwrap();
    assert!(matches!(wrong.load("a.dat"), Err(Error::AuthFail)));
}

/// Scenario 5: after `panic()` no regular file survives under the storage
/// root and the store refuses further writes until unlocked again.
#[test]
fn panic_wipe() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");

    let guard = PrivacyGuard::new(&root);
    let mut pass = b"pw".to_vec();
    guard.unlock(&mut pass).unwrap();
    for name in ["one.dat", "two.dat", "three.dat"] {
        guard.save(name, b"contents").unwrap();
    }

    guard.panic();

    assert!(!guard.is_unlocked());
    assert!(matches!(guard.save("late.dat", b"x"), Err(Error::NotUnlocked)));
    assert!(count_files(&root) == 0, "files survived the wipe");
}

fn count_files(dir: &std::path::Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

/// Scenario 6: fingerprint formats and determinism.
#[test]
fn fingerprint_formats() {
    let identity = Identity::generate().unwrap();
    let key = identity.public_bytes();

    let hex = hex_fingerprint(&key);
    let groups: Vec<&str> = hex.split('-').collect();
    assert_eq!(groups.len(), 5);
    for group in &groups {
        assert_eq!(group.len(), 4);
        assert!(group
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    let words = word_fingerprint(&key);
    let tokens: Vec<&str> = words.split(' ').collect();
    assert_eq!(tokens.len(), 6);
    for token in &tokens {
        assert!(WORD_ALPHABET.contains(token));
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    assert_eq!(hex, hex_fingerprint(&key));
    assert_eq!(words, word_fingerprint(&key));
}

/// Traffic jitter stays inside its bounds and collapses to zero when off.
#[test]
fn delay_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let guard = PrivacyGuard::new(dir.path());

    assert!(guard.random_delay().is_zero());

    guard.set_traffic_scrambling(true);
    for _ in 0..100 {
        let ms = guard.random_delay().as_millis();
        assert!((100..3000).contains(&ms));
    }
}
