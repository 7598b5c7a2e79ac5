//! Session handshake.
//!
//! One newline-terminated ASCII line in each direction, before any
//! encryption:
//!
//! ```text
//! CWTCH_HELLO:<base64(ephemeral_pub)>:<base64(identity_pub)>
//! ```
//!
//! Each side contributes a fresh X25519 ephemeral; the shared secret runs
//! through HKDF-SHA256 to produce the session key, and both roles derive
//! byte-identical keys.
//!
//! The long-lived identity key rides along in the hello but, by default,
//! signs nothing: an active man-in-the-middle can swap ephemerals unless
//! users compare fingerprints out-of-band. The identity key is surfaced in
//! [`HandshakeOutcome`] precisely so callers can do that. Enabling
//! `sign_transcript` appends a fourth field carrying an Ed25519 signature
//! over `ephemeral_pub || identity_pub` and requires the same of the peer;
//! it is an explicit opt-in, never switched on silently, because it changes
//! the wire format.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::Signature;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use x25519_dalek::PublicKey;

use crate::crypto::{agree, derive_session_key, generate_ephemeral};
use crate::error::{Error, Result};
use crate::identity::{verify_signature, Identity};
use crate::protocol::channel::{BoxedTransport, PeerChannel, Role};

/// Leading token of every hello line.
pub const HELLO_PREFIX: &str = "CWTCH_HELLO";

/// HKDF info string for session-key derivation.
pub const SESSION_INFO: &[u8] = b"cwtch-session";

/// HKDF salt for session-key derivation.
pub const HANDSHAKE_SALT: &[u8] = b"handshake-salt";

/// End-to-end deadline for either side of the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a hello line; anything longer is not a peer.
const MAX_HELLO_LEN: usize = 512;

/// Progress of one handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent or received yet.
    Start,
    /// Initiator wrote its hello and is waiting for the peer's.
    SentHello,
    /// Responder is waiting for the initiator's hello.
    AwaitingHello,
    /// Both hellos exchanged, session key derived.
    DerivedKey,
    /// Channel established.
    Handshaken,
    /// The attempt failed; the socket is gone and no channel exists.
    Failed,
}

/// Result of a completed handshake.
pub struct HandshakeOutcome {
    /// The keyed, ready-to-use channel.
    pub channel: PeerChannel,
    /// The peer's long-lived identity public key, for out-of-band
    /// fingerprint verification.
    pub peer_identity: [u8; 32],
}

/// One handshake attempt, initiator or responder.
pub struct Handshake {
    identity: Arc<Identity>,
    sign_transcript: bool,
    state: HandshakeState,
}

impl Handshake {
    /// New handshake bound to the local identity.
    pub fn new(identity: Arc<Identity>, sign_transcript: bool) -> Self {
        Self {
            identity,
            sign_transcript,
            state: HandshakeState::Start,
        }
    }

    /// Current state, mostly useful after a failure.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run the initiator side: send our hello, read theirs, derive.
    ///
    /// Consumes the transport; on any failure the socket is dropped and no
    /// channel is ever returned.
    pub async fn initiate(&mut self, transport: BoxedTransport) -> Result<HandshakeOutcome> {
        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.run_initiator(transport)).await;
        self.conclude(result)
    }

    /// Run the responder side: read their hello, send ours, derive.
    pub async fn respond(&mut self, transport: BoxedTransport) -> Result<HandshakeOutcome> {
        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.run_responder(transport)).await;
        self.conclude(result)
    }

    fn conclude(
        &mut self,
        result: std::result::Result<Result<HandshakeOutcome>, tokio::time::error::Elapsed>,
    ) -> Result<HandshakeOutcome> {
        match result {
            Ok(Ok(outcome)) => {
                self.state = HandshakeState::Handshaken;
                Ok(outcome)
            }
            Ok(Err(e)) => {
                self.state = HandshakeState::Failed;
                Err(e)
            }
            Err(_) => {
                self.state = HandshakeState::Failed;
                Err(Error::Timeout("handshake"))
            }
        }
    }

    async fn run_initiator(&mut self, mut transport: BoxedTransport) -> Result<HandshakeOutcome> {
        let (my_secret, my_public) = generate_ephemeral()?;

        let hello = self.encode_hello(&my_public);
        transport.write_all(hello.as_bytes()).await?;
        transport.flush().await?;
        self.state = HandshakeState::SentHello;

        let line = read_hello_line(&mut transport).await?;
        let peer = parse_hello(&line, self.sign_transcript)?;

        let shared = agree(my_secret, &peer.ephemeral)?;
        let key = derive_session_key(shared.as_ref(), SESSION_INFO, HANDSHAKE_SALT);
        self.state = HandshakeState::DerivedKey;

        Ok(HandshakeOutcome {
            channel: PeerChannel::new(transport, key, Role::Initiator),
            peer_identity: peer.identity,
        })
    }

    async fn run_responder(&mut self, mut transport: BoxedTransport) -> Result<HandshakeOutcome> {
        self.state = HandshakeState::AwaitingHello;
        let line = read_hello_line(&mut transport).await?;
        let peer = parse_hello(&line, self.sign_transcript)?;

        let (my_secret, my_public) = generate_ephemeral()?;
        let hello = self.encode_hello(&my_public);
        transport.write_all(hello.as_bytes()).await?;
        transport.flush().await?;

        let shared = agree(my_secret, &peer.ephemeral)?;
        let key = derive_session_key(shared.as_ref(), SESSION_INFO, HANDSHAKE_SALT);
        self.state = HandshakeState::DerivedKey;

        Ok(HandshakeOutcome {
            channel: PeerChannel::new(transport, key, Role::Responder),
            peer_identity: peer.identity,
        })
    }

    fn encode_hello(&self, ephemeral: &PublicKey) -> String {
        let eph_b64 = BASE64.encode(ephemeral.as_bytes());
        let id_b64 = self.identity.public_b64();
        if self.sign_transcript {
            let mut transcript = Vec::with_capacity(64);
            transcript.extend_from_slice(ephemeral.as_bytes());
            transcript.extend_from_slice(&self.identity.public_bytes());
            let sig = self.identity.sign(&transcript);
            format!(
                "{HELLO_PREFIX}:{eph_b64}:{id_b64}:{}\n",
                BASE64.encode(sig.to_bytes())
            )
        } else {
            format!("{HELLO_PREFIX}:{eph_b64}:{id_b64}\n")
        }
    }
}

/// The fields of a validated hello line.
struct PeerHello {
    ephemeral: PublicKey,
    identity: [u8; 32],
}

/// Read one newline-terminated line, one byte at a time.
///
/// Byte-at-a-time keeps us from buffering past the newline: the peer may
/// pipeline its first encrypted frame right behind the hello, and those
/// bytes belong to the channel, not to us.
async fn read_hello_line(transport: &mut BoxedTransport) -> Result<String> {
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        if let Err(e) = transport.read_exact(&mut byte).await {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    Error::Protocol("connection closed during handshake".into())
                }
                _ => Error::Io(e),
            });
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_HELLO_LEN {
            return Err(Error::Protocol("hello line too long".into()));
        }
        line.push(byte[0]);
    }

    String::from_utf8(line).map_err(|_| Error::Protocol("hello is not ASCII".into()))
}

/// Validate prefix and field count, then decode the peer's keys.
fn parse_hello(line: &str, require_signature: bool) -> Result<PeerHello> {
    let parts: Vec<&str> = line.trim_end_matches('\r').split(':').collect();

    let expected_fields = if require_signature { 4 } else { 3 };
    if parts.len() != expected_fields {
        return Err(Error::Protocol(format!(
            "hello has {} fields, expected {expected_fields}",
            parts.len()
        )));
    }
    if parts[0] != HELLO_PREFIX {
        return Err(Error::Protocol("missing hello prefix".into()));
    }

    let ephemeral_bytes = decode_key_field(parts[1], "ephemeral key")?;
    let identity = decode_key_field(parts[2], "identity key")?;

    if require_signature {
        let sig_bytes = BASE64
            .decode(parts[3])
            .map_err(|_| Error::Protocol("signature is not base64".into()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| Error::Protocol("malformed signature".into()))?;

        let mut transcript = Vec::with_capacity(64);
        transcript.extend_from_slice(&ephemeral_bytes);
        transcript.extend_from_slice(&identity);
        verify_signature(&identity, &transcript, &signature)?;
    }

    Ok(PeerHello {
        ephemeral: PublicKey::from(ephemeral_bytes),
        identity,
    })
}

fn decode_key_field(field: &str, what: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(field)
        .map_err(|_| Error::Protocol(format!("{what} is not base64")))?;
    if bytes.len() != 32 {
        return Err(Error::Protocol(format!(
            "{what} has {} bytes, expected 32",
            bytes.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::framing::TYPE_MSG;

    fn identity() -> Arc<Identity> {
        Arc::new(Identity::generate().unwrap())
    }

    async fn handshake_pair(
        sign: bool,
    ) -> (HandshakeOutcome, HandshakeOutcome, Arc<Identity>, Arc<Identity>) {
        let alice_id = identity();
        let bob_id = identity();
        let (a, b) = tokio::io::duplex(4096);

        let alice_task = {
            let id = Arc::clone(&alice_id);
            tokio::spawn(async move { Handshake::new(id, sign).initiate(Box::new(a)).await })
        };
        let bob_outcome = Handshake::new(Arc::clone(&bob_id), sign)
            .respond(Box::new(b))
            .await
            .unwrap();
        let alice_outcome = alice_task.await.unwrap().unwrap();

        (alice_outcome, bob_outcome, alice_id, bob_id)
    }

    #[tokio::test]
    async fn test_handshake_yields_working_channel() {
        let (mut alice, mut bob, alice_id, bob_id) = handshake_pair(false).await;

        assert_eq!(alice.peer_identity, bob_id.public_bytes());
        assert_eq!(bob.peer_identity, alice_id.public_bytes());

        // Byte-identical session keys: a frame sealed by one side opens on
        // the other, in both directions.
        alice.channel.send(TYPE_MSG, b"hello").await.unwrap();
        assert_eq!(bob.channel.receive().await.unwrap().payload, b"hello");

        bob.channel.send(TYPE_MSG, b"hello yourself").await.unwrap();
        assert_eq!(
            alice.channel.receive().await.unwrap().payload,
            b"hello yourself"
        );
    }

    #[tokio::test]
    async fn test_signed_handshake_roundtrip() {
        let (mut alice, mut bob, _, _) = handshake_pair(true).await;

        alice.channel.send(TYPE_MSG, b"signed").await.unwrap();
        assert_eq!(bob.channel.receive().await.unwrap().payload, b"signed");
    }

    #[tokio::test]
    async fn test_malformed_hello_fails() {
        let (mut a, b) = tokio::io::duplex(4096);

        let responder = tokio::spawn(async move {
            let mut hs = Handshake::new(identity(), false);
            let result = hs.respond(Box::new(b)).await;
            (result.is_err(), hs.state())
        });

        a.write_all(b"GET / HTTP/1.1\n").await.unwrap();
        let (failed, state) = responder.await.unwrap();
        assert!(failed);
        assert_eq!(state, HandshakeState::Failed);
    }

    #[tokio::test]
    async fn test_wrong_field_count_fails() {
        let (mut a, b) = tokio::io::duplex(4096);

        let responder = tokio::spawn(async move {
            Handshake::new(identity(), false).respond(Box::new(b)).await
        });

        a.write_all(b"CWTCH_HELLO:onlyonefield\n").await.unwrap();
        assert!(matches!(
            responder.await.unwrap(),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_key_length_fails() {
        let (mut a, b) = tokio::io::duplex(4096);

        let responder = tokio::spawn(async move {
            Handshake::new(identity(), false).respond(Box::new(b)).await
        });

        let short = BASE64.encode([0u8; 16]);
        a.write_all(format!("CWTCH_HELLO:{short}:{short}\n").as_bytes())
            .await
            .unwrap();
        assert!(matches!(responder.await.unwrap(), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_signature_required_when_enabled() {
        let (a, b) = tokio::io::duplex(4096);

        // Alice does not sign; Bob demands a signature.
        let alice = tokio::spawn(async move {
            Handshake::new(identity(), false).initiate(Box::new(a)).await
        });
        let bob = Handshake::new(identity(), true).respond(Box::new(b)).await;

        assert!(matches!(bob, Err(Error::Protocol(_))));
        let _ = alice.await;
    }

    #[tokio::test]
    async fn test_parse_hello_rejects_garbage_base64() {
        assert!(matches!(
            parse_hello("CWTCH_HELLO:!!!:???", false),
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_disconnect_mid_handshake_fails() {
        let (a, b) = tokio::io::duplex(4096);
        drop(a);

        let mut hs = Handshake::new(identity(), false);
        assert!(hs.respond(Box::new(b)).await.is_err());
        assert_eq!(hs.state(), HandshakeState::Failed);
    }
}
