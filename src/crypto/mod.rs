//! Session cryptography.
//!
//! This module provides the primitives the peer session engine is built
//! from:
//! - X25519 ephemeral key agreement
//! - HKDF-SHA256 session-key derivation
//! - AES-256-GCM sealing/opening of frames
//! - direction-tagged monotonic nonces
//!
//! One ephemeral agreement per connection; the derived [`SessionKey`] is
//! single-use and zeroized when the channel goes away.

mod session;

pub use session::{
    open, seal, NonceSequence, SessionKey, DIR_INITIATOR, DIR_RESPONDER, NONCE_SIZE, TAG_SIZE,
};

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Generate a fresh X25519 keypair for one handshake.
///
/// RNG failure is fatal ([`Error::CryptoFatal`]): continuing with a
/// predictable ephemeral would silently break every session built on it.
pub fn generate_ephemeral() -> Result<(StaticSecret, PublicKey)> {
    let mut bytes = Zeroizing::new([0u8; 32]);
    OsRng
        .try_fill_bytes(bytes.as_mut())
        .map_err(|e| Error::CryptoFatal(format!("OS RNG unavailable: {e}")))?;
    let secret = StaticSecret::from(*bytes);
    let public = PublicKey::from(&secret);
    Ok((secret, public))
}

/// X25519 scalar multiplication, rejecting the all-zero output.
///
/// A zero shared secret means the peer sent a low-order point; deriving a
/// key from it would hand an active attacker a known session key, so the
/// agreement is refused.
pub fn agree(my_secret: StaticSecret, peer_public: &PublicKey) -> Result<Zeroizing<[u8; 32]>> {
    let shared = my_secret.diffie_hellman(peer_public);
    if shared.as_bytes() == &[0u8; 32] {
        return Err(Error::Protocol("non-contributory key agreement".into()));
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

/// Derive a 32-byte session key from a shared secret via HKDF-SHA256.
pub fn derive_session_key(shared: &[u8], info: &[u8], salt: &[u8]) -> SessionKey {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut key = [0u8; 32];
    hk.expand(info, &mut key)
        .expect("32 bytes is a valid HKDF output length");
    SessionKey::from(key)
}

/// Fill a fixed-size buffer from the OS random source.
pub fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::CryptoFatal(format!("OS RNG unavailable: {e}")))?;
    Ok(bytes)
}
