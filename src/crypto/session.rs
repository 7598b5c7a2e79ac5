//! Session keys, AEAD sealing, and nonce discipline.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// AEAD nonce size in bytes.
pub const NONCE_SIZE: usize = 12;

/// AEAD authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Direction tag for frames sent by the connection initiator.
pub const DIR_INITIATOR: [u8; 4] = *b"I2R\0";

/// Direction tag for frames sent by the connection responder.
pub const DIR_RESPONDER: [u8; 4] = *b"R2I\0";

/// A 32-byte symmetric session key.
///
/// Produced once per connection by key agreement + KDF, consumed by
/// exactly one channel, and zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl From<[u8; 32]> for SessionKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl SessionKey {
    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Overwrite the key material in place.
    pub fn wipe(&mut self) {
        self.0.zeroize();
    }

    /// True once [`SessionKey::wipe`] has run.
    pub fn is_wiped(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

/// Monotonic nonce source for one direction of one channel.
///
/// Nonces are `direction_tag(4) || counter(8, big-endian)`. The sender
/// advances its counter once per successful seal; the receiver rebuilds
/// the nonce it expects next from its own counter, so a replayed, dropped,
/// or reordered frame fails authentication instead of decrypting.
#[derive(Debug)]
pub struct NonceSequence {
    direction: [u8; 4],
    counter: u64,
}

impl NonceSequence {
    /// New sequence starting at zero for the given direction.
    pub fn new(direction: [u8; 4]) -> Self {
        Self {
            direction,
            counter: 0,
        }
    }

    /// The nonce for the next frame, without advancing.
    ///
    /// Returns [`Error::NonceExhausted`] once the counter reaches its
    /// final value; the channel must terminate rather than wrap.
    pub fn current(&self) -> Result<[u8; NONCE_SIZE]> {
        if self.counter == u64::MAX {
            return Err(Error::NonceExhausted);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&self.direction);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        Ok(nonce)
    }

    /// Advance to the next counter value after a successful seal or open.
    pub fn advance(&mut self) {
        self.counter += 1;
    }

    /// Frames processed so far in this direction.
    pub fn count(&self) -> u64 {
        self.counter
    }

    #[cfg(test)]
    pub(crate) fn with_counter(direction: [u8; 4], counter: u64) -> Self {
        Self { direction, counter }
    }
}

/// Encrypt `plaintext` under `key` with AES-256-GCM.
///
/// Returns `ciphertext || tag`. Never writes plaintext anywhere.
pub fn seal(
    key: &SessionKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::CryptoFatal(format!("invalid AEAD key: {e}")))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| Error::CryptoFatal("AEAD seal failed".into()))
}

/// Decrypt and authenticate `ciphertext || tag`.
///
/// Any mismatch in key, nonce, ciphertext, or AAD yields
/// [`Error::AuthFail`] and no plaintext.
pub fn open(
    key: &SessionKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| Error::CryptoFatal(format!("invalid AEAD key: {e}")))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| Error::AuthFail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> SessionKey {
        SessionKey::from([0x42u8; 32])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let nonce = [1u8; NONCE_SIZE];

        let sealed = seal(&key, &nonce, b"secret text", b"aad").unwrap();
        assert_eq!(sealed.len(), b"secret text".len() + TAG_SIZE);

        let opened = open(&key, &nonce, &sealed, b"aad").unwrap();
        assert_eq!(opened, b"secret text");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let nonce = [1u8; NONCE_SIZE];
        let mut sealed = seal(&key, &nonce, b"secret text", b"").unwrap();

        sealed[3] ^= 0x01;
        assert!(matches!(open(&key, &nonce, &sealed, b""), Err(Error::AuthFail)));
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let key = test_key();
        let sealed = seal(&key, &[1u8; NONCE_SIZE], b"payload", b"").unwrap();
        assert!(matches!(
            open(&key, &[2u8; NONCE_SIZE], &sealed, b""),
            Err(Error::AuthFail)
        ));
    }

    #[test]
    fn test_wrong_aad_fails() {
        let key = test_key();
        let nonce = [9u8; NONCE_SIZE];
        let sealed = seal(&key, &nonce, b"payload", b"right").unwrap();
        assert!(matches!(
            open(&key, &nonce, &sealed, b"wrong"),
            Err(Error::AuthFail)
        ));
    }

    #[test]
    fn test_nonce_sequence_layout() {
        let mut seq = NonceSequence::new(DIR_INITIATOR);
        let first = seq.current().unwrap();
        assert_eq!(&first[..4], &DIR_INITIATOR);
        assert_eq!(&first[4..], &0u64.to_be_bytes());

        seq.advance();
        let second = seq.current().unwrap();
        assert_eq!(&second[4..], &1u64.to_be_bytes());
        assert_ne!(first, second);
    }

    #[test]
    fn test_directions_never_collide() {
        let a = NonceSequence::new(DIR_INITIATOR).current().unwrap();
        let b = NonceSequence::new(DIR_RESPONDER).current().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_nonce_exhaustion() {
        let seq = NonceSequence::with_counter(DIR_INITIATOR, u64::MAX);
        assert!(matches!(seq.current(), Err(Error::NonceExhausted)));

        let near_end = NonceSequence::with_counter(DIR_INITIATOR, u64::MAX - 1);
        assert!(near_end.current().is_ok());
    }

    #[test]
    fn test_session_key_wipe() {
        let mut key = SessionKey::from([0xAA; 32]);
        assert!(!key.is_wiped());
        key.wipe();
        assert!(key.is_wiped());
        assert_eq!(key.as_bytes(), &[0u8; 32]);
    }
}
