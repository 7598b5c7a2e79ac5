//! Long-lived identity keypair.
//!
//! An [`Identity`] is an Ed25519 signing keypair generated at first run or
//! per ephemeral session. The public key is what peers learn during the
//! handshake and what fingerprints are computed over; the private scalar
//! never leaves process memory and is zeroized on drop.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Long-lived Ed25519 identity.
///
/// Shared read-only (via `Arc`) between the peer manager, the handshake,
/// and fingerprinting. The inner signing key zeroizes its scalar when the
/// identity is dropped.
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generate a fresh identity from the OS random source.
    ///
    /// RNG failure is fatal: the process must not continue with a weak
    /// identity, so the error is [`Error::CryptoFatal`].
    pub fn generate() -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(seed.as_mut())
            .map_err(|e| Error::CryptoFatal(format!("OS RNG unavailable: {e}")))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
        })
    }

    /// Reconstruct an identity from a stored 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The 32 public key bytes.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Base64 encoding of the public key, as carried in the hello line.
    pub fn public_b64(&self) -> String {
        BASE64.encode(self.public_bytes())
    }

    /// The verifying half of the keypair.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Sign a message with the identity key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing.sign(msg)
    }

    /// Copy of the private seed, for persisting through the encrypted store.
    ///
    /// The returned buffer zeroizes itself when dropped.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

/// Verify an identity signature against raw public key bytes.
pub fn verify_signature(public: &[u8; 32], msg: &[u8], signature: &Signature) -> Result<()> {
    let key = VerifyingKey::from_bytes(public)
        .map_err(|_| Error::Protocol("invalid identity public key".into()))?;
    key.verify(msg, signature).map_err(|_| Error::AuthFail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_differ() {
        let a = Identity::generate().unwrap();
        let b = Identity::generate().unwrap();
        assert_ne!(a.public_bytes(), b.public_bytes());
    }

    #[test]
    fn test_public_b64_roundtrip() {
        let id = Identity::generate().unwrap();
        let decoded = BASE64.decode(id.public_b64()).unwrap();
        assert_eq!(decoded, id.public_bytes());
    }

    #[test]
    fn test_seed_reconstruction() {
        let id = Identity::generate().unwrap();
        let restored = Identity::from_seed(&id.seed());
        assert_eq!(id.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn test_sign_and_verify() {
        let id = Identity::generate().unwrap();
        let sig = id.sign(b"hello");
        verify_signature(&id.public_bytes(), b"hello", &sig).unwrap();
        assert!(verify_signature(&id.public_bytes(), b"other", &sig).is_err());
    }
}
