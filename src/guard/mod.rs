//! Privacy guard.
//!
//! Everything that stands between the plaintext and an observer with a
//! stopwatch, a packet capture, or the device itself:
//!
//! - message padding to hide length ([`padding`])
//! - send-time jitter against traffic analysis
//! - passphrase-locked at-rest encryption ([`storage`])
//! - secure wipe of buffers and panic destruction of all local state
//! - public-key fingerprints for out-of-band verification
//!   ([`fingerprint`])
//! - cover traffic and decoy files

pub mod fingerprint;
pub mod padding;
pub mod storage;

pub use fingerprint::{hex_fingerprint, word_fingerprint, WORD_ALPHABET};
pub use padding::{pad, unpad, PADDING_BLOCK_SIZE};
pub use storage::{EncryptedStore, PBKDF2_ITERATIONS};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tracing::info;
use zeroize::Zeroize;

use crate::crypto::random_bytes;
use crate::error::Result;

/// Lower bound of the send jitter, milliseconds.
pub const MIN_DELAY_MS: u64 = 100;

/// Upper bound (exclusive) of the send jitter, milliseconds.
pub const MAX_DELAY_MS: u64 = 3000;

/// Privacy guard: padding, jitter, encrypted storage, wipe, fingerprints.
///
/// Toggles are atomic so the guard can sit behind an `Arc` shared between
/// the send path, the receive path, and the application shell. The guard
/// exclusively owns its storage root and the key derived for it.
pub struct PrivacyGuard {
    store: EncryptedStore,
    burn_after_read: AtomicBool,
    ghost_mode: AtomicBool,
    message_padding: AtomicBool,
    traffic_scrambling: AtomicBool,
    paranoid_mode: AtomicBool,
}

impl PrivacyGuard {
    /// Guard over the given storage root. Padding starts enabled; every
    /// other toggle starts off.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: EncryptedStore::new(data_dir),
            burn_after_read: AtomicBool::new(false),
            ghost_mode: AtomicBool::new(false),
            message_padding: AtomicBool::new(true),
            traffic_scrambling: AtomicBool::new(false),
            paranoid_mode: AtomicBool::new(false),
        }
    }

    // ── message privacy ────────────────────────────────────────────────

    /// Pad an outgoing message if padding (or ghost mode) is on.
    pub fn pad_message(&self, message: &str) -> String {
        if self.is_message_padding() || self.is_ghost_mode() {
            pad(message)
        } else {
            message.to_string()
        }
    }

    /// Undo [`PrivacyGuard::pad_message`] on an incoming message.
    pub fn unpad_message(&self, message: &str) -> String {
        if self.is_message_padding() || self.is_ghost_mode() {
            unpad(message)
        } else {
            message.to_string()
        }
    }

    /// Jitter to sleep before transmitting a user message.
    ///
    /// Uniform in `[100, 3000)` ms while traffic scrambling is on,
    /// otherwise zero.
    pub fn random_delay(&self) -> Duration {
        if !self.is_traffic_scrambling() {
            return Duration::ZERO;
        }
        Duration::from_millis(OsRng.gen_range(MIN_DELAY_MS..MAX_DELAY_MS))
    }

    /// One block of random bytes, for callers that emit dummy traffic.
    pub fn cover_traffic(&self) -> Result<[u8; PADDING_BLOCK_SIZE]> {
        random_bytes::<PADDING_BLOCK_SIZE>()
    }

    /// Write plausible, innocuous files into `decoy_dir`.
    pub fn create_decoy(&self, decoy_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(decoy_dir)?;
        std::fs::write(
            decoy_dir.join("notes.txt"),
            "Shopping list:\n- Milk\n- Bread\n- Eggs\n",
        )?;
        std::fs::write(
            decoy_dir.join("todo.txt"),
            "TODO:\n- Call mom\n- Pay bills\n- Exercise\n",
        )?;
        Ok(())
    }

    // ── encrypted storage ──────────────────────────────────────────────

    /// Unlock the at-rest store. The passphrase buffer is wiped.
    pub fn unlock(&self, passphrase: &mut [u8]) -> Result<()> {
        self.store.unlock(passphrase)
    }

    /// Encrypt and persist a named blob. Requires an unlocked store.
    pub fn save(&self, name: &str, data: &[u8]) -> Result<()> {
        self.store.save(name, data)
    }

    /// Load and decrypt a named blob. Requires an unlocked store.
    pub fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.store.load(name)
    }

    /// Whether the store currently holds a key.
    pub fn is_unlocked(&self) -> bool {
        self.store.is_unlocked()
    }

    /// The storage root this guard owns.
    pub fn storage_root(&self) -> &Path {
        self.store.root()
    }

    /// Destroy all local state: zeroize the storage key, shred and unlink
    /// every file under the root, remove the directories. Best-effort and
    /// non-aborting; the store is locked afterwards.
    pub fn panic(&self) {
        info!("panic wipe triggered");
        self.store.panic();
    }

    // ── privacy modes ──────────────────────────────────────────────────

    /// Switch every privacy feature on at once.
    pub fn enable_paranoid_mode(&self) {
        self.paranoid_mode.store(true, Ordering::Relaxed);
        self.burn_after_read.store(true, Ordering::Relaxed);
        self.ghost_mode.store(true, Ordering::Relaxed);
        self.message_padding.store(true, Ordering::Relaxed);
        self.traffic_scrambling.store(true, Ordering::Relaxed);
    }

    /// Switch the enhanced features off. Padding stays on.
    pub fn disable_paranoid_mode(&self) {
        self.paranoid_mode.store(false, Ordering::Relaxed);
        self.burn_after_read.store(false, Ordering::Relaxed);
        self.ghost_mode.store(false, Ordering::Relaxed);
        self.traffic_scrambling.store(false, Ordering::Relaxed);
    }

    /// Whether messages should be dropped from display after reading.
    ///
    /// The core never retains message plaintext, so this flag is purely
    /// advisory for the shell rendering messages.
    pub fn is_burn_after_read(&self) -> bool {
        self.burn_after_read.load(Ordering::Relaxed)
    }

    /// Set the burn-after-read flag.
    pub fn set_burn_after_read(&self, enabled: bool) {
        self.burn_after_read.store(enabled, Ordering::Relaxed);
    }

    /// Whether presence indicators are suppressed.
    pub fn is_ghost_mode(&self) -> bool {
        self.ghost_mode.load(Ordering::Relaxed)
    }

    /// Set ghost mode. While on, padding is applied regardless of the
    /// padding toggle.
    pub fn set_ghost_mode(&self, enabled: bool) {
        self.ghost_mode.store(enabled, Ordering::Relaxed);
    }

    /// Whether message padding is on.
    pub fn is_message_padding(&self) -> bool {
        self.message_padding.load(Ordering::Relaxed)
    }

    /// Toggle message padding.
    pub fn set_message_padding(&self, enabled: bool) {
        self.message_padding.store(enabled, Ordering::Relaxed);
    }

    /// Whether send-time jitter is on.
    pub fn is_traffic_scrambling(&self) -> bool {
        self.traffic_scrambling.load(Ordering::Relaxed)
    }

    /// Toggle send-time jitter.
    pub fn set_traffic_scrambling(&self, enabled: bool) {
        self.traffic_scrambling.store(enabled, Ordering::Relaxed);
    }

    /// Whether paranoid mode was enabled.
    pub fn is_paranoid_mode(&self) -> bool {
        self.paranoid_mode.load(Ordering::Relaxed)
    }
}

/// Overwrite a byte buffer with random data, then zeros.
pub fn wipe_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
    buf.zeroize();
}

/// Overwrite a char buffer with NUL characters.
pub fn wipe_chars(buf: &mut [char]) {
    for c in buf.iter_mut() {
        *c = '\0';
    }
}
