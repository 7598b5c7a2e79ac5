//! Passphrase-locked at-rest storage.
//!
//! Blobs live under a single storage root as `iv(12) || ciphertext ||
//! tag(16)` files, encrypted with AES-256-GCM under a key derived from the
//! user's passphrase via PBKDF2-HMAC-SHA256. A hidden `.salt` sibling
//! (32 random bytes) parameterizes the derivation. `panic()` destroys the
//! whole root and relocks the store.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::Sha256;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::random_bytes;
use crate::error::{Error, Result};
use crate::guard::wipe_bytes;

/// PBKDF2 iteration count for the storage key.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt file length in bytes.
const SALT_LEN: usize = 32;

/// AES-GCM IV length in bytes.
const IV_LEN: usize = 12;

/// AES-GCM tag length in bytes.
const TAG_LEN: usize = 16;

/// Name of the hidden salt file inside the storage root.
const SALT_FILE: &str = ".salt";

/// Derived storage key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct StorageKey([u8; 32]);

/// Encrypted file store rooted at one directory.
///
/// The store exclusively owns its root and derived key. All operations
/// other than [`EncryptedStore::unlock`] fail with [`Error::NotUnlocked`]
/// until a passphrase has been supplied.
pub struct EncryptedStore {
    root: PathBuf,
    key: Mutex<Option<StorageKey>>,
}

impl EncryptedStore {
    /// Create a store over `root`. Nothing touches the filesystem until
    /// `unlock`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key: Mutex::new(None),
        }
    }

    /// The directory this store owns.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a storage key is currently held.
    pub fn is_unlocked(&self) -> bool {
        self.key.lock().expect("storage key lock poisoned").is_some()
    }

    /// Derive and hold the storage key from a passphrase.
    ///
    /// Reads the salt file, creating and persisting it on first use. The
    /// passphrase buffer is wiped before this returns, success or not.
    pub fn unlock(&self, passphrase: &mut [u8]) -> Result<()> {
        let result = self.derive_key(passphrase);
        wipe_bytes(passphrase);
        let key = result?;
        *self.key.lock().expect("storage key lock poisoned") = Some(key);
        Ok(())
    }

    fn derive_key(&self, passphrase: &[u8]) -> Result<StorageKey> {
        fs::create_dir_all(&self.root)?;
        let salt = self.load_or_create_salt()?;

        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, &salt, PBKDF2_ITERATIONS, &mut key);
        Ok(StorageKey(key))
    }

    fn load_or_create_salt(&self) -> Result<[u8; SALT_LEN]> {
        let path = self.root.join(SALT_FILE);
        if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.len() != SALT_LEN {
                return Err(Error::Protocol(format!(
                    "salt file has {} bytes, expected {SALT_LEN}",
                    bytes.len()
                )));
            }
            let mut salt = [0u8; SALT_LEN];
            salt.copy_from_slice(&bytes);
            return Ok(salt);
        }

        let salt = random_bytes::<SALT_LEN>()?;
        fs::write(&path, salt)?;
        restrict_permissions(&path);
        Ok(salt)
    }

    /// Encrypt `data` with a fresh random IV and persist it as `name`.
    pub fn save(&self, name: &str, data: &[u8]) -> Result<()> {
        let guard = self.key.lock().expect("storage key lock poisoned");
        let key = guard.as_ref().ok_or(Error::NotUnlocked)?;

        let iv = random_bytes::<IV_LEN>()?;
        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|e| Error::CryptoFatal(format!("invalid storage key: {e}")))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), data)
            .map_err(|_| Error::CryptoFatal("storage seal failed".into()))?;

        fs::create_dir_all(&self.root)?;
        let path = self.root.join(name);
        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        fs::write(&path, blob)?;
        restrict_permissions(&path);
        Ok(())
    }

    /// Load and decrypt `name`.
    ///
    /// A missing file is `Ok(None)`; a bad tag (wrong passphrase or
    /// tampered file) is [`Error::AuthFail`] and leaves the store usable.
    pub fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.key.lock().expect("storage key lock poisoned");
        let key = guard.as_ref().ok_or(Error::NotUnlocked)?;

        let path = self.root.join(name);
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };

        if blob.len() < IV_LEN + TAG_LEN {
            return Err(Error::AuthFail);
        }

        let cipher = Aes256Gcm::new_from_slice(&key.0)
            .map_err(|e| Error::CryptoFatal(format!("invalid storage key: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&blob[..IV_LEN]), &blob[IV_LEN..])
            .map_err(|_| Error::AuthFail)?;
        Ok(Some(plaintext))
    }

    /// Drop the storage key, relocking the store.
    pub fn lock(&self) {
        *self.key.lock().expect("storage key lock poisoned") = None;
    }

    /// Destroy all stored state, best-effort.
    ///
    /// The key is zeroized first, then every regular file under the root
    /// is overwritten three times (zeros, ones, random) and unlinked,
    /// bottom-up, directories last. Individual failures fall back to a
    /// plain unlink and never abort the walk. The store is locked after.
    pub fn panic(&self) {
        self.lock();

        if self.root.exists() {
            destroy_tree(&self.root);
        }
        debug!(root = %self.root.display(), "storage root destroyed");
    }
}

/// Recursively destroy a directory tree, children before parents.
fn destroy_tree(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "cannot list directory during wipe: {e}");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            destroy_tree(&path);
        } else if let Err(e) = shred_file(&path) {
            warn!(file = %path.display(), "secure delete failed, unlinking: {e}");
            let _ = fs::remove_file(&path);
        }
    }

    if let Err(e) = fs::remove_dir(dir) {
        warn!(dir = %dir.display(), "cannot remove directory: {e}");
    }
}

/// Overwrite a file's full length three times, then unlink it.
fn shred_file(path: &Path) -> Result<()> {
    let len = fs::metadata(path)?.len() as usize;

    for pass in 0..3u8 {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let mut remaining = len;
        let mut chunk = vec![0u8; remaining.min(64 * 1024)];
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            match pass {
                0 => chunk[..n].fill(0x00),
                1 => chunk[..n].fill(0xFF),
                _ => chunk[..n].copy_from_slice(&random_chunk(n)?),
            }
            file.write_all(&chunk[..n])?;
            remaining -= n;
        }
        file.sync_all()?;
    }

    fs::remove_file(path)?;
    Ok(())
}

fn random_chunk(n: usize) -> Result<Vec<u8>> {
    use rand::RngCore;
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::CryptoFatal(format!("OS RNG unavailable: {e}")))?;
    Ok(buf)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
