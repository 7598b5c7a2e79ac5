//! Core configuration.
//!
//! Loaded from `<data_dir>/config.toml` when present; every field has a
//! default so a missing or partial file just works.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::overlay::{OverlayConfig, DEFAULT_HIDDEN_SERVICE_PORT};

/// Directory name under the home directory holding all local state.
pub const DATA_DIR_NAME: &str = ".cwtch";

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration for the messenger core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Root of all persisted state.
    pub data_dir: PathBuf,
    /// Local port the inbound listener binds.
    pub listen_port: u16,
    /// External virtual port of the hidden service.
    pub virtual_port: u16,
    /// Local SOCKS5 proxy of the anonymizing daemon.
    pub socks_addr: SocketAddr,
    /// Local control endpoint of the anonymizing daemon.
    pub control_addr: SocketAddr,
    /// Control cookie override; by default the daemon advertises the path.
    pub control_cookie: Option<PathBuf>,
    /// Run without the overlay; fabricate an address and stay local.
    pub offline_mode: bool,
    /// Sign the handshake transcript with the identity key and require
    /// the peer to do the same. Changes the hello wire format, so both
    /// sides must agree; off by default to match the plain protocol.
    pub sign_transcript: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            listen_port: DEFAULT_HIDDEN_SERVICE_PORT,
            virtual_port: DEFAULT_HIDDEN_SERVICE_PORT,
            socks_addr: ([127, 0, 0, 1], 9050).into(),
            control_addr: ([127, 0, 0, 1], 9051).into(),
            control_cookie: None,
            offline_mode: false,
            sign_transcript: false,
        }
    }
}

impl CoreConfig {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load_default() -> Result<Self> {
        let path = default_data_dir().join(CONFIG_FILE);
        Self::load(&path)
    }

    /// Load from a specific path; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Protocol(format!("bad config: {e}")))
    }

    /// Write the configuration under the data directory.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Protocol(format!("config serialization failed: {e}")))?;
        let path = self.data_dir.join(CONFIG_FILE);
        std::fs::write(&path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }
        Ok(())
    }

    /// The overlay supervisor's slice of this configuration.
    pub fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig {
            listen_port: self.listen_port,
            virtual_port: self.virtual_port,
            socks_addr: self.socks_addr,
            control_addr: self.control_addr,
            control_cookie: self.control_cookie.clone(),
            offline_mode: self.offline_mode,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DATA_DIR_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.listen_port, 9878);
        assert_eq!(config.virtual_port, 9878);
        assert_eq!(config.socks_addr.port(), 9050);
        assert!(!config.offline_mode);
        assert!(!config.sign_transcript);
        assert!(config.data_dir.ends_with(DATA_DIR_NAME));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = CoreConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.listen_port, 9878);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let config = CoreConfig {
            data_dir: dir.path().to_path_buf(),
            listen_port: 4321,
            offline_mode: true,
            ..CoreConfig::default()
        };
        config.save().unwrap();

        let loaded = CoreConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(loaded.listen_port, 4321);
        assert!(loaded.offline_mode);
        assert_eq!(loaded.virtual_port, 9878);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "listen_port = 1234\n").unwrap();

        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.listen_port, 1234);
        assert_eq!(config.virtual_port, 9878);
    }
}
