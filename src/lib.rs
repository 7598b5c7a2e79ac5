//! # cwtch-core
//!
//! Core engine for an anonymous peer-to-peer messenger. Peers are
//! identified by self-generated onion addresses and reached over an
//! anonymizing overlay network; the daemon providing that network is an
//! external process exposing a local SOCKS5 proxy and control endpoint.
//!
//! ## Overview
//!
//! - [`identity`]: long-lived Ed25519 keypair with a stable fingerprint
//! - [`crypto`]: X25519 agreement, HKDF key derivation, AES-256-GCM
//!   framing with direction-tagged monotonic nonces
//! - [`protocol`]: the `CWTCH_HELLO` handshake, the length-prefixed frame
//!   codec, and the encrypted [`protocol::PeerChannel`]
//! - [`guard`]: message padding, send jitter, passphrase-locked storage,
//!   secure wipe and panic destruction, fingerprints
//! - [`peers`]: the roster, per-peer connection lifecycle, and the event
//!   queue the application drains
//! - [`overlay`]: hidden-service supervision, SOCKS5 dialing, offline
//!   simulation
//!
//! ## Security model
//!
//! - Every frame is sealed with AES-256-GCM; plaintext never touches a
//!   socket. Nonces are direction-tagged counters, so replays and
//!   reordering fail authentication.
//! - One ephemeral X25519 agreement per connection. By default the
//!   identity key in the hello is **not** verified against anything, so
//!   fingerprints must be compared out-of-band, or transcript signing
//!   enabled on both ends.
//! - Session keys, the storage key, and the identity scalar are zeroized
//!   when their owner goes away; `panic()` shreds all on-disk state.
//!
//! ## Wiring it together
//!
//! ```no_run
//! use std::sync::Arc;
//! use cwtch_core::{
//!     CoreConfig, Identity, OverlayService, PeerEvent, PeerManager, PrivacyGuard,
//! };
//!
//! # async fn run() -> cwtch_core::Result<()> {
//! let config = CoreConfig::load_default()?;
//! let identity = Arc::new(Identity::generate()?);
//! let guard = Arc::new(PrivacyGuard::new(config.data_dir.clone()));
//! let overlay = Arc::new(OverlayService::new(config.overlay_config()));
//!
//! let manager = PeerManager::new(
//!     Arc::clone(&overlay),
//!     Arc::clone(&identity),
//!     Arc::clone(&guard),
//!     config.sign_transcript,
//! );
//! let mut events = manager.take_events().expect("events taken once");
//!
//! overlay.start().await?;
//! manager.start();
//!
//! manager.add("examplepeeraddress.onion", Some("friend"));
//! manager.connect("examplepeeraddress.onion").await?;
//! manager.send("examplepeeraddress.onion", "hello").await;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         PeerEvent::Message { address, text } => println!("<{address}> {text}"),
//!         PeerEvent::ConnectionStatus { address, connected } => {
//!             println!("{address} connected={connected}");
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod identity;
pub mod overlay;
pub mod peers;
pub mod protocol;

pub use config::CoreConfig;
pub use error::{Error, Result};
pub use guard::PrivacyGuard;
pub use identity::Identity;
pub use overlay::{OverlayService, OverlayStatus};
pub use peers::{PeerEvent, PeerInfo, PeerManager, PeerState};
pub use protocol::{Frame, PeerChannel};
