//! Peer wire protocol.
//!
//! Three layers, bottom up:
//! - [`framing`]: length-prefixed binary records and the inner
//!   `(type, payload)` codec
//! - [`handshake`]: the `CWTCH_HELLO` exchange that agrees a session key
//! - [`channel`]: the keyed frame channel everything rides on after the
//!   handshake

pub mod channel;
pub mod framing;
pub mod handshake;

pub use channel::{BoxedTransport, ChannelReceiver, ChannelSender, PeerChannel, Role, Transport};
pub use framing::{Frame, MAX_FRAME_LEN, TYPE_MSG};
pub use handshake::{Handshake, HandshakeOutcome, HandshakeState, HANDSHAKE_TIMEOUT};
