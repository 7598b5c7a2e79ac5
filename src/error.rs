//! Core error types.

use thiserror::Error;

/// Errors surfaced by the messenger core.
///
/// I/O and protocol errors on a peer channel are caught by the per-peer
/// tasks and translated into a disconnect event; storage errors surface to
/// the caller; [`Error::CryptoFatal`] means the process must not continue.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport read/write/connect failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed hello line or frame. The channel is closed and not retried.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// AEAD tag mismatch on a frame or a stored blob.
    #[error("authentication failed")]
    AuthFail,

    /// Storage operation attempted before `unlock`.
    #[error("storage is locked")]
    NotUnlocked,

    /// The send counter for a channel reached its limit.
    #[error("nonce space exhausted")]
    NonceExhausted,

    /// A dial or handshake deadline elapsed.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Operation on a channel after `close()`.
    #[error("channel closed")]
    Closed,

    /// The peer shut down the transport cleanly.
    #[error("end of stream")]
    EndOfStream,

    /// RNG or key generation failure. Not recoverable.
    #[error("fatal crypto failure: {0}")]
    CryptoFatal(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
