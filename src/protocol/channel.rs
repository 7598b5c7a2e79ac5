//! Encrypted peer channel.
//!
//! A [`PeerChannel`] owns exactly one bidirectional byte transport and one
//! session key. Every frame is sealed with the next send nonce before it
//! touches the transport; no plaintext is ever written. The receive side
//! rebuilds the nonce it expects from its own counter, so replays and gaps
//! fail authentication instead of decrypting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Notify;

use crate::crypto::{
    open, seal, NonceSequence, SessionKey, DIR_INITIATOR, DIR_RESPONDER,
};
use crate::error::{Error, Result};
use crate::protocol::framing::{read_record, write_record, Frame};

/// Object-safe byte transport: a TCP stream, a SOCKS-proxied stream, or an
/// in-memory duplex pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Boxed transport as produced by the overlay dialer and listener.
pub type BoxedTransport = Box<dyn Transport>;

/// Which side of the handshake this endpoint was.
///
/// Determines the direction tags of the send and receive nonce sequences;
/// the two directions of a channel never share a nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This endpoint dialed and spoke first.
    Initiator,
    /// This endpoint accepted the connection.
    Responder,
}

impl Role {
    fn send_direction(self) -> [u8; 4] {
        match self {
            Role::Initiator => DIR_INITIATOR,
            Role::Responder => DIR_RESPONDER,
        }
    }

    fn recv_direction(self) -> [u8; 4] {
        match self {
            Role::Initiator => DIR_RESPONDER,
            Role::Responder => DIR_INITIATOR,
        }
    }
}

/// Close state shared between the two halves of a split channel.
///
/// `close()` flips the flag and wakes the notify, so a receiver task
/// blocked in `receive()` observes the close within one queued read.
#[derive(Debug, Default)]
struct CloseFlag {
    closed: AtomicBool,
    notify: Notify,
}

impl CloseFlag {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // notify_one stores a permit, so the single receiver half cannot
        // miss a close that lands before it starts waiting.
        self.notify.notify_one();
    }
}

/// An encrypted, strictly ordered frame channel over one transport.
pub struct PeerChannel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl PeerChannel {
    /// Wrap a keyed transport. Callers obtain the key via the handshake;
    /// the channel takes sole ownership of both.
    pub fn new(transport: BoxedTransport, key: SessionKey, role: Role) -> Self {
        let (reader, writer) = tokio::io::split(transport);
        let flag = Arc::new(CloseFlag::default());

        Self {
            sender: ChannelSender {
                writer,
                key: key.clone(),
                nonces: NonceSequence::new(role.send_direction()),
                flag: Arc::clone(&flag),
            },
            receiver: ChannelReceiver {
                reader,
                key,
                nonces: NonceSequence::new(role.recv_direction()),
                flag,
            },
        }
    }

    /// Seal and write exactly one frame.
    pub async fn send(&mut self, frame_type: &str, payload: &[u8]) -> Result<()> {
        self.sender.send(frame_type, payload).await
    }

    /// Read, authenticate, and decode the next frame.
    pub async fn receive(&mut self) -> Result<Frame> {
        self.receiver.receive().await
    }

    /// Zeroize the session key and shut the transport down.
    ///
    /// The key bytes are zero before this returns; all subsequent calls on
    /// the channel yield [`Error::Closed`].
    pub async fn close(&mut self) -> Result<()> {
        self.receiver.key.wipe();
        self.sender.close().await
    }

    /// Split into independently owned halves so a dedicated task can block
    /// on `receive()` while callers keep sending.
    pub fn into_split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a channel. Owns the write side of the transport.
pub struct ChannelSender {
    writer: WriteHalf<BoxedTransport>,
    key: SessionKey,
    nonces: NonceSequence,
    flag: Arc<CloseFlag>,
}

impl ChannelSender {
    /// Seal and write exactly one frame.
    pub async fn send(&mut self, frame_type: &str, payload: &[u8]) -> Result<()> {
        if self.flag.is_closed() {
            return Err(Error::Closed);
        }

        let nonce = self.nonces.current()?;
        let inner = Frame::new(frame_type, payload.to_vec()).encode_inner()?;
        let sealed = seal(&self.key, &nonce, &inner, &[])?;
        write_record(&mut self.writer, &sealed).await?;
        // Only count frames that made it to the transport.
        self.nonces.advance();
        Ok(())
    }

    /// Zeroize the key, mark the channel closed, and shut down the write
    /// side. The paired receiver wakes out of its blocking read.
    pub async fn close(&mut self) -> Result<()> {
        self.key.wipe();
        if self.flag.is_closed() {
            return Ok(());
        }
        self.flag.close();
        // The peer sees EOF; our own receiver is woken via the flag.
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Frames sent so far.
    pub fn sent(&self) -> u64 {
        self.nonces.count()
    }
}

/// Receiving half of a channel. Owns the read side of the transport.
pub struct ChannelReceiver {
    reader: ReadHalf<BoxedTransport>,
    key: SessionKey,
    nonces: NonceSequence,
    flag: Arc<CloseFlag>,
}

impl ChannelReceiver {
    /// Read, authenticate, and decode the next frame.
    ///
    /// Returns [`Error::Closed`] as soon as the paired sender closed,
    /// [`Error::EndOfStream`] when the peer shut down cleanly, and
    /// [`Error::AuthFail`] on any tag mismatch (including replays and
    /// reordered frames, which arrive under the wrong expected nonce).
    pub async fn receive(&mut self) -> Result<Frame> {
        // Register for the close wakeup before re-checking the flag, so a
        // close that lands in between is never missed.
        let notified = self.flag.notify.notified();
        if self.flag.is_closed() {
            return Err(Error::Closed);
        }

        let sealed = tokio::select! {
            _ = notified => return Err(Error::Closed),
            read = read_record(&mut self.reader) => read?,
        };

        let nonce = self.nonces.current()?;
        let inner = open(&self.key, &nonce, &sealed, &[])?;
        let frame = Frame::decode_inner(&inner)?;
        self.nonces.advance();
        Ok(frame)
    }

    /// Frames accepted so far.
    pub fn received(&self) -> u64 {
        self.nonces.count()
    }
}
