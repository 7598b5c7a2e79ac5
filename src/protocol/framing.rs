//! Binary frame codec.
//!
//! Wire layout of one record, outside encryption:
//!
//! ```text
//! u32 length (big-endian, bytes of ciphertext || tag)
//! bytes      (AEAD ciphertext)
//! ```
//!
//! Inner plaintext, inside the AEAD envelope:
//!
//! ```text
//! u16 type_len | type (UTF-8) | u32 payload_len | payload
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound on one encrypted record. Oversize closes the channel.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Frame type carrying a UTF-8 chat message.
pub const TYPE_MSG: &str = "MSG";

/// A typed record exchanged over a peer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Short type tag, e.g. [`TYPE_MSG`].
    pub frame_type: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from a type tag and payload.
    pub fn new(frame_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
        }
    }

    /// Build a `MSG` frame from text.
    pub fn message(text: &str) -> Self {
        Self::new(TYPE_MSG, text.as_bytes().to_vec())
    }

    /// Payload interpreted as UTF-8.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| Error::Protocol("frame payload is not UTF-8".into()))
    }

    /// Serialize the inner plaintext record.
    pub fn encode_inner(&self) -> Result<Vec<u8>> {
        let type_bytes = self.frame_type.as_bytes();
        if type_bytes.len() > u16::MAX as usize {
            return Err(Error::Protocol("frame type too long".into()));
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(Error::Protocol("frame payload too long".into()));
        }

        let mut buf = Vec::with_capacity(2 + type_bytes.len() + 4 + self.payload.len());
        buf.extend_from_slice(&(type_bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(type_bytes);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse the inner plaintext record.
    pub fn decode_inner(bytes: &[u8]) -> Result<Self> {
        let malformed = |what: &str| Error::Protocol(format!("malformed frame: {what}"));

        if bytes.len() < 2 {
            return Err(malformed("missing type length"));
        }
        let type_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;

        let type_end = 2 + type_len;
        if bytes.len() < type_end + 4 {
            return Err(malformed("truncated header"));
        }
        let frame_type = std::str::from_utf8(&bytes[2..type_end])
            .map_err(|_| malformed("type is not UTF-8"))?
            .to_string();

        let payload_len = u32::from_be_bytes([
            bytes[type_end],
            bytes[type_end + 1],
            bytes[type_end + 2],
            bytes[type_end + 3],
        ]) as usize;

        let payload_start = type_end + 4;
        if bytes.len() != payload_start + payload_len {
            return Err(malformed("payload length mismatch"));
        }

        Ok(Self {
            frame_type,
            payload: bytes[payload_start..].to_vec(),
        })
    }
}

/// Write one length-prefixed encrypted record.
pub async fn write_record<W: AsyncWrite + Unpin>(writer: &mut W, sealed: &[u8]) -> Result<()> {
    if sealed.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "record too large: {} bytes",
            sealed.len()
        )));
    }
    writer.write_all(&(sealed.len() as u32).to_be_bytes()).await?;
    writer.write_all(sealed).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed encrypted record.
///
/// A clean EOF on the length prefix is [`Error::EndOfStream`]; EOF in the
/// middle of a record is a protocol violation.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_bytes).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::EndOfStream,
            _ => Error::Io(e),
        });
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("record too large: {len} bytes")));
    }

    let mut sealed = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut sealed).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Protocol("truncated record".into()),
            _ => Error::Io(e),
        });
    }
    Ok(sealed)
}
