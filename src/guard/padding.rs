//! Message padding to hide length.
//!
//! Messages are padded to 256-byte blocks before transport: the original
//! bytes, then random filler, then a final byte carrying the padding size.
//! The padded buffer is base64-encoded so it travels as ordinary message
//! text. An observer sees only which block range a message falls in.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

/// Block size messages are padded up to, in bytes.
pub const PADDING_BLOCK_SIZE: usize = 256;

/// Pad a message to the next block boundary and base64-encode it.
///
/// There is always at least one byte of padding, so the size marker always
/// fits. A padding run of exactly one block (message length a multiple of
/// 256) is encoded as zero, since 256 does not fit an octet.
pub fn pad(message: &str) -> String {
    let msg = message.as_bytes();
    let padded_len = ((msg.len() / PADDING_BLOCK_SIZE) + 1) * PADDING_BLOCK_SIZE;
    let padding_size = padded_len - msg.len();

    let mut padded = vec![0u8; padded_len];
    padded[..msg.len()].copy_from_slice(msg);
    OsRng.fill_bytes(&mut padded[msg.len()..padded_len - 1]);
    padded[padded_len - 1] = padding_size as u8;

    BASE64.encode(padded)
}

/// Strip padding applied by [`pad`].
///
/// Best-effort transparency: input that does not decode as base64, or
/// whose padding marker is inconsistent, is returned unchanged so an
/// unpadded peer still interoperates.
pub fn unpad(padded_b64: &str) -> String {
    let Ok(padded) = BASE64.decode(padded_b64) else {
        return padded_b64.to_string();
    };
    let Some(&marker) = padded.last() else {
        return padded_b64.to_string();
    };

    let padding_size = if marker == 0 {
        PADDING_BLOCK_SIZE
    } else {
        marker as usize
    };
    if padding_size > padded.len() {
        return padded_b64.to_string();
    }

    match std::str::from_utf8(&padded[..padded.len() - padding_size]) {
        Ok(text) => text.to_string(),
        Err(_) => padded_b64.to_string(),
    }
}
