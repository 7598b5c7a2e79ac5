//! Public-key fingerprints for manual verification.
//!
//! Two deterministic renderings of the same SHA-256 digest: a grouped hex
//! form for written comparison and a six-word form for reading out loud.

use sha2::{Digest, Sha256};

/// Fixed 32-word alphabet for verbal fingerprints.
pub const WORD_ALPHABET: [&str; 32] = [
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel",
    "india", "juliet", "kilo", "lima", "mike", "november", "oscar", "papa",
    "quebec", "romeo", "sierra", "tango", "uniform", "victor", "whiskey", "xray",
    "yankee", "zulu", "zero", "one", "two", "three", "four", "five",
];

/// Hex fingerprint: first 10 bytes of SHA-256, upper-hex, grouped
/// `XXXX-XXXX-XXXX-XXXX-XXXX`.
pub fn hex_fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);

    let mut out = String::with_capacity(24);
    for (i, byte) in hash[..10].iter().enumerate() {
        if i > 0 && i % 2 == 0 {
            out.push('-');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Word fingerprint: six words from [`WORD_ALPHABET`], indexed by the
/// first six digest bytes modulo the alphabet size.
pub fn word_fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);

    hash[..6]
        .iter()
        .map(|&b| WORD_ALPHABET[b as usize % WORD_ALPHABET.len()])
        .collect::<Vec<_>>()
        .join(" ")
}
