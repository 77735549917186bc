//! Cryptographic primitives for the RTMFP transport.
//!
//! Provides:
//! - AES-128-CBC per-packet cipher with an all-zero IV ([`PacketCipher`])
//! - 16-bit ones-complement checksum ([`checksum`])
//! - Diffie-Hellman key agreement over the 1024-bit MODP group ([`DhEngine`])
//! - The HMAC-SHA256 session-key derivation chain ([`compute_session_keys`])
//! - `sha256!` — hash macro over concatenated slices
//!
//! A zero IV with a per-session key is sound here: every datagram is an
//! independent message and the body carries its own checksum, so a
//! mismatched key destroys the checksum with overwhelming probability.

#![deny(unsafe_code)]

mod aes_cbc;
mod checksum;
mod dh;
mod sha;

pub use aes_cbc::{AES_BLOCK_SIZE, PacketCipher};
pub use checksum::checksum;
pub use dh::{DhEngine, compute_session_keys};

use std::fmt;

// ─── Error ───────────────────────────────────────────────────────────────────

/// Errors from the packet cipher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// A key is not exactly one AES block (16 bytes).
    BadKeySize,
    /// Ciphertext/plaintext length is not a multiple of the AES block size.
    BadBlockLength,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadKeySize     => write!(f, "key must be exactly 16 bytes"),
            Self::BadBlockLength => write!(f, "data length is not a multiple of 16"),
        }
    }
}

impl std::error::Error for CryptoError {}
