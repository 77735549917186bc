//! Diffie-Hellman key agreement and the session-key derivation chain.

use std::sync::LazyLock;

use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use sha2::Sha256;

use crate::AES_BLOCK_SIZE;

/// The 1024-bit MODP prime (RFC 2409 group 2), generator 2 — the group
/// RTMFP endpoints agree on.
const MODP1024_HEX: &str = "\
ffffffffffffffffc90fdaa22168c234c4c6628b80dc1cd129024e088a67cc74\
020bbea63b139b22514a08798e3404ddef9519b3cd3a431b302b0a6df25f1437\
4fe1356d6d51c245e485b576625e7ec6f44c42e9a637ed6b0bff5cb6f406b7ed\
ee386bfb5a899fa5ae9f24117c4b1fe649286651ece65381ffffffffffffffff";

const KEY_SIZE: usize = 128;

static MODULUS: LazyLock<BigUint> =
    LazyLock::new(|| BigUint::parse_bytes(MODP1024_HEX.as_bytes(), 16).expect("modp prime"));

/// The fixed prefix of the responder blob sent back during key exchange.
const RESPONDER_PREFIX: [u8; 11] = [
    0x03, 0x1a, 0x00, 0x00, 0x02, 0x1e, 0x00, 0x81, 0x02, 0x0d, 0x02,
];

fn left_pad(bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() >= KEY_SIZE {
        return bytes;
    }
    let mut out = vec![0u8; KEY_SIZE - bytes.len()];
    out.extend_from_slice(&bytes);
    out
}

// ─── DhEngine ────────────────────────────────────────────────────────────────

/// One Diffie-Hellman keypair over the fixed group.
///
/// Handshake agents each own an engine; the keypair is generated once and
/// reused for every exchange the agent serves.
pub struct DhEngine {
    private: BigUint,
    public: Vec<u8>,
}

impl DhEngine {
    /// Generate a fresh keypair.
    pub fn new() -> Self {
        let mut exp = [0u8; KEY_SIZE];
        getrandom::getrandom(&mut exp).expect("getrandom failed");
        let private = BigUint::from_bytes_be(&exp);
        let public = left_pad(BigUint::from(2u32).modpow(&private, &MODULUS).to_bytes_be());
        Self { private, public }
    }

    /// The 128-byte public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Compute the 128-byte shared secret from the peer's public key.
    pub fn shared_secret(&self, peer_pubkey: &[u8]) -> Vec<u8> {
        let peer = BigUint::from_bytes_be(peer_pubkey);
        left_pad(peer.modpow(&self.private, &MODULUS).to_bytes_be())
    }
}

impl Default for DhEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Session-key derivation ──────────────────────────────────────────────────

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Derive the responder blob and the session AES keys.
///
/// Given the client's public key and its `initiator` nonce:
///
/// ```text
/// responder   = prefix || server-public-key
/// mdp1        = HMAC(key = initiator, msg = responder)
/// mdp2        = HMAC(key = responder, msg = initiator)
/// encrypt_key = HMAC(key = sharedkey, msg = mdp1)[..16]
/// decrypt_key = HMAC(key = sharedkey, msg = mdp2)[..16]
/// ```
pub fn compute_session_keys(
    engine: &DhEngine,
    pubkey: &[u8],
    initiator: &[u8],
) -> (Vec<u8>, [u8; AES_BLOCK_SIZE], [u8; AES_BLOCK_SIZE]) {
    let sharedkey = engine.shared_secret(pubkey);

    let mut responder = RESPONDER_PREFIX.to_vec();
    responder.extend_from_slice(engine.public_key());

    let mdp1 = hmac_sha256(initiator, &responder);
    let mdp2 = hmac_sha256(&responder, initiator);

    let mut encrypt = [0u8; AES_BLOCK_SIZE];
    encrypt.copy_from_slice(&hmac_sha256(&sharedkey, &mdp1)[..AES_BLOCK_SIZE]);
    let mut decrypt = [0u8; AES_BLOCK_SIZE];
    decrypt.copy_from_slice(&hmac_sha256(&sharedkey, &mdp2)[..AES_BLOCK_SIZE]);

    (responder, encrypt, decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree_on_the_secret() {
        let a = DhEngine::new();
        let b = DhEngine::new();
        assert_eq!(a.shared_secret(b.public_key()), b.shared_secret(a.public_key()));
    }

    #[test]
    fn public_key_is_always_128_bytes() {
        for _ in 0..4 {
            assert_eq!(DhEngine::new().public_key().len(), 128);
        }
    }

    #[test]
    fn responder_carries_prefix_and_public_key() {
        let server = DhEngine::new();
        let client = DhEngine::new();
        let (responder, enc, dec) =
            compute_session_keys(&server, client.public_key(), b"initiator-nonce");
        assert_eq!(&responder[..11], &RESPONDER_PREFIX);
        assert_eq!(&responder[11..], server.public_key());
        assert_ne!(enc, dec);
    }

    #[test]
    fn derivation_is_deterministic() {
        let server = DhEngine::new();
        let client = DhEngine::new();
        let once = compute_session_keys(&server, client.public_key(), b"n");
        let twice = compute_session_keys(&server, client.public_key(), b"n");
        assert_eq!(once, twice);
    }
}
