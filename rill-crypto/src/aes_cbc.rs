//! AES-128-CBC in-place packet cipher.

use aes::Aes128;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::CryptoError;

type CbcEnc = cbc::Encryptor<Aes128>;
type CbcDec = cbc::Decryptor<Aes128>;

/// The AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

const ZERO_IV: [u8; AES_BLOCK_SIZE] = [0u8; AES_BLOCK_SIZE];

/// Per-session AES-128-CBC cipher with independent encrypt/decrypt keys.
///
/// Every call starts from an all-zero IV — datagrams are independent.
#[derive(Clone, Debug)]
pub struct PacketCipher {
    encrypt_key: [u8; AES_BLOCK_SIZE],
    decrypt_key: [u8; AES_BLOCK_SIZE],
}

impl PacketCipher {
    /// Build a cipher from 16-byte encrypt and decrypt keys.
    pub fn new(encrypt: &[u8], decrypt: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            encrypt_key: encrypt.try_into().map_err(|_| CryptoError::BadKeySize)?,
            decrypt_key: decrypt.try_into().map_err(|_| CryptoError::BadKeySize)?,
        })
    }

    /// Encrypt `data` in place. Length must be a multiple of 16; empty is a no-op.
    pub fn encrypt(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::BadBlockLength);
        }
        let n = data.len();
        CbcEnc::new(&self.encrypt_key.into(), &ZERO_IV.into())
            .encrypt_padded_mut::<NoPadding>(data, n)
            .map_err(|_| CryptoError::BadBlockLength)?;
        Ok(())
    }

    /// Decrypt `data` in place. Length must be a multiple of 16; empty is a no-op.
    pub fn decrypt(&self, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.is_empty() {
            return Ok(());
        }
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(CryptoError::BadBlockLength);
        }
        CbcDec::new(&self.decrypt_key.into(), &ZERO_IV.into())
            .decrypt_padded_mut::<NoPadding>(data)
            .map_err(|_| CryptoError::BadBlockLength)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_key_sizes() {
        assert_eq!(
            PacketCipher::new(&[0u8; 15], &[0u8; 16]).unwrap_err(),
            CryptoError::BadKeySize
        );
        assert_eq!(
            PacketCipher::new(&[0u8; 16], &[0u8; 17]).unwrap_err(),
            CryptoError::BadKeySize
        );
    }

    #[test]
    fn rejects_unaligned_data() {
        let c = PacketCipher::new(&[1u8; 16], &[1u8; 16]).unwrap();
        let mut data = [0u8; 15];
        assert_eq!(c.encrypt(&mut data), Err(CryptoError::BadBlockLength));
        assert_eq!(c.decrypt(&mut data), Err(CryptoError::BadBlockLength));
    }

    #[test]
    fn symmetric_key_roundtrip() {
        let key = *b"Adobe Systems 02";
        let c = PacketCipher::new(&key, &key).unwrap();
        let plain = [0x5au8; 48];
        let mut data = plain;
        c.encrypt(&mut data).unwrap();
        assert_ne!(data, plain);
        c.decrypt(&mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn empty_is_noop() {
        let c = PacketCipher::new(&[2u8; 16], &[3u8; 16]).unwrap();
        let mut data = [];
        c.encrypt(&mut data).unwrap();
        c.decrypt(&mut data).unwrap();
    }
}
