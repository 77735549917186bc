//! The packet cryptographic frame.
//!
//! Wire layout: `[session-id u32][checksum u16][encrypted body]`.
//! The session id is obfuscated by XORing it against the first two
//! 32-bit words of the encrypted body, so the id can be recovered
//! before any key is known; the body decrypts under the recipient
//! session's AES key and authenticates with the ones-complement
//! checksum at offset 4.

use std::time::Instant;

use rill_crypto::{AES_BLOCK_SIZE, CryptoError, PacketCipher, checksum};
use rill_wire::{PacketReader, PacketWriter, WireError};
use thiserror::Error;

use crate::util::unix_ms;

/// Errors from frame decode/encode and message parsing.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Datagram shorter than the minimum frame.
    #[error("packet too small")]
    TooSmall,
    /// The decrypted checksum does not match.
    #[error("packet checksum mismatch")]
    BadChecksum,
    /// A message body is longer than the remaining packet.
    #[error("bad message content length")]
    BadContentLength,
    /// Cipher failure (unaligned body).
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Byte-level coding failure.
    #[error(transparent)]
    Wire(#[from] WireError),
}

// ─── Session-id extraction ───────────────────────────────────────────────────

/// Recover the obfuscated recipient session id from a raw datagram.
///
/// XORs the three consecutive 32-bit words at offsets 0, 4 and 8.
/// Zero routes to the handshake engine.
pub fn session_id_of(data: &[u8]) -> Result<u32, FrameError> {
    if data.len() < 12 {
        return Err(FrameError::TooSmall);
    }
    let mut r = PacketReader::new(data);
    let mut xid = 0u32;
    for _ in 0..3 {
        xid ^= r.read_u32()?;
    }
    Ok(xid)
}

// ─── Decode / encode ─────────────────────────────────────────────────────────

/// Decrypt and verify a datagram in place.
///
/// On success `data[6..]` is the plaintext packet body.
pub fn decode_packet(cipher: &PacketCipher, data: &mut [u8]) -> Result<(), FrameError> {
    if data.len() < 4 + AES_BLOCK_SIZE {
        return Err(FrameError::TooSmall);
    }
    cipher.decrypt(&mut data[4..])?;
    let got = u16::from(data[4]) * 256 + u16::from(data[5]);
    if got != checksum(&data[6..]) {
        return Err(FrameError::BadChecksum);
    }
    Ok(())
}

/// Pad, checksum, encrypt and obfuscate an outgoing packet.
///
/// `data` is `[6 reserved bytes][plaintext body…]`; the result is the
/// full datagram addressed to the peer's session id `yid`.
pub fn encode_packet(
    cipher: &PacketCipher,
    yid: u32,
    data: Vec<u8>,
) -> Result<Vec<u8>, FrameError> {
    if data.len() < 6 {
        return Err(FrameError::TooSmall);
    }
    let mut data = data;
    let n = (data.len() - 4) % AES_BLOCK_SIZE;
    if n != 0 {
        data.resize(data.len() + AES_BLOCK_SIZE - n, 0xff);
    }
    let sum = checksum(&data[6..]);
    data[4] = (sum >> 8) as u8;
    data[5] = sum as u8;
    cipher.encrypt(&mut data[4..])?;

    let mut r = PacketReader::new(&data);
    r.set_offset(4)?;
    let mut id = yid;
    for _ in 0..2 {
        id ^= r.read_u32()?;
    }
    data[..4].copy_from_slice(&id.to_be_bytes());
    Ok(data)
}

// ─── Request messages ────────────────────────────────────────────────────────

/// One `[code][size u16][body]` record inside a decoded packet.
pub struct RequestMessage<'a> {
    /// The message code.
    pub code: u8,
    /// Reader over the message body.
    pub body: PacketReader<'a>,
}

/// Parse the next message record, or `None` at the `0xff` terminator.
pub fn parse_request_message<'a>(
    r: &mut PacketReader<'a>,
) -> Result<Option<RequestMessage<'a>>, FrameError> {
    let code = r.read_u8()?;
    if code == 0xff {
        return Ok(None);
    }
    let size = r.read_u16()? as usize;
    if r.remaining() < size {
        return Err(FrameError::BadContentLength);
    }
    let body = &r.rest()[..size];
    r.skip(size)?;
    Ok(Some(RequestMessage { code, body: PacketReader::new(body) }))
}

// ─── Response packets ────────────────────────────────────────────────────────

/// One outgoing message: a code byte plus a self-serializing body.
pub trait ResponseMessage {
    /// The message code.
    fn code(&self) -> u8;
    /// Serialize the body.
    fn write_to(&self, w: &mut PacketWriter) -> rill_wire::Result<()>;
}

/// Echo-timestamp state for a response packet.
#[derive(Clone, Copy)]
pub struct EchoTime {
    /// When the packet being answered arrived.
    pub recv: Instant,
    /// The peer's 16-bit timestamp to echo back.
    pub stamp: u16,
}

/// Serialize a response packet body.
///
/// Layout: marker, 16-bit now-ms timestamp, optional echo timestamp
/// (`stamp + elapsed-ms`; sets marker bit `0x04`, suppressed when the
/// packet being answered is older than 30 s), then each message as
/// `[code][size u16][body]`. The first six bytes are reserved for the
/// crypto frame.
pub fn packet_to_bytes<M: ResponseMessage>(
    marker: u8,
    echo: Option<EchoTime>,
    msgs: &[M],
) -> Result<Vec<u8>, FrameError> {
    let mut marker = marker;
    let echo = echo.filter(|e| {
        let fresh = e.recv.elapsed().as_secs() < 30;
        if fresh {
            marker += 0x04;
        }
        fresh
    });

    let mut w = PacketWriter::new();
    w.skip(6);
    w.write_u8(marker);
    w.write_u16(unix_ms() as u16);
    if let Some(e) = echo {
        w.write_u16(e.stamp.wrapping_add(e.recv.elapsed().as_millis() as u16));
    }
    for msg in msgs {
        w.write_u8(msg.code());
        let pos = w.offset();
        w.skip(2);
        msg.write_to(&mut w)?;
        let (beg, end) = (pos + 2, w.offset());
        if end < beg || end > beg + 0xffff {
            return Err(FrameError::BadContentLength);
        }
        w.set_offset(pos)?;
        w.write_u16((end - beg) as u16);
        w.set_offset(end)?;
    }
    Ok(w.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> PacketCipher {
        PacketCipher::new(b"Adobe Systems 02", b"Adobe Systems 02").unwrap()
    }

    struct Raw(u8, Vec<u8>);

    impl ResponseMessage for Raw {
        fn code(&self) -> u8 {
            self.0
        }
        fn write_to(&self, w: &mut PacketWriter) -> rill_wire::Result<()> {
            w.write_bytes(&self.1);
            Ok(())
        }
    }

    #[test]
    fn frame_roundtrip_restores_the_body() {
        let c = cipher();
        let body = packet_to_bytes(0x0b, None, &[Raw(0x30, vec![1, 2, 3, 4, 5])]).unwrap();
        let plain = body.clone();

        let encoded = encode_packet(&c, 0, body).unwrap();
        assert_eq!(encoded.len() % 16, 4);
        assert_eq!(session_id_of(&encoded).unwrap(), 0);

        let mut data = encoded;
        decode_packet(&c, &mut data).unwrap();
        assert_eq!(&data[6..plain.len()], &plain[6..]);
        // Padding, if any, is 0xff.
        assert!(data[plain.len()..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn session_id_obfuscation_roundtrip() {
        let c = cipher();
        for yid in [1u32, 0xdead_beef, u32::MAX] {
            let body = packet_to_bytes(0x4a, None, &[Raw(0x01, vec![])]).unwrap();
            let encoded = encode_packet(&c, yid, body).unwrap();
            assert_eq!(session_id_of(&encoded).unwrap(), yid);
        }
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let c = cipher();
        let body = packet_to_bytes(0x0b, None, &[Raw(0x30, vec![9; 20])]).unwrap();
        let mut encoded = encode_packet(&c, 0, body).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x40;
        assert!(matches!(
            decode_packet(&c, &mut encoded),
            Err(FrameError::BadChecksum | FrameError::Crypto(_))
        ));
    }

    #[test]
    fn wrong_key_destroys_the_checksum() {
        let c = cipher();
        let other = PacketCipher::new(&[7u8; 16], &[7u8; 16]).unwrap();
        let body = packet_to_bytes(0x0b, None, &[Raw(0x30, vec![1; 32])]).unwrap();
        let mut encoded = encode_packet(&c, 0, body).unwrap();
        assert!(decode_packet(&other, &mut encoded).is_err());
    }

    #[test]
    fn short_packets_are_rejected() {
        assert!(matches!(session_id_of(&[0u8; 11]), Err(FrameError::TooSmall)));
        let c = cipher();
        let mut short = [0u8; 19];
        assert!(matches!(decode_packet(&c, &mut short), Err(FrameError::TooSmall)));
    }

    #[test]
    fn request_messages_iterate_until_terminator() {
        let mut w = PacketWriter::new();
        w.write_u8(0x10);
        w.write_u16(3);
        w.write_bytes(&[1, 2, 3]);
        w.write_u8(0x51);
        w.write_u16(1);
        w.write_u8(0xaa);
        w.write_u8(0xff);
        let bytes = w.into_bytes();

        let mut r = PacketReader::new(&bytes);
        let m1 = parse_request_message(&mut r).unwrap().unwrap();
        assert_eq!(m1.code, 0x10);
        assert_eq!(m1.body.rest(), &[1, 2, 3]);
        let m2 = parse_request_message(&mut r).unwrap().unwrap();
        assert_eq!(m2.code, 0x51);
        assert!(parse_request_message(&mut r).unwrap().is_none());
    }

    #[test]
    fn truncated_message_is_an_error() {
        let mut r = PacketReader::new(&[0x10, 0x00, 0x05, 1, 2]);
        assert!(matches!(
            parse_request_message(&mut r),
            Err(FrameError::BadContentLength)
        ));
    }

    #[test]
    fn echo_time_sets_the_marker_bit() {
        let body = packet_to_bytes(
            0x4a,
            Some(EchoTime { recv: Instant::now(), stamp: 100 }),
            &[Raw(0x41, vec![])],
        )
        .unwrap();
        assert_eq!(body[6], 0x4e);
    }
}
