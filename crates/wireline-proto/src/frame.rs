//! Length-prefixed encrypt-then-MAC framing.
//!
//! Each frame on the wire is:
//!
//! ```text
//! [ len : u16 little-endian ]
//! [ ciphertext : len bytes  ]   AES-256-CTR keystream over the plaintext
//! [ mac : 32 bytes          ]   HMAC-SHA-256 over the ciphertext
//! ```
//!
//! The MAC covers the *ciphertext*, so a corrupted frame is rejected before
//! any decryption work. Cipher state runs continuously across frames per
//! direction; the MAC state is reset per frame and covers exactly that
//! frame's ciphertext bytes.
//!
//! Read state and write state live in separate types ([`FrameReader`],
//! [`FrameWriter`]) so the two directions of a connection can be driven from
//! distinct tasks without sharing anything.
//!
//! # Invariants
//!
//! - Keys are fresh per connection; that is why the CTR initial counter is
//!   all-zero. See [`crate::keys`].
//! - A frame is written with a single `write_all` of the fully assembled
//!   `len || ciphertext || mac` buffer: the MAC state is settled before the
//!   first wire byte exists and a failed length write is never swallowed.
//! - Any integrity failure is fatal. After an error the cipher state is
//!   unusable and the caller must close the stream.

use aes::Aes256;
use aes::cipher::{KeyIvInit, StreamCipher};
use bytes::{BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{ProtoError, Result};
use crate::keys::KEY_LEN;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Bytes of the HMAC-SHA-256 trailer on every frame.
pub const MAC_LEN: usize = 32;

/// Maximum ciphertext bytes one frame can carry (u16 length prefix).
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

const LEN_PREFIX: usize = 2;
const ZERO_IV: [u8; 16] = [0u8; 16];

fn new_cipher(key: &[u8; KEY_LEN]) -> Aes256Ctr {
    Aes256Ctr::new(key.into(), (&ZERO_IV).into())
}

fn new_mac(key: &[u8; KEY_LEN]) -> HmacSha256 {
    let Ok(mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA-256 accepts keys of any length");
    };
    mac
}

/// Short reads inside a frame are corruption, not orderly shutdown.
fn map_short_read(err: std::io::Error) -> ProtoError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtoError::Corrupted("stream ended inside a frame".to_string())
    } else {
        ProtoError::Io(err)
    }
}

/// Writing side of one direction of a framed stream.
pub struct FrameWriter<W> {
    io: W,
    cipher: Aes256Ctr,
    mac: HmacSha256,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a byte sink with this direction's cipher and MAC keys.
    pub fn new(io: W, cipher_key: &[u8; KEY_LEN], mac_key: &[u8; KEY_LEN]) -> Self {
        Self { io, cipher: new_cipher(cipher_key), mac: new_mac(mac_key) }
    }

    /// Encrypt, authenticate, and write one frame.
    ///
    /// The whole frame is assembled in memory and written with a single
    /// `write_all`, then flushed.
    ///
    /// # Errors
    ///
    /// - [`ProtoError::FrameTooLarge`] if `plaintext` exceeds
    ///   [`MAX_FRAME_LEN`]; nothing is written and the stream stays usable.
    /// - [`ProtoError::Io`] if the underlying write fails; the cipher state
    ///   has already advanced, so the connection must be closed.
    pub async fn write_frame(&mut self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > MAX_FRAME_LEN {
            return Err(ProtoError::FrameTooLarge { size: plaintext.len(), max: MAX_FRAME_LEN });
        }

        let mut buf = BytesMut::with_capacity(LEN_PREFIX + plaintext.len() + MAC_LEN);
        buf.put_u16_le(plaintext.len() as u16);
        buf.extend_from_slice(plaintext);

        // Encrypt in place, then MAC the ciphertext (encrypt-then-MAC).
        self.cipher.apply_keystream(&mut buf[LEN_PREFIX..]);
        self.mac.update(&buf[LEN_PREFIX..]);
        let tag = self.mac.finalize_reset().into_bytes();
        buf.extend_from_slice(&tag);

        self.io.write_all(&buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Flush and shut down the underlying sink.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    /// Consume the writer, returning the underlying sink.
    pub fn into_inner(self) -> W {
        self.io
    }
}

/// Reading side of one direction of a framed stream.
pub struct FrameReader<R> {
    io: R,
    cipher: Aes256Ctr,
    mac: HmacSha256,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a byte source with this direction's cipher and MAC keys.
    pub fn new(io: R, cipher_key: &[u8; KEY_LEN], mac_key: &[u8; KEY_LEN]) -> Self {
        Self { io, cipher: new_cipher(cipher_key), mac: new_mac(mac_key) }
    }

    /// Read, verify, and decrypt one frame.
    ///
    /// Returns `Ok(None)` on a clean end of stream, meaning the peer closed
    /// exactly at a frame boundary. EOF anywhere inside a frame is a short
    /// read and therefore corruption.
    ///
    /// # Errors
    ///
    /// [`ProtoError::Corrupted`] on MAC mismatch or short read. The MAC is
    /// compared in constant time; the plaintext is only produced after the
    /// tag verifies.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; LEN_PREFIX];
        let n = self.io.read(&mut len_buf[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        self.io.read_exact(&mut len_buf[1..]).await.map_err(map_short_read)?;
        let len = usize::from(u16::from_le_bytes(len_buf));

        let mut body = vec![0u8; len];
        self.io.read_exact(&mut body).await.map_err(map_short_read)?;
        self.mac.update(&body);
        let expected = self.mac.finalize_reset().into_bytes();

        let mut tag = [0u8; MAC_LEN];
        self.io.read_exact(&mut tag).await.map_err(map_short_read)?;
        if !bool::from(expected.as_slice().ct_eq(&tag)) {
            return Err(ProtoError::Corrupted("frame mac mismatch".to_string()));
        }

        self.cipher.apply_keystream(&mut body);
        Ok(Some(body))
    }

    /// Consume the reader, returning the underlying source.
    pub fn into_inner(self) -> R {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SessionKeys;

    fn pair(buffer: usize) -> (FrameWriter<tokio::io::DuplexStream>, FrameReader<tokio::io::DuplexStream>) {
        let keys = SessionKeys::derive(b"frame tests", None);
        let (a, b) = tokio::io::duplex(buffer);
        let writer = FrameWriter::new(a, &keys.write_cipher, &keys.write_mac);
        let reader = FrameReader::new(b, &keys.write_cipher, &keys.write_mac);
        (writer, reader)
    }

    #[tokio::test]
    async fn frames_round_trip_in_order() {
        let (mut writer, mut reader) = pair(1 << 16);

        writer.write_frame(b"first").await.unwrap();
        writer.write_frame(b"").await.unwrap();
        writer.write_frame(&[0xAB; 4096]).await.unwrap();

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"first");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"");
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), vec![0xAB; 4096]);
    }

    #[tokio::test]
    async fn clean_eof_at_frame_boundary_is_none() {
        let (mut writer, mut reader) = pair(1 << 16);
        writer.write_frame(b"last words").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);

        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"last words");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_writing() {
        let (mut writer, mut reader) = pair(1 << 16);
        let huge = vec![0u8; MAX_FRAME_LEN + 1];

        let err = writer.write_frame(&huge).await.unwrap_err();
        assert!(matches!(err, ProtoError::FrameTooLarge { size, max }
            if size == MAX_FRAME_LEN + 1 && max == MAX_FRAME_LEN));

        // The rejected frame left no bytes behind.
        writer.write_frame(b"ok").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"ok");
    }

    /// Produce one valid frame as raw wire bytes.
    async fn raw_frame(plaintext: &[u8]) -> Vec<u8> {
        let keys = SessionKeys::derive(b"frame tests", None);
        let sink = std::io::Cursor::new(Vec::new());
        let mut writer = FrameWriter::new(sink, &keys.write_cipher, &keys.write_mac);
        writer.write_frame(plaintext).await.unwrap();
        writer.into_inner().into_inner()
    }

    async fn read_raw(wire: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let keys = SessionKeys::derive(b"frame tests", None);
        let mut reader = FrameReader::new(wire.as_slice(), &keys.write_cipher, &keys.write_mac);
        reader.read_frame().await
    }

    #[tokio::test]
    async fn every_ciphertext_and_mac_bit_flip_is_detected() {
        let wire = raw_frame(b"integrity matters").await;

        // Flip every bit past the length prefix, one at a time.
        for byte in LEN_PREFIX..wire.len() {
            for bit in 0..8 {
                let mut tampered = wire.clone();
                tampered[byte] ^= 1 << bit;
                let err = read_raw(tampered).await.unwrap_err();
                assert!(err.is_corrupted(), "flip at byte {byte} bit {bit} slipped through");
            }
        }
    }

    #[tokio::test]
    async fn truncated_frame_is_corruption() {
        let wire = raw_frame(b"cut short").await;

        // Every proper prefix that includes at least the first length byte.
        for cut in 1..wire.len() {
            let err = read_raw(wire[..cut].to_vec()).await.unwrap_err();
            assert!(err.is_corrupted(), "truncation at {cut} bytes slipped through");
        }
    }

    #[tokio::test]
    async fn wrong_mac_key_rejects_the_frame() {
        let wire = raw_frame(b"keyed trust").await;
        let other = SessionKeys::derive(b"some other connection", None);
        let mut reader = FrameReader::new(wire.as_slice(), &other.write_cipher, &other.write_mac);
        assert!(reader.read_frame().await.unwrap_err().is_corrupted());
    }
}
