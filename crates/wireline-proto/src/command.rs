//! Structured command payloads and their codec.
//!
//! A command is the unit of meaning inside one frame: a type tag, positional
//! string parameters, a string header map, and an optional message. The
//! structural encoding is CBOR - self-describing, so unknown fields are
//! skipped on decode and absent optional fields decode to `None`, which is
//! what lets endpoints of different minor versions share a connection.
//!
//! Large message bodies are compressed with snappy before framing. The
//! compression decision is per command: applied iff the *uncompressed* body
//! size exceeds the connection's current threshold (0 disables it). A one
//! byte marker in front of the encoded document tells the decoder which path
//! to take:
//!
//! ```text
//! frame payload := 0x00 || cbor(command)
//!                | 0x01 || snappy(cbor(command))
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::errors::{ProtoError, Result};
use crate::frame::{FrameReader, FrameWriter, MAX_FRAME_LEN};
use crate::keys::KEY_LEN;

/// Marker byte for an uncompressed command document.
const MARKER_PLAIN: u8 = 0x00;

/// Marker byte for a snappy-compressed command document.
const MARKER_SNAPPY: u8 = 0x01;

/// Command kinds above this mask are reserved protocol control. A receiver
/// that does not understand one must fail the connection rather than skip it.
pub const RESERVED_MASK: u8 = 0x80;

/// The closed set of command types this protocol revision understands.
///
/// Raw `u8` tags travel on the wire so that unknown non-reserved kinds can be
/// skipped for forward compatibility; see [`CommandKind::from_u8`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandKind {
    /// Client payload surfaced to the broker's message hook.
    Data = 0,
    /// Client asks the broker to forward a message to another user.
    /// `params = [ttl, receiver, service?]`.
    Forward = 1,
    /// Broker delivers a message; `params = [cache id]` when the message was
    /// cached.
    MessageWithId = 2,
    /// Client subscribes to out-of-band push delivery.
    Subscribe = 3,
    /// Client cancels a push subscription.
    Unsubscribe = 4,
    /// Client adjusts the compression threshold for messages it receives.
    /// `params = [threshold]`; 0 disables compression.
    SetCompressThreshold = 5,
    /// Client asks for one cached message by id. `params = [id]`.
    MessageRetrieve = 6,
    /// Client asks for every cached message whose id is not listed in
    /// `params`.
    RetrieveAll = 7,
    /// Client toggles presence visibility. `params = ["0" | "1"]`.
    SetVisibility = 8,
}

impl CommandKind {
    /// Map a wire tag to a known kind. `None` means the kind is unknown to
    /// this revision; the caller decides between skipping (non-reserved) and
    /// failing (reserved).
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::Forward),
            2 => Some(Self::MessageWithId),
            3 => Some(Self::Subscribe),
            4 => Some(Self::Unsubscribe),
            5 => Some(Self::SetCompressThreshold),
            6 => Some(Self::MessageRetrieve),
            7 => Some(Self::RetrieveAll),
            8 => Some(Self::SetVisibility),
            _ => None,
        }
    }

    /// The wire tag for this kind.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// An opaque application message: a byte body plus a string header map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque body bytes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    /// Application-level key/value header.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
}

impl Message {
    /// A message with the given body and no header.
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self { body: body.into(), header: HashMap::new() }
    }

    /// Encoded body length in bytes. This is the size compression decisions
    /// and push notifications are based on.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// A message is empty iff it has a zero-length body and no header.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty() && self.header.is_empty()
    }
}

/// One protocol command: the typed payload of one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Wire tag; see [`CommandKind`].
    pub kind: u8,
    /// Positional string parameters, meaning depends on `kind`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    /// Command-level key/value header.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
    /// Attached message, for kinds that carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

impl Command {
    /// An empty command of the given kind.
    pub fn new(kind: CommandKind) -> Self {
        Self { kind: kind.as_u8(), ..Self::default() }
    }

    /// Append a positional parameter.
    pub fn param(mut self, value: impl Into<String>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Attach a message.
    pub fn message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }
}

/// Encode a command into a frame payload, compressing the document when the
/// uncompressed message body exceeds `compress_threshold` (> 0).
///
/// # Errors
///
/// - [`ProtoError::Encode`] if serialization or compression fails.
/// - [`ProtoError::FrameTooLarge`] if the result cannot fit one frame.
pub fn encode_command(cmd: &Command, compress_threshold: i32) -> Result<Vec<u8>> {
    let mut document = Vec::new();
    ciborium::ser::into_writer(cmd, &mut document)
        .map_err(|e| ProtoError::Encode(e.to_string()))?;

    let body_size = cmd.message.as_ref().map_or(0, Message::size);
    let compress = compress_threshold > 0 && body_size > compress_threshold as usize;

    let mut payload;
    if compress {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&document)
            .map_err(|e| ProtoError::Encode(e.to_string()))?;
        payload = Vec::with_capacity(1 + compressed.len());
        payload.push(MARKER_SNAPPY);
        payload.extend_from_slice(&compressed);
    } else {
        payload = Vec::with_capacity(1 + document.len());
        payload.push(MARKER_PLAIN);
        payload.extend_from_slice(&document);
    }

    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge { size: payload.len(), max: MAX_FRAME_LEN });
    }
    Ok(payload)
}

/// Decode a frame payload back into a command, probing the compression
/// marker.
///
/// # Errors
///
/// [`ProtoError::Corrupted`] for an empty payload, an unknown marker, a
/// snappy failure, or an undecodable document. All of these are fatal to the
/// connection they arrived on.
pub fn decode_command(payload: &[u8]) -> Result<Command> {
    let Some((&marker, rest)) = payload.split_first() else {
        return Err(ProtoError::Corrupted("empty frame payload".to_string()));
    };

    let decoded;
    let document: &[u8] = match marker {
        MARKER_PLAIN => rest,
        MARKER_SNAPPY => {
            decoded = snap::raw::Decoder::new()
                .decompress_vec(rest)
                .map_err(|e| ProtoError::Corrupted(format!("snappy: {e}")))?;
            &decoded
        },
        other => {
            return Err(ProtoError::Corrupted(format!(
                "unknown compression marker {other:#04x}"
            )));
        },
    };

    ciborium::de::from_reader(document).map_err(|e| ProtoError::Corrupted(format!("cbor: {e}")))
}

/// Command-writing side of a connection: encode pipeline plus framing.
pub struct CommandWriter<W> {
    frames: FrameWriter<W>,
}

impl<W: AsyncWrite + Unpin> CommandWriter<W> {
    /// Wrap a byte sink with this direction's keys.
    pub fn new(io: W, cipher_key: &[u8; KEY_LEN], mac_key: &[u8; KEY_LEN]) -> Self {
        Self { frames: FrameWriter::new(io, cipher_key, mac_key) }
    }

    /// Encode and write one command as one frame.
    ///
    /// `compress_threshold` is the caller's snapshot of the per-connection
    /// threshold at the moment of the write.
    pub async fn write_command(&mut self, cmd: &Command, compress_threshold: i32) -> Result<()> {
        let payload = encode_command(cmd, compress_threshold)?;
        self.frames.write_frame(&payload).await
    }

    /// Flush and shut down the underlying sink.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.frames.shutdown().await
    }

    /// Consume the writer, returning the underlying sink.
    pub fn into_inner(self) -> W {
        self.frames.into_inner()
    }
}

/// Command-reading side of a connection: framing plus decode pipeline.
pub struct CommandReader<R> {
    frames: FrameReader<R>,
}

impl<R: AsyncRead + Unpin> CommandReader<R> {
    /// Wrap a byte source with this direction's keys.
    pub fn new(io: R, cipher_key: &[u8; KEY_LEN], mac_key: &[u8; KEY_LEN]) -> Self {
        Self { frames: FrameReader::new(io, cipher_key, mac_key) }
    }

    /// Read and decode one command. `Ok(None)` on a clean end of stream.
    pub async fn read_command(&mut self) -> Result<Option<Command>> {
        match self.frames.read_frame().await? {
            Some(payload) => Ok(Some(decode_command(&payload)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_command() -> Command {
        let mut msg = Message::with_body(b"hello there".to_vec());
        msg.header.insert("content-type".to_string(), "text/plain".to_string());
        Command::new(CommandKind::MessageWithId).param("42").message(msg)
    }

    #[test]
    fn kind_tags_round_trip() {
        for tag in 0..=8u8 {
            let kind = CommandKind::from_u8(tag).unwrap();
            assert_eq!(kind.as_u8(), tag);
        }
        assert_eq!(CommandKind::from_u8(9), None);
        assert_eq!(CommandKind::from_u8(0x80), None);
    }

    #[test]
    fn message_emptiness_requires_empty_body_and_header() {
        assert!(Message::default().is_empty());
        assert!(!Message::with_body(b"x".to_vec()).is_empty());

        let mut headered = Message::default();
        headered.header.insert("k".to_string(), "v".to_string());
        assert!(!headered.is_empty());
    }

    #[test]
    fn encode_decode_round_trips_uncompressed() {
        let cmd = sample_command();
        let payload = encode_command(&cmd, 0).unwrap();
        assert_eq!(payload[0], MARKER_PLAIN);
        assert_eq!(decode_command(&payload).unwrap(), cmd);
    }

    #[test]
    fn encode_decode_round_trips_compressed() {
        let mut cmd = sample_command();
        cmd.message = Some(Message::with_body(vec![7u8; 4096]));

        let payload = encode_command(&cmd, 100).unwrap();
        assert_eq!(payload[0], MARKER_SNAPPY);
        assert_eq!(decode_command(&payload).unwrap(), cmd);
    }

    #[test]
    fn threshold_is_strictly_exceeded_before_compressing() {
        let cmd = Command::new(CommandKind::Data).message(Message::with_body(vec![1u8; 100]));

        // body == threshold stays plain, body > threshold compresses
        assert_eq!(encode_command(&cmd, 100).unwrap()[0], MARKER_PLAIN);
        assert_eq!(encode_command(&cmd, 99).unwrap()[0], MARKER_SNAPPY);
        // threshold 0 disables compression outright
        assert_eq!(encode_command(&cmd, 0).unwrap()[0], MARKER_PLAIN);
    }

    #[test]
    fn compression_shrinks_the_frame_for_repetitive_bodies() {
        let cmd = Command::new(CommandKind::Data).message(Message::with_body(vec![0u8; 8192]));
        let plain = encode_command(&cmd, 0).unwrap();
        let packed = encode_command(&cmd, 100).unwrap();
        assert!(packed.len() < plain.len());
    }

    #[test]
    fn oversized_command_is_rejected() {
        // Random bytes defeat snappy, so the encoded form stays > 64 KiB.
        let mut big = vec![0u8; MAX_FRAME_LEN];
        for (i, byte) in big.iter_mut().enumerate() {
            *byte = (i % 251) as u8 ^ (i / 251) as u8;
        }
        let cmd = Command::new(CommandKind::Data).message(Message::with_body(big));

        assert!(matches!(encode_command(&cmd, 0), Err(ProtoError::FrameTooLarge { .. })));
        assert!(matches!(encode_command(&cmd, 1), Err(ProtoError::FrameTooLarge { .. })));
    }

    #[test]
    fn empty_payload_is_corrupted() {
        assert!(decode_command(&[]).unwrap_err().is_corrupted());
    }

    #[test]
    fn unknown_marker_is_corrupted() {
        assert!(decode_command(&[0x7F, 1, 2, 3]).unwrap_err().is_corrupted());
    }

    #[test]
    fn garbage_document_is_corrupted() {
        assert!(decode_command(&[MARKER_PLAIN, 0xFF, 0xFF, 0xFF]).unwrap_err().is_corrupted());
        assert!(decode_command(&[MARKER_SNAPPY, 0xFF, 0xFF]).unwrap_err().is_corrupted());
    }

    #[tokio::test]
    async fn commands_flow_through_a_keyed_stream() {
        use crate::keys::SessionKeys;

        let server = SessionKeys::derive(b"command io", None);
        let client = server.mirrored();
        let (server_stream, client_stream) = tokio::io::duplex(1 << 16);

        let (_sr, mut sw) = crate::command_pair(server_stream, &server);
        let (mut cr, _cw) = crate::command_pair(client_stream, &client);

        let small = sample_command();
        let mut large = sample_command();
        large.message = Some(Message::with_body(vec![3u8; 10_000]));

        sw.write_command(&small, 0).await.unwrap();
        sw.write_command(&large, 512).await.unwrap();

        assert_eq!(cr.read_command().await.unwrap().unwrap(), small);
        assert_eq!(cr.read_command().await.unwrap().unwrap(), large);
    }
}
