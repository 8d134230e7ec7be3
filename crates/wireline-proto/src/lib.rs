//! Wireline wire protocol: framed secure transport and command codec.
//!
//! Everything a broker or client needs to speak the Wireline protocol over a
//! reliable ordered byte stream:
//!
//! - [`frame`]: length-prefixed encrypt-then-MAC framing (AES-256-CTR +
//!   HMAC-SHA-256) with per-direction keys and per-frame integrity.
//! - [`command`]: the structured payload inside each frame - CBOR-encoded
//!   command records with optional snappy compression of large bodies.
//! - [`keys`]: the four-key session schedule installed by the (external)
//!   handshake, plus an HKDF helper for deriving it from a shared secret.
//!
//! The crate is transport-agnostic: readers and writers are generic over
//! tokio's `AsyncRead`/`AsyncWrite`, so production TCP streams and in-memory
//! duplex pairs go through identical code paths.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
mod errors;
pub mod frame;
pub mod keys;

pub use command::{Command, CommandKind, CommandReader, CommandWriter, Message};
pub use errors::{ProtoError, Result};
pub use frame::{FrameReader, FrameWriter, MAC_LEN, MAX_FRAME_LEN};
pub use keys::{KEY_LEN, SessionKeys};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

/// Split a bidirectional stream into a command reader/writer pair keyed with
/// the given session keys.
///
/// The read half uses the session's read keys and the write half the write
/// keys, so a server-side and a client-side endpoint of the same stream must
/// hold [mirrored](SessionKeys::mirrored) key sets.
pub fn command_pair<S>(
    stream: S,
    session: &SessionKeys,
) -> (CommandReader<ReadHalf<S>>, CommandWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = CommandReader::new(read_half, &session.read_cipher, &session.read_mac);
    let writer = CommandWriter::new(write_half, &session.write_cipher, &session.write_mac);
    (reader, writer)
}
