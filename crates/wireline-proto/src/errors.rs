//! Protocol error types.

use thiserror::Error;

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtoError>;

/// Errors produced by the frame and command codecs.
///
/// Every variant except `Io` is fatal to the connection it occurred on:
/// stream-cipher state cannot be resynchronized after a partial or rejected
/// frame, so callers must close and never retry.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// MAC mismatch, short read, or undecodable payload.
    ///
    /// Deliberately coarse: an attacker probing the connection learns nothing
    /// beyond "the frame was rejected".
    #[error("corrupted data: {0}")]
    Corrupted(String),

    /// Encoded payload does not fit the u16 length prefix.
    ///
    /// Raised before any frame byte is written; the stream is still intact.
    #[error("frame payload of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Encoded payload size that was rejected.
        size: usize,
        /// Maximum payload bytes one frame can carry.
        max: usize,
    },

    /// Command serialization failed.
    #[error("command encoding failed: {0}")]
    Encode(String),

    /// Underlying stream error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// Whether this error means the peer sent data that failed integrity or
    /// structural checks.
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Self::Corrupted(_))
    }
}
