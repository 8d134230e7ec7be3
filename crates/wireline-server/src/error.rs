//! Server error taxonomy.
//!
//! Every failure the broker can produce, with its propagation rule:
//!
//! - Fatal to one connection: [`ServerError::CorruptedData`],
//!   [`ServerError::ProtocolViolation`], [`ServerError::InvalidUsername`],
//!   [`ServerError::Capacity`]. The affected connection is closed; others
//!   are untouched.
//! - Fatal to one request: [`ServerError::InvalidRequest`],
//!   [`ServerError::Cache`]. Surfaced in the dispatch result; no fan-out
//!   happened.
//! - Locally recovered: [`ServerError::PeerWrite`]. Recorded per fan-out
//!   target; the failing connection is closed, the surviving peers still
//!   receive the message.
//! - Logged only: [`ServerError::Push`]. Reported through `on_error`, never
//!   surfaced to the caller.

use thiserror::Error;

use crate::cache::CacheError;
use crate::push::PushError;

/// Which registry cap an `add` ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapacityKind {
    /// The global connection cap is reached.
    #[error("too many connections")]
    TooManyConns,
    /// The distinct-user cap is reached and the user is not yet present.
    #[error("too many users")]
    TooManyUsers,
    /// The per-user connection cap is reached for this user.
    #[error("too many connections for this user")]
    TooManyConnsPerUser,
}

/// Errors produced by the brokering core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// MAC mismatch, short read, or undecodable command from the peer.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// Unknown must-understand command or malformed command parameters.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Username empty or containing forbidden characters.
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    /// Empty message, empty receiver, or an otherwise unusable request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A registry cap rejected a new connection.
    #[error("capacity exceeded: {0}")]
    Capacity(CapacityKind),

    /// The message cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A write to one fan-out target failed.
    #[error("peer write failed: {0}")]
    PeerWrite(String),

    /// The push collaborator failed or timed out.
    #[error("push failed: {0}")]
    Push(#[from] PushError),

    /// Transport-level failure outside the codec.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<wireline_proto::ProtoError> for ServerError {
    fn from(err: wireline_proto::ProtoError) -> Self {
        use wireline_proto::ProtoError;
        match err {
            ProtoError::Corrupted(msg) => Self::CorruptedData(msg),
            ProtoError::FrameTooLarge { size, max } => {
                Self::InvalidRequest(format!("message exceeds frame capacity ({size} > {max})"))
            },
            ProtoError::Encode(msg) => Self::InvalidRequest(format!("unencodable command: {msg}")),
            ProtoError::Io(err) => Self::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(
            ServerError::Capacity(CapacityKind::TooManyUsers).to_string(),
            "capacity exceeded: too many users"
        );
        assert_eq!(
            ServerError::InvalidUsername("a:b".to_string()).to_string(),
            "invalid username: \"a:b\""
        );
    }

    #[test]
    fn proto_corruption_maps_to_corrupted_data() {
        let err: ServerError = wireline_proto::ProtoError::Corrupted("mac".to_string()).into();
        assert!(matches!(err, ServerError::CorruptedData(_)));
    }

    #[test]
    fn proto_frame_overflow_maps_to_invalid_request() {
        let err: ServerError =
            wireline_proto::ProtoError::FrameTooLarge { size: 70_000, max: 65_535 }.into();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }
}
