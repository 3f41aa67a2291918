//! Error taxonomy for the replication protocol.
//!
//! Wire-level failures are fatal to the connection that produced them and
//! surface as [`WireError`]. Session-level failures (handshake, unexpected
//! messages, transport loss) surface as [`ConnectionError`]. Trust violations
//! are deliberately *not* errors: the offending field or event is dropped and
//! reported through the audit log while the connection stays up.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failures while framing, compressing, or decoding wire traffic.
#[derive(Debug, Error)]
pub enum WireError {
    /// The 3-byte length prefix declared a frame larger than the protocol
    /// allows.
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// The compression header declared a decompressed body larger than the
    /// protocol allows.
    #[error("declared body size {length} exceeds maximum {max}")]
    BodyTooLarge { length: usize, max: usize },

    /// Compressed payload did not inflate cleanly.
    #[error("decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    /// An envelope or field value failed to serialize.
    #[error("encoding failed: {0}")]
    Encode(#[source] bincode::Error),

    /// An envelope or field value failed to deserialize.
    #[error("decoding failed: {0}")]
    Decode(#[source] bincode::Error),

    /// A field id that the component's descriptor does not declare.
    #[error("component {component} has no field {field}")]
    UnknownField { component: &'static str, field: u8 },
}

/// Failures establishing or running a session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote side rejected the handshake.
    #[error("rejected by remote: {reason} ({detail})")]
    Rejected {
        reason: DisconnectReason,
        detail: String,
    },

    /// The remote's schema table does not match ours.
    #[error("schema table mismatch with remote")]
    SchemaMismatch,

    /// A handshake step did not complete within the configured window.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The remote sent a message the current lifecycle state cannot accept.
    #[error("unexpected {got} message in state {state}")]
    UnexpectedMessage {
        state: &'static str,
        got: &'static str,
    },

    /// The transport closed before the session ended cleanly.
    #[error("connection closed by remote")]
    Closed,
}

/// Reason codes carried on the wire when a connection is refused or torn
/// down. Sent best-effort before closing; also used internally to label
/// transport-level exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Malformed frame or a message invalid for the current state.
    ProtocolError,
    /// Protocol version not supported by the authority.
    UnsupportedVersion,
    /// Component/event schema tables differ between the ends.
    SchemaMismatch,
    /// The authority is at its peer capacity.
    ServerFull,
    /// No traffic within the configured idle or handshake window.
    Timeout,
    /// The peer's outbound queue filled up; it fell too far behind.
    Backpressure,
    /// The authority is shutting down.
    Shutdown,
    /// The remote side closed the session on purpose.
    Quit,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::UnsupportedVersion => "unsupported version",
            DisconnectReason::SchemaMismatch => "schema mismatch",
            DisconnectReason::ServerFull => "server full",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Backpressure => "backpressure",
            DisconnectReason::Shutdown => "server shutdown",
            DisconnectReason::Quit => "quit",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
