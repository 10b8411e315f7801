use std::time::Duration;

use multifeed_wire::WireError;

/// Protocol-level errors for a multifeed session.
///
/// Fatal variants tear the session down and are surfaced through
/// [`MuxEvent::Error`](crate::MuxEvent::Error) and the session task result.
/// The remaining variants only ever show up in debug logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    #[error("protocol version mismatch! us={ours} them={theirs}")]
    VersionMismatch { ours: String, theirs: String },

    #[error("client mismatch! expected {ours} but got {theirs}")]
    ClientMismatch { ours: String, theirs: String },

    #[error("remote opened the channel with a different shared key")]
    KeyMismatch,

    #[error("remote did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("malformed {extension} message: {reason}")]
    MalformedMessage { extension: String, reason: String },

    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("more than {limit} frames for {key} arrived before its sub-stream started")]
    BufferOverflow { key: String, limit: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session closed")]
    Closed,

    // ── Non-fatal ───────────────────────────────────────────────────

    #[error("remote requested {key}, which we never offered")]
    UnauthorizedKeyRequest { key: String },

    #[error("remote offered {key}, which we never requested")]
    UnrequestedKeyOffered { key: String },

    #[error("could not resolve feed {key}: {reason}")]
    FeedResolution { key: String, reason: String },
}

impl MuxError {
    /// Whether this error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            MuxError::UnauthorizedKeyRequest { .. }
                | MuxError::UnrequestedKeyOffered { .. }
                | MuxError::FeedResolution { .. }
        )
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            MuxError::VersionMismatch { .. } => "ERR_VERSION_MISMATCH",
            MuxError::ClientMismatch { .. } => "ERR_CLIENT_MISMATCH",
            MuxError::KeyMismatch => "ERR_KEY_MISMATCH",
            MuxError::HandshakeTimeout(_) => "ERR_HANDSHAKE_TIMEOUT",
            MuxError::MalformedMessage { .. } => "ERR_MALFORMED_MESSAGE",
            MuxError::ProtocolViolation { .. } => "ERR_PROTOCOL_VIOLATION",
            MuxError::BufferOverflow { .. } => "ERR_BUFFER_OVERFLOW",
            MuxError::Transport(_) => "ERR_TRANSPORT",
            MuxError::Closed => "ERR_CLOSED",
            MuxError::UnauthorizedKeyRequest { .. } => "ERR_UNAUTHORIZED_KEY_REQUEST",
            MuxError::UnrequestedKeyOffered { .. } => "ERR_UNREQUESTED_KEY_OFFERED",
            MuxError::FeedResolution { .. } => "ERR_FEED_RESOLUTION",
        }
    }
}

impl From<WireError> for MuxError {
    fn from(e: WireError) -> Self {
        MuxError::Transport(e.to_string())
    }
}
