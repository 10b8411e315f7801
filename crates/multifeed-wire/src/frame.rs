use serde::{Deserialize, Serialize};

use crate::{FeedKey, WireError};

/// One unit on the shared replication stream.
///
/// The main channel is opened with [`Frame::Open`] and closed with
/// [`Frame::Close`]. Everything in between is either a protocol extension
/// message or bytes belonging to one feed's sub-stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Open the main channel, proving knowledge of the shared key.
    Open { discovery_key: [u8; 32] },

    /// A protocol extension message. `id` indexes the agreed extension list.
    Extension { id: u32, payload: Vec<u8> },

    /// Bytes of the sub-stream replicating `key`.
    Feed { key: FeedKey, data: Vec<u8> },

    /// The sender closed its side of the main channel.
    Close,
}

impl Frame {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Open { .. } => "open",
            Frame::Extension { .. } => "extension",
            Frame::Feed { .. } => "feed",
            Frame::Close => "close",
        }
    }
}
