//! Extension channel: named logical sub-protocols on the main channel.
//!
//! Both peers register the same set of names. Names are sorted and the wire
//! id of an extension is its index in that sorted list, so the registry never
//! needs to be negotiated.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use multifeed_wire::Frame;

use crate::error::MuxError;
use crate::handshake::HandshakeHeader;
use crate::manifest::Manifest;

pub const EXT_HANDSHAKE: &str = "MULTIFEED_HANDSHAKE";
pub const EXT_MANIFEST: &str = "MULTIFEED_MANIFEST";
pub const EXT_REQUEST_FEEDS: &str = "MULTIFEED_REQUEST_FEEDS";
pub const EXT_REPLICATE_FEEDS: &str = "MULTIFEED_REPLICATE_FEEDS";

/// Payload codec of one extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    MsgPack,
}

impl Encoding {
    fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, String> {
        match self {
            Encoding::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            Encoding::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
        }
    }

    fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, String> {
        match self {
            Encoding::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            Encoding::MsgPack => rmp_serde::from_slice(bytes).map_err(|e| e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    Handshake,
    Manifest,
    RequestFeeds,
    ReplicateFeeds,
}

impl ExtensionKind {
    pub const ALL: [ExtensionKind; 4] = [
        ExtensionKind::Handshake,
        ExtensionKind::Manifest,
        ExtensionKind::RequestFeeds,
        ExtensionKind::ReplicateFeeds,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExtensionKind::Handshake => EXT_HANDSHAKE,
            ExtensionKind::Manifest => EXT_MANIFEST,
            ExtensionKind::RequestFeeds => EXT_REQUEST_FEEDS,
            ExtensionKind::ReplicateFeeds => EXT_REPLICATE_FEEDS,
        }
    }
}

/// Body of the request and acknowledgement extensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct KeyList {
    keys: Vec<String>,
}

/// A decoded extension message.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionMessage {
    Handshake(HandshakeHeader),
    Manifest(Manifest),
    /// Keys the sender wants.
    RequestFeeds(Vec<String>),
    /// Keys the sender will replicate in answer to a request.
    ReplicateFeeds(Vec<String>),
}

impl ExtensionMessage {
    pub fn kind(&self) -> ExtensionKind {
        match self {
            ExtensionMessage::Handshake(_) => ExtensionKind::Handshake,
            ExtensionMessage::Manifest(_) => ExtensionKind::Manifest,
            ExtensionMessage::RequestFeeds(_) => ExtensionKind::RequestFeeds,
            ExtensionMessage::ReplicateFeeds(_) => ExtensionKind::ReplicateFeeds,
        }
    }
}

/// The agreed extension list.
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    /// Sorted by name; the index is the wire id.
    entries: Vec<(ExtensionKind, Encoding)>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::with_encoding(Encoding::default())
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every extension with the same codec.
    pub fn with_encoding(encoding: Encoding) -> Self {
        let mut entries: Vec<_> = ExtensionKind::ALL.iter().map(|k| (*k, encoding)).collect();
        entries.sort_by_key(|(kind, _)| kind.name());
        Self { entries }
    }

    /// Wire id of `kind`.
    pub fn id_of(&self, kind: ExtensionKind) -> u32 {
        self.entries
            .iter()
            .position(|(k, _)| *k == kind)
            .unwrap_or_default() as u32
    }

    /// Registered names in wire order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(k, _)| k.name()).collect()
    }

    fn encoding_of(&self, kind: ExtensionKind) -> Encoding {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, e)| *e)
            .unwrap_or_default()
    }

    /// Encode `msg` into an extension frame.
    pub fn encode(&self, msg: &ExtensionMessage) -> Result<Frame, MuxError> {
        let kind = msg.kind();
        let encoding = self.encoding_of(kind);
        let payload = match msg {
            ExtensionMessage::Handshake(header) => encoding.encode(header),
            ExtensionMessage::Manifest(manifest) => encoding.encode(manifest),
            ExtensionMessage::RequestFeeds(keys) | ExtensionMessage::ReplicateFeeds(keys) => {
                encoding.encode(&KeyList { keys: keys.clone() })
            }
        }
        .map_err(|reason| MuxError::MalformedMessage {
            extension: kind.name().to_string(),
            reason,
        })?;

        Ok(Frame::Extension {
            id: self.id_of(kind),
            payload,
        })
    }

    /// Decode an extension payload.
    ///
    /// Unknown ids are not an error: they yield `Ok(None)`.
    pub fn decode(&self, id: u32, payload: &[u8]) -> Result<Option<ExtensionMessage>, MuxError> {
        let Some((kind, encoding)) = self.entries.get(id as usize).copied() else {
            tracing::debug!("extension: ignoring unknown extension id {id}");
            return Ok(None);
        };

        let malformed = |reason: String| MuxError::MalformedMessage {
            extension: kind.name().to_string(),
            reason,
        };

        let msg = match kind {
            ExtensionKind::Handshake => {
                ExtensionMessage::Handshake(encoding.decode(payload).map_err(malformed)?)
            }
            ExtensionKind::Manifest => {
                ExtensionMessage::Manifest(encoding.decode(payload).map_err(malformed)?)
            }
            ExtensionKind::RequestFeeds => {
                let list: KeyList = encoding.decode(payload).map_err(malformed)?;
                ExtensionMessage::RequestFeeds(list.keys)
            }
            ExtensionKind::ReplicateFeeds => {
                let list: KeyList = encoding.decode(payload).map_err(malformed)?;
                ExtensionMessage::ReplicateFeeds(list.keys)
            }
        };
        Ok(Some(msg))
    }
}
