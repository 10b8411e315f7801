//! Multifeed protocol layer.
//!
//! Replicates many append-only feeds between two peers over one shared
//! byte stream: a handshake proves both sides hold the same pre-shared key,
//! a manifest exchange advertises feed keys, and every requested feed gets
//! its own sub-stream folded into the shared transport.
//!
//! Framing and the byte stream live in `multifeed-wire`.
//! Extension payloads: JSON by default, MessagePack optional.

pub mod error;
pub mod extension;
pub mod feed;
pub mod handshake;
pub mod keys;
pub mod manifest;
pub mod memory;
pub mod runtime;
pub mod session;
pub mod store;

pub use error::MuxError;
pub use extension::{
    Encoding, ExtensionKind, ExtensionMessage, ExtensionRegistry, EXT_HANDSHAKE, EXT_MANIFEST,
    EXT_REPLICATE_FEEDS, EXT_REQUEST_FEEDS,
};
pub use feed::{Feed, FeedError, FeedStore, ReplicateOptions, SubChannel, SubStreamOutcome};
pub use handshake::{
    compatible_versions, Handshake, HandshakeAction, HandshakeHeader, HandshakeState, CLIENT_ID,
    PROTOCOL_VERSION,
};
pub use keys::{extract_keys, is_feed_key, uniq, KeyLike};
pub use manifest::{Manifest, ManifestExchange};
pub use memory::{MemoryFeed, MemoryStore};
pub use runtime::{
    MuxChannels, MuxCommand, MuxConfig, MuxEvent, MuxHandle, Multiplexer, Requester, Resolver,
    DEFAULT_SHARED_KEY,
};
pub use session::{BatchId, BatchOutcome, ReplicationRole, SessionManager, SubStreamState};
pub use store::{replicate, ReplicationSession};

pub use multifeed_wire::{FeedKey, WireConfig};
