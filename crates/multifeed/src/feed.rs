//! Collaborator interfaces: feeds, their sub-stream view of the shared
//! transport, and the store that resolves keys into feeds.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use multifeed_wire::{FeedKey, Frame};

/// Options handed to [`Feed::replicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateOptions {
    /// Keep replicating new data until the session ends.
    pub live: bool,
    /// Send data the remote is missing.
    pub upload: bool,
    /// Accept data we are missing.
    pub download: bool,
    /// Whether this side initiated the connection.
    pub initiator: bool,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            live: false,
            upload: true,
            download: true,
            initiator: false,
        }
    }
}

/// How a sub-stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubStreamOutcome {
    /// Replication ran to completion.
    Completed,
    /// Torn down with the shared transport; nothing was applied.
    Cancelled,
    /// The feed reported an error.
    Failed(String),
}

impl SubStreamOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SubStreamOutcome::Completed)
    }
}

impl From<Result<(), FeedError>> for SubStreamOutcome {
    fn from(result: Result<(), FeedError>) -> Self {
        match result {
            Ok(()) => SubStreamOutcome::Completed,
            Err(FeedError::Cancelled) => SubStreamOutcome::Cancelled,
            Err(e) => SubStreamOutcome::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("invalid feed key: {0}")]
    InvalidKey(String),

    #[error("feed is not ready: {0}")]
    NotReady(String),

    #[error("sub-stream cancelled")]
    Cancelled,

    #[error("feed is closed")]
    Closed,

    #[error("feed protocol error: {0}")]
    Protocol(String),

    #[error("feed storage error: {0}")]
    Storage(String),
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Protocol(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Protocol(e.to_string())
    }
}

impl From<multifeed_wire::WireError> for FeedError {
    fn from(e: multifeed_wire::WireError) -> Self {
        match e {
            multifeed_wire::WireError::InvalidKey(key) => FeedError::InvalidKey(key),
            other => FeedError::Protocol(other.to_string()),
        }
    }
}

/// One feed's view of the shared transport.
///
/// Outbound bytes are wrapped in [`Frame::Feed`] and queued behind every
/// other frame of the session. Inbound bytes arrive in order; `recv` returns
/// `None` once the session stops routing to this feed.
#[derive(Debug)]
pub struct SubChannel {
    key: FeedKey,
    outbound: mpsc::Sender<Frame>,
    inbound: mpsc::Receiver<Vec<u8>>,
}

impl SubChannel {
    pub(crate) fn new(
        key: FeedKey,
        outbound: mpsc::Sender<Frame>,
        inbound: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            key,
            outbound,
            inbound,
        }
    }

    /// A sub-channel with no session behind it.
    ///
    /// Returns the channel, the receiver of its outbound frames and the
    /// sender for its inbound bytes. Useful for driving a [`Feed`] directly.
    pub fn detached(
        key: FeedKey,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Frame>, mpsc::Sender<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        (Self::new(key, out_tx, in_rx), out_rx, in_tx)
    }

    pub fn key(&self) -> FeedKey {
        self.key
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<(), FeedError> {
        self.outbound
            .send(Frame::Feed {
                key: self.key,
                data,
            })
            .await
            .map_err(|_| FeedError::Closed)
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

/// An append-only log that can replicate itself over a [`SubChannel`].
#[async_trait]
pub trait Feed: Send + Sync + fmt::Debug {
    fn key(&self) -> FeedKey;

    /// Resolves once the feed can replicate.
    async fn ready(&self) -> Result<(), FeedError>;

    /// Run one replication sub-stream to completion.
    ///
    /// Returning [`FeedError::Cancelled`] means nothing was applied.
    async fn replicate(&self, channel: SubChannel, opts: ReplicateOptions) -> Result<(), FeedError>;
}

/// Resolves keys into feeds, creating missing ones.
///
/// Implementations must serialize creation so that two concurrent resolves of
/// the same key yield the same feed.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Fetch or create the feed for `key`.
    async fn resolve(&self, key: &str) -> Result<Arc<dyn Feed>, FeedError>;

    /// Keys of every feed in the store.
    async fn local_keys(&self) -> Vec<String>;

    /// Register a connected session for live announcements.
    fn attach(&self, _handle: crate::MuxHandle) {}

    /// Forget a session registered with [`attach`](Self::attach).
    fn detach(&self, _session_id: &str) {}
}
