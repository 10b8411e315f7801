//! Multiplexer runtime: one tokio task per connection.
//!
//! Architecture:
//! - [`MuxState`]: pure protocol logic, every handler returns effects
//! - [`MuxEffect`]: what must happen as a consequence of a handler
//! - executor: the only place that touches I/O
//! - loop: `tokio::select!` over frames, commands, batch resolutions,
//!   sub-stream completions and the handshake timer

mod effect;
mod executor;
mod r#loop;
mod state;

pub use effect::MuxEffect;
pub use state::{MuxState, ReadyBatch, MAX_BUFFERED_FRAMES};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use multifeed_wire::{FeedKey, WireConfig};

use crate::error::MuxError;
use crate::extension::Encoding;
use crate::feed::{Feed, ReplicateOptions, SubStreamOutcome};
use crate::handshake::HandshakeHeader;
use crate::keys::{extract_keys, KeyLike};
use crate::manifest::Manifest;
use crate::session::ReplicationRole;

/// Shared key used when none is configured. Anyone can join sessions
/// opened with it.
pub const DEFAULT_SHARED_KEY: FeedKey = FeedKey::from_bytes([
    0xbe, 0xe8, 0x0f, 0xf3, 0xa4, 0xee, 0x5e, 0x72, 0x7d, 0xc4, 0x41, 0x97, 0xcb, 0x9d, 0x25, 0xbf,
    0x8f, 0x19, 0xd5, 0x0b, 0x0f, 0x3a, 0xd2, 0x98, 0x4c, 0xfe, 0x5b, 0x7d, 0x14, 0xe7, 0x5d, 0xe7,
]);

// ── MuxConfig ────────────────────────────────────────────────────────

/// Configuration for one multiplexed session.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Whether this side opened the connection.
    pub initiator: bool,
    /// Pre-shared key; both peers must use the same one.
    pub shared_key: FeedKey,
    /// Keep sub-streams open for new data instead of finishing.
    pub live: bool,
    pub upload: bool,
    pub download: bool,
    /// Fail the session if the remote has not completed the handshake by then.
    pub handshake_timeout: Duration,
    /// Opaque value announced as `userData` in the handshake.
    pub user_data: Value,
    /// Extra fields merged into the handshake header.
    pub header_extra: Map<String, Value>,
    /// Codec of the extension payloads.
    pub encoding: Encoding,
    pub wire: WireConfig,
    /// Tag for log lines. Random when unset.
    pub session_id: Option<String>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            initiator: false,
            shared_key: DEFAULT_SHARED_KEY,
            live: false,
            upload: true,
            download: true,
            handshake_timeout: Duration::from_secs(10),
            user_data: Value::Null,
            header_extra: Map::new(),
            encoding: Encoding::Json,
            wire: WireConfig::default(),
            session_id: None,
        }
    }
}

impl MuxConfig {
    /// Options handed to every feed this session replicates.
    pub fn replicate_options(&self) -> ReplicateOptions {
        ReplicateOptions {
            live: self.live,
            upload: self.upload,
            download: self.download,
            initiator: self.initiator,
        }
    }
}

// ── Commands (app → runtime) ─────────────────────────────────────────

/// Commands sent to the session task through a [`MuxHandle`].
#[derive(Debug)]
pub enum MuxCommand {
    /// Offer keys to the remote, with extra manifest fields.
    Offer {
        keys: Vec<String>,
        extra: Map<String, Value>,
    },
    /// Ask the remote for keys it offered.
    Request { keys: Vec<String> },
    /// Stop offering a key.
    Withdraw { key: String },
    /// Union of local and remote offers.
    KnownFeeds { reply: oneshot::Sender<Vec<String>> },
    /// Keys with a running sub-stream.
    ActiveFeeds { reply: oneshot::Sender<Vec<String>> },
    /// Resolve once the handshake completed (or failed).
    Ready {
        reply: oneshot::Sender<Result<HandshakeHeader, MuxError>>,
    },
    /// Close the main channel and end the session.
    Close,
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Events emitted by the session task.
#[derive(Debug)]
pub enum MuxEvent {
    /// The remote header was accepted.
    Ready(HandshakeHeader),
    /// The remote offered keys. Use `requester` to ask for any of them.
    Manifest {
        manifest: Manifest,
        requester: Requester,
    },
    /// Feeds for `keys` are needed. Hand them to `resolver`.
    Replicate {
        keys: Vec<String>,
        role: ReplicationRole,
        resolver: Resolver,
    },
    SubStreamOpened {
        key: FeedKey,
    },
    SubStreamClosed {
        key: FeedKey,
        outcome: SubStreamOutcome,
    },
    /// Fatal error; the session is being torn down.
    Error(MuxError),
}

/// One-shot answer to a [`MuxEvent::Replicate`].
///
/// Dropping it unresolved counts as resolving no feeds.
pub struct Resolver {
    tx: oneshot::Sender<Vec<Arc<dyn Feed>>>,
}

impl Resolver {
    pub fn resolve(self, feeds: Vec<Arc<dyn Feed>>) {
        let _ = self.tx.send(feeds);
    }

    /// Resolve with feeds of one concrete type.
    pub fn resolve_with<F, I>(self, feeds: I)
    where
        F: Feed + 'static,
        I: IntoIterator<Item = Arc<F>>,
    {
        self.resolve(
            feeds
                .into_iter()
                .map(|feed| feed as Arc<dyn Feed>)
                .collect(),
        )
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

/// Request callback bound to the session a manifest came from.
#[derive(Debug, Clone)]
pub struct Requester(MuxHandle);

impl Requester {
    pub async fn request<I>(&self, keys: I) -> Result<(), MuxError>
    where
        I: IntoIterator,
        I::Item: KeyLike,
    {
        self.0.request(keys).await
    }
}

// ── MuxHandle (app-facing API) ───────────────────────────────────────

/// Handle to a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MuxHandle {
    cmd_tx: mpsc::Sender<MuxCommand>,
    session_id: Arc<str>,
}

impl MuxHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send(&self, cmd: MuxCommand) -> Result<(), MuxError> {
        self.cmd_tx.send(cmd).await.map_err(|_| MuxError::Closed)
    }

    /// Offer keys to the remote.
    pub async fn offer<I>(&self, keys: I) -> Result<(), MuxError>
    where
        I: IntoIterator,
        I::Item: KeyLike,
    {
        self.offer_with(keys, Map::new()).await
    }

    /// Offer keys with extra manifest fields.
    pub async fn offer_with<I>(&self, keys: I, extra: Map<String, Value>) -> Result<(), MuxError>
    where
        I: IntoIterator,
        I::Item: KeyLike,
    {
        self.send(MuxCommand::Offer {
            keys: extract_keys(keys),
            extra,
        })
        .await
    }

    /// Ask the remote for keys.
    pub async fn request<I>(&self, keys: I) -> Result<(), MuxError>
    where
        I: IntoIterator,
        I::Item: KeyLike,
    {
        self.send(MuxCommand::Request {
            keys: extract_keys(keys),
        })
        .await
    }

    /// Stop offering `key`. Running sub-streams are not affected.
    pub async fn withdraw<K: KeyLike>(&self, key: K) -> Result<(), MuxError> {
        match key.to_key() {
            Some(key) => self.send(MuxCommand::Withdraw { key }).await,
            None => Ok(()),
        }
    }

    pub async fn known_feeds(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        let _ = self.send(MuxCommand::KnownFeeds { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    pub async fn active_feeds(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        let _ = self.send(MuxCommand::ActiveFeeds { reply: tx }).await;
        rx.await.unwrap_or_default()
    }

    /// Wait for the handshake. Returns the remote header.
    ///
    /// Works whether called before or after the handshake completed.
    pub async fn ready(&self) -> Result<HandshakeHeader, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.send(MuxCommand::Ready { reply: tx }).await?;
        rx.await.map_err(|_| MuxError::Closed)?
    }

    /// Close the main channel and end the session.
    pub async fn close(&self) {
        let _ = self.send(MuxCommand::Close).await;
    }
}

// ── MuxChannels ──────────────────────────────────────────────────────

/// Returned to the application when a session starts.
pub struct MuxChannels {
    pub handle: MuxHandle,
    pub events: mpsc::Receiver<MuxEvent>,
    /// Resolves when the session ends; `Err` carries the fatal error.
    pub task: JoinHandle<Result<(), MuxError>>,
}

// ── Multiplexer ──────────────────────────────────────────────────────

/// Spawns sessions.
pub struct Multiplexer;

impl Multiplexer {
    /// Start a session over `stream`.
    ///
    /// Takes ownership of the stream and spawns the session loop.
    pub fn spawn<T>(stream: T, config: MuxConfig) -> MuxChannels
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id: Arc<str> = match &config.session_id {
            Some(id) => id.as_str().into(),
            None => uuid::Uuid::new_v4().to_string().into(),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel::<MuxCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<MuxEvent>(256);

        let handle = MuxHandle {
            cmd_tx,
            session_id: session_id.clone(),
        };

        let span = tracing::info_span!("mux", session = %session_id);
        if config.shared_key == DEFAULT_SHARED_KEY {
            span.in_scope(|| {
                tracing::warn!("mux: no shared key configured, using the public default");
            });
        }

        let state = MuxState::new(&config, session_id.to_string());
        let task = tokio::spawn(
            r#loop::mux_loop(stream, config, state, handle.clone(), cmd_rx, event_tx)
                .instrument(span),
        );

        MuxChannels {
            handle,
            events: event_rx,
            task,
        }
    }
}
