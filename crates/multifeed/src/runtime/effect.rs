use std::sync::Arc;

use multifeed_wire::{FeedKey, Frame};

use crate::error::MuxError;
use crate::feed::{Feed, SubStreamOutcome};
use crate::manifest::Manifest;
use crate::session::{BatchId, ReplicationRole};

use super::MuxEvent;

/// Intention produced by the pure logic of [`MuxState`](super::MuxState).
///
/// The executor turns these into frames, events and tasks.
#[derive(Debug)]
pub enum MuxEffect {
    /// Queue a frame on the shared stream.
    SendFrame(Frame),

    /// Emit an event to the application.
    Emit(MuxEvent),

    /// Emit a manifest event with a request callback bound to this session.
    EmitManifest(Manifest),

    /// Ask the application to resolve feeds for a batch, then wait until
    /// they are ready.
    ResolveBatch {
        id: BatchId,
        keys: Vec<String>,
        role: ReplicationRole,
    },

    /// Fold a ready feed into the shared stream. `buffered` holds bytes
    /// that arrived for it before the sub-stream existed.
    StartSubStream {
        feed: Arc<dyn Feed>,
        buffered: Vec<Vec<u8>>,
    },

    /// Hand inbound bytes to a running sub-stream.
    DeliverFeedData { key: FeedKey, data: Vec<u8> },

    /// A sub-stream ended; drop its route and tell the application.
    SubStreamClosed {
        key: FeedKey,
        outcome: SubStreamOutcome,
    },

    /// The remote ended the stream: stop routing inbound bytes and let the
    /// running sub-streams wind down.
    Drain,

    /// Both sides closed and nothing is in flight: end the session.
    Finalize,

    /// Fatal error: tear the session down.
    Fail(MuxError),
}
