//! Effect executor: the only place that touches I/O.
//!
//! Takes a list of MuxEffect and executes them concretely:
//! - SendFrame -> outbound frame channel (writer task)
//! - Emit / EmitManifest / ResolveBatch -> event channel
//! - StartSubStream -> spawned feed task, tracked until it ends
//! - DeliverFeedData -> the running sub-stream's inbound channel

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::Instrument;

use multifeed_wire::{FeedKey, Frame};

use crate::error::MuxError;
use crate::feed::{Feed, ReplicateOptions, SubChannel, SubStreamOutcome};
use crate::session::BatchId;

use super::effect::MuxEffect;
use super::state::ReadyBatch;
use super::{MuxEvent, MuxHandle, Requester, Resolver};

/// Inbound bytes queued per running sub-stream.
const SUBSTREAM_BUFFER: usize = 64;

/// Why the session loop stops.
#[derive(Debug)]
pub(super) enum Exit {
    Finished,
    Failed(MuxError),
}

pub(super) struct Executor {
    outbound: mpsc::Sender<Frame>,
    events: mpsc::Sender<MuxEvent>,
    handle: MuxHandle,
    options: ReplicateOptions,
    routes: HashMap<FeedKey, mpsc::Sender<Vec<u8>>>,
    aborts: HashMap<FeedKey, AbortHandle>,
    /// Batches waiting for the application to resolve them.
    pub(super) batches: FuturesUnordered<BoxFuture<'static, ReadyBatch>>,
    /// Running sub-streams, yielding their outcome when they end.
    pub(super) running: FuturesUnordered<BoxFuture<'static, (FeedKey, SubStreamOutcome)>>,
    draining: bool,
}

impl Executor {
    pub(super) fn new(
        outbound: mpsc::Sender<Frame>,
        events: mpsc::Sender<MuxEvent>,
        handle: MuxHandle,
        options: ReplicateOptions,
    ) -> Self {
        Self {
            outbound,
            events,
            handle,
            options,
            routes: HashMap::new(),
            aborts: HashMap::new(),
            batches: FuturesUnordered::new(),
            running: FuturesUnordered::new(),
            draining: false,
        }
    }

    pub(super) fn is_draining(&self) -> bool {
        self.draining
    }

    /// Draining and every sub-stream has ended.
    pub(super) fn is_drained(&self) -> bool {
        self.draining && self.running.is_empty()
    }

    /// Execute effects in order. Stops at the first effect that ends the
    /// session.
    pub(super) async fn execute(&mut self, effects: Vec<MuxEffect>) -> Option<Exit> {
        for effect in effects {
            match effect {
                MuxEffect::SendFrame(frame) => {
                    if self.outbound.send(frame).await.is_err() {
                        tracing::debug!("mux: writer gone, dropping frame");
                    }
                }

                MuxEffect::Emit(event) => self.emit(event).await,

                MuxEffect::EmitManifest(manifest) => {
                    let requester = Requester(self.handle.clone());
                    self.emit(MuxEvent::Manifest {
                        manifest,
                        requester,
                    })
                    .await;
                }

                MuxEffect::ResolveBatch { id, keys, role } => {
                    let (tx, rx) = oneshot::channel();
                    self.batches.push(resolve_batch(id, rx).boxed());
                    self.emit(MuxEvent::Replicate {
                        keys,
                        role,
                        resolver: Resolver { tx },
                    })
                    .await;
                }

                MuxEffect::StartSubStream { feed, buffered } => {
                    self.start_substream(feed, buffered).await;
                }

                MuxEffect::DeliverFeedData { key, data } => self.deliver(key, data),

                MuxEffect::SubStreamClosed { key, outcome } => {
                    self.routes.remove(&key);
                    self.aborts.remove(&key);
                    self.emit(MuxEvent::SubStreamClosed { key, outcome }).await;
                }

                MuxEffect::Drain => {
                    self.draining = true;
                    self.routes.clear();
                }

                MuxEffect::Finalize => return Some(Exit::Finished),

                MuxEffect::Fail(err) => {
                    self.emit(MuxEvent::Error(err.clone())).await;
                    return Some(Exit::Failed(err));
                }
            }
        }
        None
    }

    async fn start_substream(&mut self, feed: Arc<dyn Feed>, buffered: Vec<Vec<u8>>) {
        let key = feed.key();
        let (in_tx, in_rx) = mpsc::channel(SUBSTREAM_BUFFER.max(buffered.len()));
        for data in buffered {
            let _ = in_tx.try_send(data);
        }

        let channel = SubChannel::new(key, self.outbound.clone(), in_rx);
        let options = self.options;
        let span = tracing::debug_span!("substream", feed = %key);
        let task = tokio::spawn(async move { feed.replicate(channel, options).await }.instrument(span));

        self.aborts.insert(key, task.abort_handle());
        self.routes.insert(key, in_tx);
        self.running.push(
            async move {
                let outcome = match task.await {
                    Ok(result) => SubStreamOutcome::from(result),
                    Err(e) if e.is_cancelled() => SubStreamOutcome::Cancelled,
                    Err(e) => SubStreamOutcome::Failed(e.to_string()),
                };
                (key, outcome)
            }
            .boxed(),
        );

        tracing::debug!("mux: sub-stream {key} opened");
        self.emit(MuxEvent::SubStreamOpened { key }).await;
    }

    /// Hand inbound bytes to a running sub-stream without waiting on it.
    ///
    /// A sub-stream whose queue is full loses its route: it sees the end of
    /// its inbound channel and no later bytes reach it.
    fn deliver(&mut self, key: FeedKey, data: Vec<u8>) {
        let Some(route) = self.routes.get(&key) else {
            return;
        };
        match route.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("mux: sub-stream {key} is not keeping up, closing its inbound route");
                self.routes.remove(&key);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("mux: sub-stream {key} stopped reading");
                self.routes.remove(&key);
            }
        }
    }

    /// Abort every running sub-stream and report how each one ended.
    pub(super) async fn cancel_all(&mut self) {
        for (_, abort) in self.aborts.drain() {
            abort.abort();
        }
        self.routes.clear();
        while let Some((key, outcome)) = self.running.next().await {
            self.emit(MuxEvent::SubStreamClosed { key, outcome }).await;
        }
    }

    async fn emit(&mut self, event: MuxEvent) {
        if self.events.send(event).await.is_err() {
            tracing::trace!("mux: event receiver dropped");
        }
    }
}

/// Wait for the application's answer, then for every feed to be ready.
async fn resolve_batch(id: BatchId, rx: oneshot::Receiver<Vec<Arc<dyn Feed>>>) -> ReadyBatch {
    let feeds = rx.await.unwrap_or_default();
    let results = join_all(feeds.iter().map(|feed| feed.ready())).await;

    let mut ready = Vec::new();
    let mut failed = Vec::new();
    for (feed, result) in feeds.into_iter().zip(results) {
        match result {
            Ok(()) => ready.push(feed),
            Err(e) => failed.push((feed.key(), e)),
        }
    }
    ReadyBatch { id, ready, failed }
}
