//! Standard wiring between a session and a [`FeedStore`].
//!
//! Offers every local key once the handshake completes, requests every key
//! the remote offers, and resolves replicate batches through the store.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::MuxError;
use crate::feed::{Feed, FeedStore};
use crate::runtime::{MuxChannels, MuxConfig, MuxEvent, MuxHandle, Multiplexer, Resolver};

/// A session replicating a store with one peer.
pub struct ReplicationSession {
    pub handle: MuxHandle,
    task: JoinHandle<Result<(), MuxError>>,
}

impl ReplicationSession {
    /// Wait for the session to end.
    pub async fn finished(self) -> Result<(), MuxError> {
        self.task
            .await
            .map_err(|e| MuxError::Transport(format!("session task failed: {e}")))?
    }
}

/// Replicate every feed of `store` with the peer on the other end of `stream`.
pub fn replicate<S, T>(store: Arc<S>, stream: T, config: MuxConfig) -> ReplicationSession
where
    S: FeedStore + ?Sized + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let channels = Multiplexer::spawn(stream, config);
    let handle = channels.handle.clone();
    let span = tracing::debug_span!("replicate", session = %handle.session_id());
    let task = tokio::spawn(drive(store, channels).instrument(span));
    ReplicationSession { handle, task }
}

async fn drive<S>(store: Arc<S>, channels: MuxChannels) -> Result<(), MuxError>
where
    S: FeedStore + ?Sized + 'static,
{
    let MuxChannels {
        handle,
        mut events,
        task,
    } = channels;

    while let Some(event) = events.recv().await {
        match event {
            MuxEvent::Ready(header) => {
                tracing::debug!("store: peer ready ({} {})", header.client, header.version);
                store.attach(handle.clone());
                let keys = store.local_keys().await;
                if handle.offer(keys).await.is_err() {
                    break;
                }
            }

            MuxEvent::Manifest {
                manifest,
                requester,
            } => {
                if requester.request(manifest.keys).await.is_err() {
                    break;
                }
            }

            MuxEvent::Replicate {
                keys,
                role,
                resolver,
            } => {
                tracing::debug!("store: resolving {} feeds ({role:?})", keys.len());
                tokio::spawn(resolve(store.clone(), keys, resolver).in_current_span());
            }

            MuxEvent::SubStreamOpened { key } => {
                tracing::trace!("store: replicating {key}");
            }

            MuxEvent::SubStreamClosed { key, outcome } => {
                tracing::trace!("store: finished {key}: {outcome:?}");
            }

            MuxEvent::Error(err) => {
                tracing::debug!("store: session error: {err}");
            }
        }
    }

    store.detach(handle.session_id());
    task.await
        .map_err(|e| MuxError::Transport(format!("session task failed: {e}")))?
}

/// Resolve a batch, skipping keys the store cannot materialize.
async fn resolve<S>(store: Arc<S>, keys: Vec<String>, resolver: Resolver)
where
    S: FeedStore + ?Sized,
{
    let results = join_all(keys.iter().map(|key| store.resolve(key))).await;

    let mut feeds: Vec<Arc<dyn Feed>> = Vec::with_capacity(keys.len());
    for (key, result) in keys.iter().zip(results) {
        match result {
            Ok(feed) => feeds.push(feed),
            Err(e) => {
                let err = MuxError::FeedResolution {
                    key: key.clone(),
                    reason: e.to_string(),
                };
                tracing::debug!(code = err.code(), "store: {err}");
            }
        }
    }
    resolver.resolve(feeds);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn session_with_itself_over_a_duplex_pair() {
        let left = Arc::new(MemoryStore::new());
        let right = Arc::new(MemoryStore::new());
        let feed = left.writer("local").await;
        feed.append("hello").unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let a = replicate(left.clone(), a, MuxConfig {
            initiator: true,
            ..MuxConfig::default()
        });
        let b = replicate(right.clone(), b, MuxConfig::default());

        let (ra, rb) = tokio::join!(a.finished(), b.finished());
        ra.unwrap();
        rb.unwrap();

        let copy = right.feed(feed.key()).expect("replica created");
        assert_eq!(copy.entries(), vec![b"hello".to_vec()]);
    }
}
