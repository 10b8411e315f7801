//! In-memory feeds and a feed store built on them.

use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use multifeed_wire::FeedKey;

use crate::feed::{Feed, FeedError, FeedStore, ReplicateOptions, SubChannel};
use crate::keys::{is_feed_key, KeyLike};
use crate::runtime::MuxHandle;

/// Messages of the feed replication protocol.
#[derive(Debug, Serialize, Deserialize)]
enum FeedMessage {
    /// Number of entries the sender holds.
    Status { length: u64 },
    Data { index: u64, bytes: Vec<u8> },
    /// The sender has uploaded everything the remote was missing.
    Synced,
}

// ── MemoryFeed ───────────────────────────────────────────────────────

/// Append-only log held in memory.
///
/// A writer owns its key and accepts appends; a replica only grows through
/// replication.
#[derive(Debug)]
pub struct MemoryFeed {
    key: FeedKey,
    writable: bool,
    entries: RwLock<Vec<Vec<u8>>>,
    length: watch::Sender<u64>,
}

impl MemoryFeed {
    /// A new writable feed with a random key.
    pub fn writer() -> Self {
        Self::with_key(FeedKey::random(), true)
    }

    /// A read-only copy of someone else's feed.
    pub fn replica(key: FeedKey) -> Self {
        Self::with_key(key, false)
    }

    fn with_key(key: FeedKey, writable: bool) -> Self {
        let (length, _) = watch::channel(0);
        Self {
            key,
            writable,
            entries: RwLock::new(Vec::new()),
            length,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn len(&self) -> u64 {
        self.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u64) -> Option<Vec<u8>> {
        self.read().get(index as usize).cloned()
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.read().clone()
    }

    /// Append one entry. Returns its index.
    pub fn append(&self, data: impl Into<Vec<u8>>) -> Result<u64, FeedError> {
        if !self.writable {
            return Err(FeedError::Storage(format!("feed {} is read-only", self.key)));
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(data.into());
        let len = entries.len() as u64;
        drop(entries);
        self.length.send_replace(len);
        Ok(len - 1)
    }

    /// Store a replicated entry. Only the next index is accepted.
    fn put(&self, index: u64, data: Vec<u8>) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if index != entries.len() as u64 {
            return false;
        }
        entries.push(data);
        let len = entries.len() as u64;
        drop(entries);
        self.length.send_replace(len);
        true
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Vec<u8>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send every entry from `from` on. Returns the remote length afterwards.
    async fn upload(&self, channel: &SubChannel, from: u64) -> Result<u64, FeedError> {
        let missing: Vec<(u64, Vec<u8>)> = {
            let entries = self.read();
            entries
                .iter()
                .enumerate()
                .skip(from as usize)
                .map(|(i, e)| (i as u64, e.clone()))
                .collect()
        };

        let mut remote_len = from;
        for (index, bytes) in missing {
            send(channel, &FeedMessage::Data { index, bytes }).await?;
            remote_len = index + 1;
        }
        Ok(remote_len)
    }
}

async fn send(channel: &SubChannel, msg: &FeedMessage) -> Result<(), FeedError> {
    channel.send(rmp_serde::to_vec(msg)?).await
}

#[async_trait]
impl Feed for MemoryFeed {
    fn key(&self) -> FeedKey {
        self.key
    }

    async fn ready(&self) -> Result<(), FeedError> {
        Ok(())
    }

    async fn replicate(&self, mut channel: SubChannel, opts: ReplicateOptions) -> Result<(), FeedError> {
        let mut lengths = self.length.subscribe();
        send(&channel, &FeedMessage::Status { length: self.len() }).await?;

        let mut remote_len: Option<u64> = None;
        let mut local_synced = false;
        let mut remote_synced = false;

        loop {
            tokio::select! {
                inbound = channel.recv() => {
                    let Some(bytes) = inbound else {
                        return if !opts.live && local_synced && remote_synced {
                            Ok(())
                        } else {
                            Err(FeedError::Cancelled)
                        };
                    };

                    match rmp_serde::from_slice::<FeedMessage>(&bytes)? {
                        FeedMessage::Status { length } => {
                            let known = remote_len.unwrap_or(0).max(length);
                            remote_len = Some(if opts.upload {
                                self.upload(&channel, known).await?
                            } else {
                                known
                            });
                            if !local_synced {
                                send(&channel, &FeedMessage::Synced).await?;
                                local_synced = true;
                            }
                        }
                        FeedMessage::Data { index, bytes } => {
                            if opts.download && !self.writable && !self.put(index, bytes) {
                                tracing::trace!("feed: {} ignoring entry {index}", self.key);
                            }
                            remote_len = Some(remote_len.unwrap_or(0).max(index + 1));
                        }
                        FeedMessage::Synced => remote_synced = true,
                    }
                }

                changed = lengths.changed(), if opts.live && opts.upload && remote_len.is_some() => {
                    if changed.is_err() {
                        return Err(FeedError::Closed);
                    }
                    let from = remote_len.unwrap_or(0);
                    remote_len = Some(self.upload(&channel, from).await?);
                }
            }

            if !opts.live && local_synced && remote_synced {
                return Ok(());
            }
        }
    }
}

// ── MemoryStore ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StoreInner {
    /// Name → feed, in creation order.
    feeds: Vec<(String, Arc<MemoryFeed>)>,
    next_index: u64,
}

/// A collection of in-memory feeds shared by any number of sessions.
///
/// Creation is serialized by a writer lock, so a local `writer` call and a
/// remote-driven `resolve` never create two feeds for one key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    writer_lock: tokio::sync::Mutex<()>,
    peers: Mutex<Vec<MuxHandle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The local writable feed called `name`, created on first use.
    pub async fn writer(&self, name: &str) -> Arc<MemoryFeed> {
        let _guard = self.writer_lock.lock().await;
        if let Some(feed) = self.feed_by_name(name) {
            return feed;
        }
        let feed = Arc::new(MemoryFeed::writer());
        tracing::debug!("store: created writer {name} ({})", feed.key);
        self.insert(name.to_string(), feed.clone()).await;
        feed
    }

    /// Every feed, in creation order.
    pub fn feeds(&self) -> Vec<Arc<MemoryFeed>> {
        self.read().feeds.iter().map(|(_, f)| f.clone()).collect()
    }

    /// The feed with `key`, in any case or encoding [`KeyLike`] accepts.
    pub fn feed<K: KeyLike>(&self, key: K) -> Option<Arc<MemoryFeed>> {
        let key = key.to_key()?;
        self.read()
            .feeds
            .iter()
            .find(|(_, f)| f.key.to_hex() == key)
            .map(|(_, f)| f.clone())
    }

    pub fn feed_by_name(&self, name: &str) -> Option<Arc<MemoryFeed>> {
        self.read()
            .feeds
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f.clone())
    }

    /// Remove a feed by name or key and stop offering it to connected peers.
    pub async fn remove_feed(&self, name_or_key: &str) -> bool {
        let _guard = self.writer_lock.lock().await;
        let needle = name_or_key.to_ascii_lowercase();
        let removed = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let position = inner
                .feeds
                .iter()
                .position(|(n, f)| n == name_or_key || f.key.to_hex() == needle);
            position.map(|i| inner.feeds.remove(i).1)
        };

        let Some(feed) = removed else {
            return false;
        };
        for peer in self.peers() {
            let _ = peer.withdraw(feed.key).await;
        }
        true
    }

    /// Close every session attached to this store.
    pub async fn close(&self) {
        for peer in self.peers() {
            peer.close().await;
        }
    }

    async fn insert(&self, name: String, feed: Arc<MemoryFeed>) {
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.feeds.push((name, feed.clone()));
        }
        self.announce(feed.key.to_hex()).await;
    }

    /// Offer a new feed to every attached peer that does not know it yet.
    async fn announce(&self, key: String) {
        for peer in self.peers() {
            if peer.known_feeds().await.contains(&key) {
                continue;
            }
            tracing::debug!("store: announcing {key} to session {}", peer.session_id());
            let _ = peer.offer([key.as_str()]).await;
        }
    }

    fn next_name(&self) -> String {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        loop {
            let name = inner.next_index.to_string();
            inner.next_index += 1;
            if !inner.feeds.iter().any(|(n, _)| *n == name) {
                return name;
            }
        }
    }

    fn peers(&self) -> Vec<MuxHandle> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn resolve(&self, key: &str) -> Result<Arc<dyn Feed>, FeedError> {
        if !is_feed_key(key) {
            return Err(FeedError::InvalidKey(key.to_string()));
        }
        let feed_key: FeedKey = key.parse()?;

        let _guard = self.writer_lock.lock().await;
        if let Some(feed) = self.feed(feed_key) {
            return Ok(feed as Arc<dyn Feed>);
        }

        let feed = Arc::new(MemoryFeed::replica(feed_key));
        let name = self.next_name();
        tracing::debug!("store: created replica {name} for {feed_key}");
        self.insert(name, feed.clone()).await;
        Ok(feed as Arc<dyn Feed>)
    }

    async fn local_keys(&self) -> Vec<String> {
        self.feeds().iter().map(|f| f.key.to_hex()).collect()
    }

    fn attach(&self, handle: MuxHandle) {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if !peers.iter().any(|p| p.session_id() == handle.session_id()) {
            peers.push(handle);
        }
    }

    fn detach(&self, session_id: &str) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|p| p.session_id() != session_id);
    }
}
