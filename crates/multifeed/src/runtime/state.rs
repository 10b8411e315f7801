//! Pure session state: no I/O, timers or tasks.
//!
//! Every handler takes one input (a frame, a command, a resolved batch, a
//! finished sub-stream, a timer) and returns the effects it implies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use multifeed_wire::{FeedKey, Frame};

use crate::error::MuxError;
use crate::extension::{ExtensionMessage, ExtensionRegistry};
use crate::feed::{Feed, FeedError, SubStreamOutcome};
use crate::handshake::{Handshake, HandshakeAction, HandshakeHeader};
use crate::manifest::ManifestExchange;
use crate::session::{BatchId, ReplicationRole, SessionManager, SubStreamState};

use super::effect::MuxEffect;
use super::{MuxCommand, MuxConfig, MuxEvent};

/// Inbound frames kept per key while its sub-stream is not running yet.
pub const MAX_BUFFERED_FRAMES: usize = 64;

/// A replicate batch whose feeds were resolved and awaited.
#[derive(Debug)]
pub struct ReadyBatch {
    pub id: BatchId,
    pub ready: Vec<Arc<dyn Feed>>,
    pub failed: Vec<(FeedKey, FeedError)>,
}

/// Everything one session knows.
pub struct MuxState {
    session_id: String,
    handshake_timeout: Duration,
    extensions: ExtensionRegistry,
    handshake: Handshake,
    manifest: ManifestExchange,
    sessions: SessionManager,
    /// Extension messages held back until the handshake completes.
    outbox: Vec<ExtensionMessage>,
    pending_inbound: HashMap<FeedKey, Vec<Vec<u8>>>,
    ready_waiters: Vec<oneshot::Sender<Result<HandshakeHeader, MuxError>>>,
    local_closed: bool,
    remote_closed: bool,
    remote_gone: bool,
    finished: bool,
    failure: Option<MuxError>,
}

impl MuxState {
    pub fn new(config: &MuxConfig, session_id: String) -> Self {
        let local = HandshakeHeader::local(config.user_data.clone(), config.header_extra.clone());
        Self {
            session_id,
            handshake_timeout: config.handshake_timeout,
            extensions: ExtensionRegistry::with_encoding(config.encoding),
            handshake: Handshake::new(&config.shared_key, local),
            manifest: ManifestExchange::new(),
            sessions: SessionManager::new(config.live),
            outbox: Vec::new(),
            pending_inbound: HashMap::new(),
            ready_waiters: Vec::new(),
            local_closed: false,
            remote_closed: false,
            remote_gone: false,
            finished: false,
            failure: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Open our side of the main channel.
    pub fn start(&mut self) -> Vec<MuxEffect> {
        vec![MuxEffect::SendFrame(self.handshake.open_frame())]
    }

    pub fn is_ready(&self) -> bool {
        self.handshake.is_ready()
    }

    /// Whether the handshake timer still matters.
    pub fn awaiting_handshake(&self) -> bool {
        self.handshake.is_pending() && !self.is_terminated()
    }

    /// Finished cleanly or failed.
    pub fn is_terminated(&self) -> bool {
        self.finished || self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&MuxError> {
        self.failure.as_ref()
    }

    pub fn known_feeds(&self) -> Vec<String> {
        self.manifest.known_feeds()
    }

    pub fn active_feeds(&self) -> Vec<String> {
        self.sessions.active_keys()
    }

    // ── Inbound frames ───────────────────────────────────────────────

    pub fn handle_frame(&mut self, frame: Frame) -> Vec<MuxEffect> {
        if self.is_terminated() {
            return Vec::new();
        }
        tracing::trace!("mux: inbound {} frame", frame.kind());

        match frame {
            Frame::Open { discovery_key } => {
                let actions = self.handshake.on_channel_open(&discovery_key);
                self.apply_handshake(actions)
            }
            Frame::Extension { id, payload } => match self.extensions.decode(id, &payload) {
                Ok(Some(msg)) => self.handle_extension(msg),
                Ok(None) => Vec::new(),
                Err(e) => self.fail(e),
            },
            Frame::Feed { key, data } => self.route_feed_data(key, data),
            Frame::Close => {
                tracing::debug!("mux: remote closed the main channel");
                self.remote_closed = true;
                self.sessions.on_remote_close();
                self.maybe_close()
            }
        }
    }

    fn handle_extension(&mut self, msg: ExtensionMessage) -> Vec<MuxEffect> {
        match msg {
            ExtensionMessage::Handshake(header) => {
                let actions = self.handshake.on_remote_header(header);
                self.apply_handshake(actions)
            }
            other if !self.handshake.is_ready() => self.fail(MuxError::ProtocolViolation {
                reason: format!("{} received before the handshake", other.kind().name()),
            }),
            ExtensionMessage::Manifest(manifest) => {
                tracing::debug!("mux: remote offered {} feeds", manifest.keys.len());
                self.manifest.on_manifest(&manifest);
                vec![MuxEffect::EmitManifest(manifest)]
            }
            ExtensionMessage::RequestFeeds(keys) => {
                let accepted = self.manifest.on_request(&keys);
                tracing::debug!(
                    "mux: remote requested {} feeds, replicating {}",
                    keys.len(),
                    accepted.len()
                );
                let mut effects = self.send_ext(ExtensionMessage::ReplicateFeeds(accepted.clone()));
                effects.extend(self.begin_batch(accepted, ReplicationRole::Responder));
                effects
            }
            ExtensionMessage::ReplicateFeeds(keys) => {
                self.sessions.on_ack_received();
                let accepted = self.manifest.on_replicate(&keys);
                tracing::debug!("mux: remote will replicate {} of our requested feeds", accepted.len());
                self.begin_batch(accepted, ReplicationRole::Requester)
            }
        }
    }

    fn apply_handshake(&mut self, actions: Vec<HandshakeAction>) -> Vec<MuxEffect> {
        let mut effects = Vec::new();
        for action in actions {
            match action {
                HandshakeAction::Send(header) => {
                    effects.extend(self.send_ext(ExtensionMessage::Handshake(header)));
                }
                HandshakeAction::Ready(header) => {
                    tracing::info!(
                        "mux: handshake complete (remote {} {})",
                        header.client,
                        header.version
                    );
                    for waiter in self.ready_waiters.drain(..) {
                        let _ = waiter.send(Ok(header.clone()));
                    }
                    effects.push(MuxEffect::Emit(MuxEvent::Ready(header)));
                    for msg in std::mem::take(&mut self.outbox) {
                        effects.extend(self.send_ext(msg));
                    }
                }
                HandshakeAction::Fail(err) => effects.extend(self.fail(err)),
            }
        }
        effects
    }

    fn route_feed_data(&mut self, key: FeedKey, data: Vec<u8>) -> Vec<MuxEffect> {
        let hex = key.to_hex();
        match self.sessions.state_of(&hex) {
            Some(SubStreamState::Active) => return vec![MuxEffect::DeliverFeedData { key, data }],
            // Withdrawn from the offer while resolving: still expected.
            Some(SubStreamState::Pending) => {}
            _ if self.manifest.is_offered(&hex) || self.manifest.is_wanted(&hex) => {}
            _ => {
                let err = MuxError::UnrequestedKeyOffered { key: hex };
                tracing::debug!(code = err.code(), "mux: dropping sub-stream bytes: {err}");
                return Vec::new();
            }
        }

        let buffered = self.pending_inbound.get(&key).map_or(0, Vec::len);
        if buffered >= MAX_BUFFERED_FRAMES {
            return self.fail(MuxError::BufferOverflow {
                key: hex,
                limit: MAX_BUFFERED_FRAMES,
            });
        }
        self.pending_inbound.entry(key).or_default().push(data);
        Vec::new()
    }

    // ── Commands ─────────────────────────────────────────────────────

    pub fn handle_command(&mut self, cmd: MuxCommand) -> Vec<MuxEffect> {
        match cmd {
            MuxCommand::Offer { keys, extra } => {
                let manifest = self.manifest.offer(keys, extra);
                tracing::debug!("mux: offering {} feeds", manifest.keys.len());
                self.queue_ext(ExtensionMessage::Manifest(manifest))
            }

            MuxCommand::Request { keys } => {
                if self.is_terminated() {
                    return Vec::new();
                }
                let keys = self.manifest.request(keys);
                tracing::debug!("mux: requesting {} feeds", keys.len());
                self.sessions.on_request_sent();
                self.queue_ext(ExtensionMessage::RequestFeeds(keys))
            }

            MuxCommand::Withdraw { key } => {
                if self.manifest.withdraw(&key) {
                    tracing::debug!("mux: withdrew {key} from our offer");
                }
                Vec::new()
            }

            MuxCommand::KnownFeeds { reply } => {
                let _ = reply.send(self.manifest.known_feeds());
                Vec::new()
            }

            MuxCommand::ActiveFeeds { reply } => {
                let _ = reply.send(self.sessions.active_keys());
                Vec::new()
            }

            MuxCommand::Ready { reply } => {
                if let Some(header) = self.handshake.remote_header() {
                    let _ = reply.send(Ok(header.clone()));
                } else if let Some(err) = &self.failure {
                    let _ = reply.send(Err(err.clone()));
                } else if self.finished {
                    let _ = reply.send(Err(MuxError::Closed));
                } else {
                    self.ready_waiters.push(reply);
                }
                Vec::new()
            }

            MuxCommand::Close => self.handle_close(),
        }
    }

    fn handle_close(&mut self) -> Vec<MuxEffect> {
        if self.is_terminated() {
            return Vec::new();
        }
        tracing::info!("mux: closing session");
        let mut effects = self.close_local();
        self.finished = true;
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(MuxError::Closed));
        }
        effects.push(MuxEffect::Finalize);
        effects
    }

    // ── Replication batches ──────────────────────────────────────────

    fn begin_batch(&mut self, keys: Vec<String>, role: ReplicationRole) -> Vec<MuxEffect> {
        let (id, keys) = self.sessions.begin_batch(keys, role);
        tracing::debug!("mux: batch {id} ({role:?}) resolving {} feeds", keys.len());
        vec![MuxEffect::ResolveBatch { id, keys, role }]
    }

    /// A batch was resolved and its feeds awaited. Releases the hold.
    pub fn handle_batch_ready(&mut self, batch: ReadyBatch) -> Vec<MuxEffect> {
        for (key, err) in &batch.failed {
            let err = MuxError::FeedResolution {
                key: key.to_hex(),
                reason: err.to_string(),
            };
            tracing::debug!(code = err.code(), "mux: skipping feed: {err}");
        }

        let mut feeds: HashMap<String, Arc<dyn Feed>> = batch
            .ready
            .into_iter()
            .map(|feed| (feed.key().to_hex(), feed))
            .collect();
        let ready_keys = feeds.keys().cloned().collect();

        let Some(outcome) = self.sessions.finish_batch(batch.id, ready_keys) else {
            return Vec::new();
        };

        if self.is_terminated() || self.remote_gone {
            for key in &outcome.start {
                self.sessions.on_substream_closed(key);
            }
            return Vec::new();
        }

        for key in &outcome.duplicates {
            tracing::debug!("mux: {key} is already replicating");
        }

        let mut effects = Vec::new();
        for key in outcome.start {
            if let Some(feed) = feeds.remove(&key) {
                let buffered = self
                    .pending_inbound
                    .remove(&feed.key())
                    .unwrap_or_default();
                effects.push(MuxEffect::StartSubStream { feed, buffered });
            }
        }

        if outcome.short_circuit {
            tracing::debug!("mux: nothing to replicate, closing the main channel");
            effects.extend(self.close_local());
        }
        effects.extend(self.maybe_close());
        effects
    }

    /// A sub-stream task finished.
    pub fn handle_substream_closed(
        &mut self,
        key: FeedKey,
        outcome: SubStreamOutcome,
    ) -> Vec<MuxEffect> {
        let hex = key.to_hex();
        if !self.sessions.on_substream_closed(&hex) {
            return Vec::new();
        }
        self.pending_inbound.remove(&key);
        tracing::debug!("mux: sub-stream {hex} ended: {outcome:?}");

        let mut effects = vec![MuxEffect::SubStreamClosed { key, outcome }];
        effects.extend(self.maybe_close());
        effects
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn handle_handshake_timeout(&mut self) -> Vec<MuxEffect> {
        if !self.awaiting_handshake() {
            return Vec::new();
        }
        self.fail(MuxError::HandshakeTimeout(self.handshake_timeout))
    }

    /// The remote ended the stream.
    pub fn handle_eof(&mut self) -> Vec<MuxEffect> {
        if self.is_terminated() || self.remote_gone {
            return Vec::new();
        }
        if !self.handshake.is_ready() {
            return self.fail(MuxError::Transport(
                "stream ended before the handshake completed".into(),
            ));
        }

        tracing::debug!("mux: remote ended the stream");
        self.remote_gone = true;
        self.remote_closed = true;
        self.sessions.on_remote_close();
        self.pending_inbound.clear();

        let mut effects = vec![MuxEffect::Drain];
        effects.extend(self.maybe_close());
        effects
    }

    /// Reading from the stream failed.
    pub fn handle_transport_error(&mut self, err: MuxError) -> Vec<MuxEffect> {
        if self.remote_gone {
            return Vec::new();
        }
        self.fail(err)
    }

    /// Writing to the stream failed. After a remote close this is expected
    /// and the reader will report the end of the stream.
    pub fn handle_writer_error(&mut self, err: MuxError) -> Vec<MuxEffect> {
        if self.remote_closed || self.remote_gone {
            tracing::debug!("mux: writer stopped after remote close: {err}");
            return Vec::new();
        }
        self.fail(err)
    }

    fn close_local(&mut self) -> Vec<MuxEffect> {
        if self.local_closed {
            return Vec::new();
        }
        self.local_closed = true;
        vec![MuxEffect::SendFrame(Frame::Close)]
    }

    fn maybe_close(&mut self) -> Vec<MuxEffect> {
        let mut effects = Vec::new();
        if self.is_terminated() {
            return effects;
        }
        if self.sessions.ready_to_finalize() {
            effects.extend(self.close_local());
        }
        if self.local_closed && self.remote_closed && self.sessions.is_idle() {
            tracing::info!("mux: both sides closed, finalizing");
            self.finished = true;
            effects.push(MuxEffect::Finalize);
        }
        effects
    }

    fn fail(&mut self, err: MuxError) -> Vec<MuxEffect> {
        if self.is_terminated() {
            return Vec::new();
        }
        tracing::warn!(code = err.code(), "mux: session failed: {err}");
        self.handshake.fail(err.clone());
        self.failure = Some(err.clone());
        for waiter in self.ready_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        vec![MuxEffect::Fail(err)]
    }

    // ── Extension helpers ────────────────────────────────────────────

    fn send_ext(&mut self, msg: ExtensionMessage) -> Vec<MuxEffect> {
        match self.extensions.encode(&msg) {
            Ok(frame) => vec![MuxEffect::SendFrame(frame)],
            Err(e) => self.fail(e),
        }
    }

    fn queue_ext(&mut self, msg: ExtensionMessage) -> Vec<MuxEffect> {
        if self.is_terminated() {
            return Vec::new();
        }
        if self.handshake.is_ready() {
            self.send_ext(msg)
        } else {
            self.outbox.push(msg);
            Vec::new()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    use super::*;
    use crate::feed::{ReplicateOptions, SubChannel};
    use crate::handshake::CLIENT_ID;

    #[derive(Debug)]
    struct StubFeed(FeedKey);

    #[async_trait]
    impl Feed for StubFeed {
        fn key(&self) -> FeedKey {
            self.0
        }

        async fn ready(&self) -> Result<(), FeedError> {
            Ok(())
        }

        async fn replicate(&self, _: SubChannel, _: ReplicateOptions) -> Result<(), FeedError> {
            Ok(())
        }
    }

    fn stub(seed: u8) -> Arc<dyn Feed> {
        Arc::new(StubFeed(FeedKey::from_bytes([seed; 32])))
    }

    fn hex(seed: u8) -> String {
        FeedKey::from_bytes([seed; 32]).to_hex()
    }

    fn state(id: &str) -> MuxState {
        MuxState::new(&MuxConfig::default(), id.into())
    }

    fn frames(effects: &[MuxEffect]) -> Vec<Frame> {
        effects
            .iter()
            .filter_map(|e| match e {
                MuxEffect::SendFrame(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    /// Deliver frames both ways until neither side has anything left to
    /// send. Returns the non-frame effects of each side.
    fn pump(
        a: &mut MuxState,
        b: &mut MuxState,
        mut to_b: Vec<Frame>,
        mut to_a: Vec<Frame>,
    ) -> (Vec<MuxEffect>, Vec<MuxEffect>) {
        let mut a_effects = Vec::new();
        let mut b_effects = Vec::new();
        while !to_a.is_empty() || !to_b.is_empty() {
            for frame in std::mem::take(&mut to_b) {
                for effect in b.handle_frame(frame) {
                    match effect {
                        MuxEffect::SendFrame(f) => to_a.push(f),
                        other => b_effects.push(other),
                    }
                }
            }
            for frame in std::mem::take(&mut to_a) {
                for effect in a.handle_frame(frame) {
                    match effect {
                        MuxEffect::SendFrame(f) => to_b.push(f),
                        other => a_effects.push(other),
                    }
                }
            }
        }
        (a_effects, b_effects)
    }

    fn connected() -> (MuxState, MuxState) {
        let mut a = state("a");
        let mut b = state("b");
        let to_b = frames(&a.start());
        let to_a = frames(&b.start());
        pump(&mut a, &mut b, to_b, to_a);
        assert!(a.is_ready() && b.is_ready());
        (a, b)
    }

    fn command(state: &mut MuxState, cmd: MuxCommand) -> Vec<Frame> {
        frames(&state.handle_command(cmd))
    }

    fn offer(keys: Vec<String>) -> MuxCommand {
        MuxCommand::Offer {
            keys,
            extra: Map::new(),
        }
    }

    fn request(keys: Vec<String>) -> MuxCommand {
        MuxCommand::Request { keys }
    }

    fn batches(effects: &[MuxEffect]) -> Vec<(BatchId, Vec<String>, ReplicationRole)> {
        effects
            .iter()
            .filter_map(|e| match e {
                MuxEffect::ResolveBatch { id, keys, role } => Some((*id, keys.clone(), *role)),
                _ => None,
            })
            .collect()
    }

    fn resolved(id: BatchId, ready: Vec<Arc<dyn Feed>>) -> ReadyBatch {
        ReadyBatch {
            id,
            ready,
            failed: Vec::new(),
        }
    }

    fn handshake_frame(version: &str) -> Frame {
        ExtensionRegistry::new()
            .encode(&ExtensionMessage::Handshake(HandshakeHeader {
                version: version.into(),
                client: CLIENT_ID.into(),
                user_data: Value::Null,
                extra: Map::new(),
            }))
            .unwrap()
    }

    #[test]
    fn start_opens_main_channel() {
        let mut a = state("a");
        let sent = frames(&a.start());
        assert!(matches!(&sent[..], [Frame::Open { .. }]));
        assert!(a.awaiting_handshake());
    }

    #[test]
    fn handshake_makes_both_sides_ready() {
        let mut a = state("a");
        let mut b = state("b");
        let to_b = frames(&a.start());
        let to_a = frames(&b.start());
        let (a_fx, b_fx) = pump(&mut a, &mut b, to_b, to_a);

        assert!(matches!(&a_fx[..], [MuxEffect::Emit(MuxEvent::Ready(h))] if h.client == CLIENT_ID));
        assert!(matches!(&b_fx[..], [MuxEffect::Emit(MuxEvent::Ready(_))]));
        assert!(!a.awaiting_handshake());
    }

    #[test]
    fn shared_key_mismatch_fails() {
        let mut a = state("a");
        let config = MuxConfig {
            shared_key: FeedKey::from_bytes([9; 32]),
            ..MuxConfig::default()
        };
        let mut b = MuxState::new(&config, "b".into());
        let open = frames(&b.start()).remove(0);

        let effects = a.handle_frame(open);
        assert!(matches!(&effects[..], [MuxEffect::Fail(MuxError::KeyMismatch)]));
        assert!(a.is_terminated());
        assert!(a.handle_frame(Frame::Close).is_empty(), "failed is terminal");
    }

    #[test]
    fn major_version_mismatch_fails() {
        let mut a = state("a");
        let mut b = state("b");
        a.handle_frame(frames(&b.start()).remove(0));

        let effects = a.handle_frame(handshake_frame("1.0.0"));
        assert!(matches!(
            &effects[..],
            [MuxEffect::Fail(MuxError::VersionMismatch { theirs, .. })] if theirs == "1.0.0"
        ));
    }

    #[test]
    fn minor_version_difference_is_fine() {
        let mut a = state("a");
        let mut b = state("b");
        a.handle_frame(frames(&b.start()).remove(0));

        let effects = a.handle_frame(handshake_frame("4.1.2"));
        assert!(matches!(&effects[..], [MuxEffect::Emit(MuxEvent::Ready(_))]));
    }

    #[test]
    fn offer_before_ready_is_held_back() {
        let mut a = state("a");
        let mut b = state("b");
        assert!(command(&mut a, offer(vec!["k".into()])).is_empty());

        let to_b = frames(&a.start());
        let to_a = frames(&b.start());
        let (_, b_fx) = pump(&mut a, &mut b, to_b, to_a);

        assert!(b_fx
            .iter()
            .any(|e| matches!(e, MuxEffect::EmitManifest(m) if m.keys == vec!["k".to_string()])));
    }

    #[test]
    fn manifest_before_handshake_is_a_violation() {
        let mut a = state("a");
        let mut b = state("b");
        a.handle_frame(frames(&b.start()).remove(0));

        let manifest = ExtensionRegistry::new()
            .encode(&ExtensionMessage::Manifest(crate::Manifest::new(vec!["x".into()])))
            .unwrap();
        let effects = a.handle_frame(manifest);
        assert!(matches!(
            &effects[..],
            [MuxEffect::Fail(MuxError::ProtocolViolation { .. })]
        ));
    }

    #[test]
    fn malformed_extension_is_fatal() {
        let (mut a, _b) = connected();
        let effects = a.handle_frame(Frame::Extension {
            id: 1,
            payload: b"not json".to_vec(),
        });
        assert!(matches!(
            &effects[..],
            [MuxEffect::Fail(MuxError::MalformedMessage { .. })]
        ));
    }

    #[test]
    fn unknown_extension_is_ignored() {
        let (mut a, _b) = connected();
        assert!(a
            .handle_frame(Frame::Extension {
                id: 99,
                payload: vec![1, 2, 3],
            })
            .is_empty());
        assert!(!a.is_terminated());
    }

    #[test]
    fn known_feeds_merges_both_offers() {
        let (mut a, mut b) = connected();
        let to_b = command(&mut a, offer(vec!["a".into(), "b".into()]));
        let to_a = command(&mut b, offer(vec!["c".into()]));
        pump(&mut a, &mut b, to_b, to_a);

        let (tx, mut rx) = oneshot::channel();
        a.handle_command(MuxCommand::KnownFeeds { reply: tx });
        assert_eq!(rx.try_recv().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn both_sides_agree_on_replicated_keys() {
        let (mut a, mut b) = connected();
        let to_b = command(&mut a, offer(vec![hex(1), hex(2)]));
        pump(&mut a, &mut b, to_b, Vec::new());

        let to_a = command(&mut b, request(vec![hex(2), hex(3), hex(1), hex(2)]));
        let (a_fx, b_fx) = pump(&mut a, &mut b, Vec::new(), to_a);

        let a_batches = batches(&a_fx);
        let b_batches = batches(&b_fx);
        assert_eq!(a_batches.len(), 1);
        assert_eq!(b_batches.len(), 1);
        assert_eq!(a_batches[0].1, vec![hex(1), hex(2)]);
        assert_eq!(a_batches[0].1, b_batches[0].1);
        assert_eq!(a_batches[0].2, ReplicationRole::Responder);
        assert_eq!(b_batches[0].2, ReplicationRole::Requester);
    }

    #[test]
    fn unoffered_request_opens_nothing() {
        let (mut a, mut b) = connected();
        let to_a = command(&mut b, request(vec![hex(7)]));
        let (a_fx, b_fx) = pump(&mut a, &mut b, Vec::new(), to_a);

        let (a_id, a_keys, _) = batches(&a_fx).remove(0);
        let (b_id, b_keys, _) = batches(&b_fx).remove(0);
        assert!(a_keys.is_empty());
        assert!(b_keys.is_empty());

        let a_starts = a.handle_batch_ready(resolved(a_id, vec![stub(7)]));
        let b_starts = b.handle_batch_ready(resolved(b_id, vec![stub(7)]));
        assert!(!a_starts
            .iter()
            .chain(b_starts.iter())
            .any(|e| matches!(e, MuxEffect::StartSubStream { .. })));
    }

    #[test]
    fn resolved_feed_starts_exactly_one_substream() {
        let (mut a, mut b) = connected();
        let to_b = command(&mut a, offer(vec![hex(1)]));
        pump(&mut a, &mut b, to_b, Vec::new());
        let to_a = command(&mut b, request(vec![hex(1)]));
        let (a_fx, _) = pump(&mut a, &mut b, Vec::new(), to_a);
        let (id, keys, _) = batches(&a_fx).remove(0);
        assert_eq!(keys, vec![hex(1)]);

        let effects = a.handle_batch_ready(resolved(id, vec![stub(1), stub(1)]));
        let starts = effects
            .iter()
            .filter(|e| matches!(e, MuxEffect::StartSubStream { .. }))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(a.active_feeds(), vec![hex(1)]);

        let closed = a.handle_substream_closed(FeedKey::from_bytes([1; 32]), SubStreamOutcome::Completed);
        assert!(matches!(&closed[0], MuxEffect::SubStreamClosed { .. }));
        assert!(a.active_feeds().is_empty());
        assert!(!a.is_terminated(), "closing a sub-stream leaves the session up");
    }

    #[test]
    fn duplicate_request_reuses_active_substream() {
        let (mut a, mut b) = connected();
        let to_b = command(&mut a, offer(vec![hex(1)]));
        pump(&mut a, &mut b, to_b, Vec::new());

        let to_a = command(&mut b, request(vec![hex(1)]));
        let (first, _) = pump(&mut a, &mut b, Vec::new(), to_a);
        let to_a = command(&mut b, request(vec![hex(1)]));
        let (second, _) = pump(&mut a, &mut b, Vec::new(), to_a);

        let (id1, _, _) = batches(&first).remove(0);
        let (id2, _, _) = batches(&second).remove(0);
        let starts: usize = [
            a.handle_batch_ready(resolved(id1, vec![stub(1)])),
            a.handle_batch_ready(resolved(id2, vec![stub(1)])),
        ]
        .iter()
        .flatten()
        .filter(|e| matches!(e, MuxEffect::StartSubStream { .. }))
        .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn bytes_for_wanted_key_are_buffered_until_start() {
        let (mut a, mut b) = connected();
        let to_b = command(&mut a, offer(vec![hex(4)]));
        pump(&mut a, &mut b, to_b, Vec::new());
        let to_a = command(&mut b, request(vec![hex(4)]));
        let (_, b_fx) = pump(&mut a, &mut b, Vec::new(), to_a);
        let (id, _, _) = batches(&b_fx).remove(0);

        let key = FeedKey::from_bytes([4; 32]);
        assert!(b
            .handle_frame(Frame::Feed {
                key,
                data: vec![1]
            })
            .is_empty());

        let effects = b.handle_batch_ready(resolved(id, vec![stub(4)]));
        assert!(effects.iter().any(
            |e| matches!(e, MuxEffect::StartSubStream { buffered, .. } if buffered == &vec![vec![1u8]])
        ));

        let routed = b.handle_frame(Frame::Feed {
            key,
            data: vec![2],
        });
        assert!(matches!(&routed[..], [MuxEffect::DeliverFeedData { data, .. }] if data == &vec![2u8]));
    }

    #[test]
    fn bytes_for_unknown_key_are_dropped() {
        let (mut a, _b) = connected();
        let key = FeedKey::from_bytes([8; 32]);
        assert!(a
            .handle_frame(Frame::Feed {
                key,
                data: vec![1]
            })
            .is_empty());
        assert!(a.pending_inbound.is_empty());
    }

    #[test]
    fn empty_bounded_session_closes_cleanly() {
        let (mut a, mut b) = connected();

        // Both sides offer nothing and request what the other offered.
        let to_b = command(&mut a, offer(vec![]));
        let to_a = command(&mut b, offer(vec![]));
        pump(&mut a, &mut b, to_b, to_a);
        let to_b = command(&mut a, request(vec![]));
        let to_a = command(&mut b, request(vec![]));
        let (a_fx, b_fx) = pump(&mut a, &mut b, to_b, to_a);

        let mut to_b = Vec::new();
        let mut to_a = Vec::new();
        let mut finalized = 0;
        for (id, _, _) in batches(&a_fx) {
            let fx = a.handle_batch_ready(resolved(id, Vec::new()));
            finalized += fx.iter().filter(|e| matches!(e, MuxEffect::Finalize)).count();
            to_b.extend(frames(&fx));
        }
        for (id, _, _) in batches(&b_fx) {
            let fx = b.handle_batch_ready(resolved(id, Vec::new()));
            finalized += fx.iter().filter(|e| matches!(e, MuxEffect::Finalize)).count();
            to_a.extend(frames(&fx));
        }
        assert!(to_b.contains(&Frame::Close));
        assert!(to_a.contains(&Frame::Close));

        let (a_rest, b_rest) = pump(&mut a, &mut b, to_b, to_a);
        finalized += a_rest
            .iter()
            .chain(b_rest.iter())
            .filter(|e| matches!(e, MuxEffect::Finalize))
            .count();
        assert_eq!(finalized, 2);
        assert!(a.is_terminated() && b.is_terminated());
        assert!(a.failure().is_none() && b.failure().is_none());
    }

    #[test]
    fn overflowing_the_early_buffer_fails_the_session() {
        let (mut a, mut b) = connected();
        let to_b = command(&mut a, offer(vec![hex(4)]));
        pump(&mut a, &mut b, to_b, Vec::new());
        // Wanted, but the acknowledgement never arrives.
        command(&mut b, request(vec![hex(4)]));

        let key = FeedKey::from_bytes([4; 32]);
        for i in 0..MAX_BUFFERED_FRAMES {
            assert!(b
                .handle_frame(Frame::Feed {
                    key,
                    data: vec![i as u8],
                })
                .is_empty());
        }

        let effects = b.handle_frame(Frame::Feed {
            key,
            data: vec![0xff],
        });
        assert!(matches!(
            &effects[..],
            [MuxEffect::Fail(MuxError::BufferOverflow { key: k, limit })]
                if *k == hex(4) && *limit == MAX_BUFFERED_FRAMES
        ));
        assert!(b.is_terminated());
    }

    #[test]
    fn offer_only_side_follows_the_requester_close() {
        let (mut a, mut b) = connected();
        let to_b = command(&mut a, offer(vec![hex(1)]));
        pump(&mut a, &mut b, to_b, Vec::new());
        let to_a = command(&mut b, request(vec![hex(1)]));
        let (a_fx, b_fx) = pump(&mut a, &mut b, Vec::new(), to_a);
        let (a_id, _, _) = batches(&a_fx).remove(0);
        let (b_id, _, _) = batches(&b_fx).remove(0);

        assert!(frames(&a.handle_batch_ready(resolved(a_id, vec![stub(1)]))).is_empty());
        assert!(frames(&b.handle_batch_ready(resolved(b_id, vec![stub(1)]))).is_empty());

        // The requester finishes first and closes.
        let key = FeedKey::from_bytes([1; 32]);
        let to_a = frames(&b.handle_substream_closed(key, SubStreamOutcome::Completed));
        assert_eq!(to_a, vec![Frame::Close]);
        assert!(
            a.handle_frame(Frame::Close).is_empty(),
            "the offering side still has a sub-stream running"
        );

        let effects = a.handle_substream_closed(key, SubStreamOutcome::Completed);
        assert!(frames(&effects).contains(&Frame::Close));
        assert!(matches!(effects.last(), Some(MuxEffect::Finalize)));
        assert!(b
            .handle_frame(Frame::Close)
            .iter()
            .any(|e| matches!(e, MuxEffect::Finalize)));
        assert!(a.is_terminated() && b.is_terminated());
        assert!(a.failure().is_none() && b.failure().is_none());
    }

    #[test]
    fn live_session_never_closes_on_its_own() {
        let config = MuxConfig {
            live: true,
            ..MuxConfig::default()
        };
        let mut a = MuxState::new(&config, "a".into());
        let mut b = MuxState::new(&config, "b".into());
        let to_b = frames(&a.start());
        let to_a = frames(&b.start());
        pump(&mut a, &mut b, to_b, to_a);

        let to_a = command(&mut b, request(vec![]));
        let (_, b_fx) = pump(&mut a, &mut b, Vec::new(), to_a);
        let (id, _, _) = batches(&b_fx).remove(0);
        let fx = b.handle_batch_ready(resolved(id, Vec::new()));
        assert!(frames(&fx).is_empty());
    }

    #[test]
    fn handshake_timeout_only_while_pending() {
        let mut a = state("a");
        a.start();
        let effects = a.handle_handshake_timeout();
        assert!(matches!(
            &effects[..],
            [MuxEffect::Fail(MuxError::HandshakeTimeout(d))] if *d == Duration::from_secs(10)
        ));

        let (mut ready, _b) = connected();
        assert!(ready.handle_handshake_timeout().is_empty());
    }

    #[test]
    fn eof_before_ready_fails_after_ready_drains() {
        let mut a = state("a");
        assert!(matches!(
            &a.handle_eof()[..],
            [MuxEffect::Fail(MuxError::Transport(_))]
        ));

        let (mut ready, _b) = connected();
        let effects = ready.handle_eof();
        assert!(matches!(&effects[..], [MuxEffect::Drain]));
        assert!(ready.handle_eof().is_empty());
        assert!(ready.handle_transport_error(MuxError::Closed).is_empty());
    }

    #[test]
    fn writer_error_after_remote_close_is_ignored() {
        let (mut a, _b) = connected();
        a.handle_frame(Frame::Close);
        assert!(a.handle_writer_error(MuxError::Transport("pipe".into())).is_empty());
        assert!(!a.is_terminated());
    }

    #[test]
    fn ready_waiters_before_and_after() {
        let mut a = state("a");
        let mut b = state("b");
        let (early_tx, mut early_rx) = oneshot::channel();
        a.handle_command(MuxCommand::Ready { reply: early_tx });

        let to_b = frames(&a.start());
        let to_a = frames(&b.start());
        pump(&mut a, &mut b, to_b, to_a);

        let (late_tx, mut late_rx) = oneshot::channel();
        a.handle_command(MuxCommand::Ready { reply: late_tx });

        assert_eq!(early_rx.try_recv().unwrap().unwrap().client, CLIENT_ID);
        assert_eq!(late_rx.try_recv().unwrap().unwrap().client, CLIENT_ID);
    }

    #[test]
    fn close_command_finalizes_and_fails_waiters() {
        let mut a = state("a");
        let (tx, mut rx) = oneshot::channel();
        a.handle_command(MuxCommand::Ready { reply: tx });

        let effects = a.handle_command(MuxCommand::Close);
        assert_eq!(frames(&effects), vec![Frame::Close]);
        assert!(matches!(effects.last(), Some(MuxEffect::Finalize)));
        assert_eq!(rx.try_recv().unwrap(), Err(MuxError::Closed));
        assert!(a.handle_command(MuxCommand::Close).is_empty());
    }

    #[test]
    fn failure_reaches_pending_waiters() {
        let mut a = state("a");
        let (tx, mut rx) = oneshot::channel();
        a.handle_command(MuxCommand::Ready { reply: tx });
        a.start();
        a.handle_handshake_timeout();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(MuxError::HandshakeTimeout(_))
        ));
    }
}
