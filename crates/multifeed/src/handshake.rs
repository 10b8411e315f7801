//! Main-channel handshake.
//!
//! Each side opens the main channel with the discovery key of the shared
//! key. When the remote `Open` arrives and matches, the local header is
//! sent; when the remote header arrives it is checked exactly once for a
//! compatible major version and an identical client id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use multifeed_wire::{discovery_key, FeedKey, Frame};

use crate::error::MuxError;

/// Protocol version announced in every handshake.
pub const PROTOCOL_VERSION: &str = "4.0.0";

/// Client id announced in every handshake.
pub const CLIENT_ID: &str = "MULTIFEED";

/// Payload of the handshake extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeHeader {
    pub version: String,
    pub client: String,
    #[serde(rename = "userData", default)]
    pub user_data: Value,
    /// Application fields merged into the header.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HandshakeHeader {
    /// Header describing this implementation.
    ///
    /// `extra` never overrides the version or client fields.
    pub fn local(user_data: Value, mut extra: Map<String, Value>) -> Self {
        for reserved in ["version", "client", "userData"] {
            extra.remove(reserved);
        }
        Self {
            version: PROTOCOL_VERSION.to_string(),
            client: CLIENT_ID.to_string(),
            user_data,
            extra,
        }
    }
}

/// Whether two semver strings share a major component.
///
/// Unparseable versions are never compatible.
pub fn compatible_versions(a: &str, b: &str) -> bool {
    match (major_of(a), major_of(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn major_of(version: &str) -> Option<u64> {
    version.split('.').next()?.trim().parse().ok()
}

/// Where the handshake stands.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeState {
    AwaitingChannelOpen,
    AwaitingRemoteHandshake,
    Ready(HandshakeHeader),
    Failed(MuxError),
}

/// What the caller must do after feeding the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeAction {
    /// Send our header over the handshake extension.
    Send(HandshakeHeader),
    /// The remote header was accepted.
    Ready(HandshakeHeader),
    /// The handshake failed; tear the session down.
    Fail(MuxError),
}

/// Handshake state machine. Pure: no I/O, no timers.
#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    local: HandshakeHeader,
    discovery_key: [u8; 32],
}

impl Handshake {
    pub fn new(shared_key: &FeedKey, local: HandshakeHeader) -> Self {
        Self {
            state: HandshakeState::AwaitingChannelOpen,
            local,
            discovery_key: discovery_key(shared_key),
        }
    }

    /// Frame that opens our side of the main channel.
    pub fn open_frame(&self) -> Frame {
        Frame::Open {
            discovery_key: self.discovery_key,
        }
    }

    /// The remote opened the main channel.
    pub fn on_channel_open(&mut self, remote_discovery_key: &[u8; 32]) -> Vec<HandshakeAction> {
        if !matches!(self.state, HandshakeState::AwaitingChannelOpen) {
            tracing::debug!("handshake: ignoring duplicate channel open");
            return Vec::new();
        }

        if remote_discovery_key != &self.discovery_key {
            return self.fail(MuxError::KeyMismatch);
        }

        self.state = HandshakeState::AwaitingRemoteHandshake;
        vec![HandshakeAction::Send(self.local.clone())]
    }

    /// The remote header arrived.
    pub fn on_remote_header(&mut self, header: HandshakeHeader) -> Vec<HandshakeAction> {
        match self.state {
            HandshakeState::AwaitingRemoteHandshake => {}
            HandshakeState::AwaitingChannelOpen => {
                return self.fail(MuxError::ProtocolViolation {
                    reason: "handshake received before channel open".into(),
                });
            }
            HandshakeState::Ready(_) | HandshakeState::Failed(_) => {
                tracing::debug!("handshake: ignoring repeated remote header");
                return Vec::new();
            }
        }

        if !compatible_versions(&header.version, &self.local.version) {
            return self.fail(MuxError::VersionMismatch {
                ours: self.local.version.clone(),
                theirs: header.version,
            });
        }

        if header.client != self.local.client {
            return self.fail(MuxError::ClientMismatch {
                ours: self.local.client.clone(),
                theirs: header.client,
            });
        }

        self.state = HandshakeState::Ready(header.clone());
        vec![HandshakeAction::Ready(header)]
    }

    /// Fail from outside, e.g. on timeout. No-op once terminal.
    pub fn fail(&mut self, err: MuxError) -> Vec<HandshakeAction> {
        if matches!(self.state, HandshakeState::Ready(_) | HandshakeState::Failed(_)) {
            return Vec::new();
        }
        self.state = HandshakeState::Failed(err.clone());
        vec![HandshakeAction::Fail(err)]
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandshakeState::Ready(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::AwaitingChannelOpen | HandshakeState::AwaitingRemoteHandshake
        )
    }

    /// The accepted remote header, once ready.
    pub fn remote_header(&self) -> Option<&HandshakeHeader> {
        match &self.state {
            HandshakeState::Ready(header) => Some(header),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> FeedKey {
        FeedKey::from_bytes([5; 32])
    }

    fn header(version: &str, client: &str) -> HandshakeHeader {
        HandshakeHeader {
            version: version.into(),
            client: client.into(),
            user_data: Value::Null,
            extra: Map::new(),
        }
    }

    fn opened() -> Handshake {
        let mut hs = Handshake::new(&shared(), HandshakeHeader::local(Value::Null, Map::new()));
        let dk = discovery_key(&shared());
        assert_eq!(hs.on_channel_open(&dk).len(), 1);
        hs
    }

    #[test]
    fn version_compatibility_uses_major() {
        assert!(compatible_versions("4.0.0", "4.1.2"));
        assert!(compatible_versions("4.0.0", "4.0.0"));
        assert!(!compatible_versions("1.0.0", "2.0.0"));
        assert!(!compatible_versions("x.0.0", "4.0.0"));
        assert!(!compatible_versions("", "4.0.0"));
    }

    #[test]
    fn local_header_keeps_reserved_fields() {
        let mut extra = Map::new();
        extra.insert("version".into(), Value::from("9.9.9"));
        extra.insert("nick".into(), Value::from("bob"));
        let header = HandshakeHeader::local(Value::from(1), extra);
        assert_eq!(header.version, PROTOCOL_VERSION);
        assert_eq!(header.extra.len(), 1);

        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["version"], "4.0.0");
        assert_eq!(json["client"], "MULTIFEED");
        assert_eq!(json["userData"], 1);
        assert_eq!(json["nick"], "bob");
    }

    #[test]
    fn matching_open_sends_header() {
        let mut hs = Handshake::new(&shared(), HandshakeHeader::local(Value::Null, Map::new()));
        let actions = hs.on_channel_open(&discovery_key(&shared()));
        assert!(matches!(&actions[..], [HandshakeAction::Send(h)] if h.client == CLIENT_ID));
        assert_eq!(hs.state(), &HandshakeState::AwaitingRemoteHandshake);
    }

    #[test]
    fn mismatched_open_fails() {
        let mut hs = Handshake::new(&shared(), HandshakeHeader::local(Value::Null, Map::new()));
        let other = discovery_key(&FeedKey::from_bytes([6; 32]));
        let actions = hs.on_channel_open(&other);
        assert_eq!(actions, vec![HandshakeAction::Fail(MuxError::KeyMismatch)]);
        assert!(!hs.is_pending());
    }

    #[test]
    fn compatible_header_becomes_ready() {
        let mut hs = opened();
        let actions = hs.on_remote_header(header("4.1.2", CLIENT_ID));
        assert!(matches!(&actions[..], [HandshakeAction::Ready(_)]));
        assert_eq!(hs.remote_header().unwrap().version, "4.1.2");
    }

    #[test]
    fn major_mismatch_fails() {
        let mut hs = opened();
        let actions = hs.on_remote_header(header("5.0.0", CLIENT_ID));
        assert_eq!(
            actions,
            vec![HandshakeAction::Fail(MuxError::VersionMismatch {
                ours: "4.0.0".into(),
                theirs: "5.0.0".into(),
            })]
        );
    }

    #[test]
    fn version_checked_before_client() {
        let mut hs = opened();
        let actions = hs.on_remote_header(header("1.0.0", "OTHER"));
        assert!(matches!(
            &actions[..],
            [HandshakeAction::Fail(MuxError::VersionMismatch { .. })]
        ));
    }

    #[test]
    fn client_mismatch_fails() {
        let mut hs = opened();
        let actions = hs.on_remote_header(header("4.0.0", "OTHER"));
        assert!(matches!(
            &actions[..],
            [HandshakeAction::Fail(MuxError::ClientMismatch { .. })]
        ));
    }

    #[test]
    fn header_is_compared_once() {
        let mut hs = opened();
        hs.on_remote_header(header("4.0.0", CLIENT_ID));
        assert!(hs.on_remote_header(header("1.0.0", "OTHER")).is_empty());
        assert!(hs.is_ready());
    }

    #[test]
    fn header_before_open_is_a_violation() {
        let mut hs = Handshake::new(&shared(), HandshakeHeader::local(Value::Null, Map::new()));
        let actions = hs.on_remote_header(header("4.0.0", CLIENT_ID));
        assert!(matches!(
            &actions[..],
            [HandshakeAction::Fail(MuxError::ProtocolViolation { .. })]
        ));
    }

    #[test]
    fn fail_after_ready_is_ignored() {
        let mut hs = opened();
        hs.on_remote_header(header("4.0.0", CLIENT_ID));
        assert!(hs.fail(MuxError::Closed).is_empty());
        assert!(hs.is_ready());
    }
}
