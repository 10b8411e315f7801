//! Feed discovery: who offers what, and which requests are honored.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::MuxError;
use crate::keys::{extract_keys, uniq};

/// An offer of feed keys. Extra fields travel alongside `keys`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub keys: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys,
            extra: Map::new(),
        }
    }
}

/// Offer/want bookkeeping for one session.
///
/// All three sets only grow through the protocol; [`withdraw`](Self::withdraw)
/// is the one local way to shrink the offer.
#[derive(Debug, Default)]
pub struct ManifestExchange {
    local_offer: BTreeSet<String>,
    local_want: BTreeSet<String>,
    remote_offer: BTreeSet<String>,
}

impl ManifestExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `keys` and build the manifest announcing them.
    ///
    /// A `keys` entry in `extra` is ignored.
    pub fn offer(&mut self, keys: Vec<String>, mut extra: Map<String, Value>) -> Manifest {
        let keys = uniq(extract_keys(keys));
        self.local_offer.extend(keys.iter().cloned());
        extra.remove("keys");
        Manifest { keys, extra }
    }

    /// Record `keys` as wanted. Returns the list to send.
    pub fn request(&mut self, keys: Vec<String>) -> Vec<String> {
        let keys = uniq(extract_keys(keys));
        self.local_want.extend(keys.iter().cloned());
        keys
    }

    /// Merge a remote manifest into the known remote offer.
    pub fn on_manifest(&mut self, manifest: &Manifest) {
        self.remote_offer
            .extend(extract_keys(manifest.keys.iter()));
    }

    /// Keys from a remote request that we actually offered, sorted and
    /// de-duplicated. Anything else is logged and dropped.
    pub fn on_request(&self, keys: &[String]) -> Vec<String> {
        let mut accepted = Vec::new();
        for key in extract_keys(keys) {
            if self.local_offer.contains(&key) {
                accepted.push(key);
            } else {
                let err = MuxError::UnauthorizedKeyRequest { key };
                tracing::warn!(code = err.code(), "manifest: {err}");
            }
        }
        uniq(accepted)
    }

    /// Keys from a remote replicate acknowledgement that we actually
    /// requested, sorted and de-duplicated.
    pub fn on_replicate(&self, keys: &[String]) -> Vec<String> {
        let mut accepted = Vec::new();
        for key in extract_keys(keys) {
            if self.local_want.contains(&key) {
                accepted.push(key);
            } else {
                let err = MuxError::UnrequestedKeyOffered { key };
                tracing::debug!(code = err.code(), "manifest: {err}");
            }
        }
        uniq(accepted)
    }

    /// Union of the local and remote offers, sorted.
    pub fn known_feeds(&self) -> Vec<String> {
        self.local_offer
            .union(&self.remote_offer)
            .cloned()
            .collect()
    }

    /// Stop offering `key`. Returns whether it was offered.
    pub fn withdraw(&mut self, key: &str) -> bool {
        self.local_offer.remove(key)
    }

    pub fn is_offered(&self, key: &str) -> bool {
        self.local_offer.contains(key)
    }

    pub fn is_wanted(&self, key: &str) -> bool {
        self.local_want.contains(key)
    }

    pub fn local_offer(&self) -> &BTreeSet<String> {
        &self.local_offer
    }

    pub fn local_want(&self) -> &BTreeSet<String> {
        &self.local_want
    }

    pub fn remote_offer(&self) -> &BTreeSet<String> {
        &self.remote_offer
    }
}
