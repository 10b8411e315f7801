use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::WireError;

/// Length of a feed public key in bytes.
pub const KEY_LEN: usize = 32;

/// Domain tag mixed into discovery keys so they never equal the key itself.
const DISCOVERY_TAG: &[u8] = b"multifeed/discovery/v1";

/// Public key of an append-only feed.
///
/// Displayed and parsed as 64 lowercase hex chars. Parsing accepts any case.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey([u8; KEY_LEN]);

impl FeedKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Fresh random key, used when a writer creates a new feed.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Canonical lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "FeedKey({}...)", &hex[..8])
    }
}

impl FromStr for FeedKey {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != KEY_LEN * 2 {
            return Err(WireError::InvalidKey(s.to_string()));
        }
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| WireError::InvalidKey(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<&[u8]> for FeedKey {
    type Error = WireError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| WireError::InvalidKey(hex::encode(bytes)))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; KEY_LEN]> for FeedKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl serde::Serialize for FeedKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for FeedKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Derive the discovery key for a shared key.
///
/// Both peers announce this value when opening the main channel; equal values
/// prove both sides hold the same pre-shared key without revealing it.
pub fn discovery_key(key: &FeedKey) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DISCOVERY_TAG);
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}
