//! Key normalization.
//!
//! The protocol exchanges keys as canonical lowercase strings. Callers may
//! hand in strings, raw bytes, [`FeedKey`]s or feed handles; everything is
//! funnelled through [`KeyLike`] before it reaches a manifest or a set.

use std::collections::BTreeSet;
use std::sync::Arc;

use multifeed_wire::FeedKey;

use crate::feed::Feed;

/// Anything that can name a feed.
///
/// Returns `None` for empty input, which callers silently drop.
pub trait KeyLike {
    fn to_key(&self) -> Option<String>;
}

impl KeyLike for str {
    fn to_key(&self) -> Option<String> {
        let trimmed = self.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_ascii_lowercase())
        }
    }
}

impl KeyLike for String {
    fn to_key(&self) -> Option<String> {
        self.as_str().to_key()
    }
}

impl KeyLike for [u8] {
    fn to_key(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(hex::encode(self))
        }
    }
}

impl KeyLike for Vec<u8> {
    fn to_key(&self) -> Option<String> {
        self.as_slice().to_key()
    }
}

impl KeyLike for FeedKey {
    fn to_key(&self) -> Option<String> {
        Some(self.to_hex())
    }
}

impl<F: Feed + ?Sized> KeyLike for Arc<F> {
    fn to_key(&self) -> Option<String> {
        Some(self.key().to_hex())
    }
}

impl<T: KeyLike + ?Sized> KeyLike for &T {
    fn to_key(&self) -> Option<String> {
        (**self).to_key()
    }
}

impl<T: KeyLike> KeyLike for Option<T> {
    fn to_key(&self) -> Option<String> {
        self.as_ref().and_then(KeyLike::to_key)
    }
}

/// Normalize a list of key-like values, dropping empty entries.
///
/// Order is preserved and duplicates are kept; see [`uniq`].
pub fn extract_keys<I>(keys: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: KeyLike,
{
    keys.into_iter().filter_map(|k| k.to_key()).collect()
}

/// Sorted, de-duplicated copy of `keys`.
pub fn uniq<I>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    keys.into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Whether `key` is a well-formed 32-byte feed key in hex.
pub fn is_feed_key(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit())
}
