//! Replication session bookkeeping for one connection.
//!
//! Tracks resolution batches (each one a prefinalize hold) and the table of
//! active per-feed sub-streams. Pure: the runtime decides when to resolve,
//! start and close things; this module only answers "what now".

use std::collections::{BTreeMap, BTreeSet};

use crate::keys::uniq;

/// Which inbound message started a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicationRole {
    /// The remote requested keys we offered.
    Responder,
    /// The remote acknowledged keys we requested.
    Requester,
}

impl ReplicationRole {
    /// Requester batches close the main channel when they come up empty.
    pub fn terminates_if_empty(self) -> bool {
        matches!(self, ReplicationRole::Requester)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-key lifecycle within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStreamState {
    /// Part of a batch that is still resolving.
    Pending,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
struct PendingBatch {
    keys: Vec<String>,
    role: ReplicationRole,
}

/// Result of releasing a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub role: ReplicationRole,
    /// Keys that must open a sub-stream now.
    pub start: Vec<String>,
    /// Ready keys that already had an active sub-stream.
    pub duplicates: Vec<String>,
    /// Nothing to exchange in this direction: close the main channel.
    pub short_circuit: bool,
}

#[derive(Debug)]
pub struct SessionManager {
    live: bool,
    next_batch: u64,
    batches: BTreeMap<BatchId, PendingBatch>,
    active: BTreeMap<String, ReplicationRole>,
    closed: BTreeSet<String>,
    /// Requests sent whose acknowledgement has not arrived yet.
    awaiting_acks: usize,
    acks_processed: usize,
    remote_closed: bool,
}

impl SessionManager {
    pub fn new(live: bool) -> Self {
        Self {
            live,
            next_batch: 0,
            batches: BTreeMap::new(),
            active: BTreeMap::new(),
            closed: BTreeSet::new(),
            awaiting_acks: 0,
            acks_processed: 0,
            remote_closed: false,
        }
    }

    /// Open a batch for `keys` and place a prefinalize hold.
    ///
    /// Returns the batch id and the sorted, de-duplicated keys to resolve.
    pub fn begin_batch(&mut self, keys: Vec<String>, role: ReplicationRole) -> (BatchId, Vec<String>) {
        let id = BatchId(self.next_batch);
        self.next_batch += 1;
        let keys = uniq(keys);
        self.batches.insert(
            id,
            PendingBatch {
                keys: keys.clone(),
                role,
            },
        );
        (id, keys)
    }

    /// Release the hold of batch `id`.
    ///
    /// `ready` are the keys whose feeds became ready. Keys outside the batch
    /// are ignored. Returns `None` for an unknown or already finished batch.
    pub fn finish_batch(&mut self, id: BatchId, ready: Vec<String>) -> Option<BatchOutcome> {
        let batch = self.batches.remove(&id)?;

        let mut start = Vec::new();
        let mut duplicates = Vec::new();
        for key in uniq(ready) {
            if !batch.keys.contains(&key) {
                tracing::debug!("session: batch {id} ignoring feed {key} outside the batch");
                continue;
            }
            if self.active.contains_key(&key) {
                duplicates.push(key);
                continue;
            }
            self.closed.remove(&key);
            self.active.insert(key.clone(), batch.role);
            start.push(key);
        }

        if batch.role == ReplicationRole::Requester {
            self.acks_processed += 1;
        }

        let short_circuit = !self.live
            && batch.role.terminates_if_empty()
            && start.is_empty()
            && self.active.is_empty();

        Some(BatchOutcome {
            role: batch.role,
            start,
            duplicates,
            short_circuit,
        })
    }

    /// A request went out; the remote answers every request with an
    /// acknowledgement, possibly empty.
    pub fn on_request_sent(&mut self) {
        self.awaiting_acks += 1;
    }

    /// An acknowledgement arrived for one of our requests.
    pub fn on_ack_received(&mut self) {
        self.awaiting_acks = self.awaiting_acks.saturating_sub(1);
    }

    /// The remote closed its side of the main channel.
    pub fn on_remote_close(&mut self) {
        self.remote_closed = true;
    }

    /// Bookkeeping for a finished sub-stream. Returns whether it was active.
    pub fn on_substream_closed(&mut self, key: &str) -> bool {
        if self.active.remove(key).is_some() {
            self.closed.insert(key.to_string());
            true
        } else {
            false
        }
    }

    /// Where `key` is in its `Pending -> Active -> Closed` lifecycle.
    pub fn state_of(&self, key: &str) -> Option<SubStreamState> {
        if self.active.contains_key(key) {
            Some(SubStreamState::Active)
        } else if self.batches.values().any(|b| b.keys.iter().any(|k| k == key)) {
            Some(SubStreamState::Pending)
        } else if self.closed.contains(key) {
            Some(SubStreamState::Closed)
        } else {
            None
        }
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    /// Number of prefinalize holds currently placed.
    pub fn holds(&self) -> usize {
        self.batches.len()
    }

    /// Nothing in flight: holds, sub-streams and requests all settled.
    pub fn is_idle(&self) -> bool {
        self.batches.is_empty() && self.active.is_empty() && self.awaiting_acks == 0
    }

    /// Bounded sessions may close once nothing is left in flight and either
    /// an acknowledgement batch was processed or the remote already closed.
    /// The second case ends a side that only offers.
    pub fn ready_to_finalize(&self) -> bool {
        !self.live && (self.acks_processed > 0 || self.remote_closed) && self.is_idle()
    }
}
