// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Pending migration bookkeeping.
//!
//! One handshake may be in flight per key: `PROPOSED` when the slot is
//! allocated, `REQUESTED` once the MGR_REQ is on the wire, and the entry
//! leaves the table on install or timeout. A timed-out slot is simply
//! freed; the key may re-qualify in a later epoch.

use common::{KeyHash, NodeId, Version};
use dashmap::DashMap;

use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MigrationState {
    Proposed,
    Requested,
}

#[derive(Clone, Debug)]
pub struct Pending {
    pub node: NodeId,
    pub ver: Version,
    pub key: Box<[u8]>,
    pub state: MigrationState,
    since: Instant,
}

pub struct MigrationTable {
    pending: DashMap<KeyHash, Pending>,
    timeout: Duration,
}

impl MigrationTable {
    pub fn new(timeout_us: u64) -> Self {
        Self {
            pending: DashMap::new(),
            timeout: Duration::from_micros(timeout_us),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, keyhash: KeyHash) -> bool {
        self.pending.contains_key(&keyhash)
    }

    /// Allocate the slot. Refused while a handshake for the key is already
    /// in flight.
    pub fn propose(&self, keyhash: KeyHash, node: NodeId, ver: Version, key: Box<[u8]>) -> bool {
        if self.pending.contains_key(&keyhash) {
            return false;
        }
        self.pending
            .insert(
                keyhash,
                Pending {
                    node,
                    ver,
                    key,
                    state: MigrationState::Proposed,
                    since: Instant::now(),
                },
            )
            .is_none()
    }

    /// The MGR_REQ for this key went out.
    pub fn mark_requested(&self, keyhash: KeyHash) {
        if let Some(mut pending) = self.pending.get_mut(&keyhash) {
            pending.state = MigrationState::Requested;
        }
    }

    /// An ack arrived: the entry is consumed if the version matches the
    /// outstanding handshake. A version mismatch (for example an ack
    /// straggling in after a timeout and re-proposal) leaves the entry
    /// alone and is reported to the caller as `None`.
    pub fn complete(&self, keyhash: KeyHash, ver: Version) -> Option<Pending> {
        let matches = self
            .pending
            .get(&keyhash)
            .map(|pending| pending.ver == ver)
            .unwrap_or(false);
        if matches {
            self.pending.remove(&keyhash).map(|(_, pending)| pending)
        } else {
            None
        }
    }

    /// Discard entries with no ack inside the timeout. Returns how many
    /// slots were freed.
    pub fn sweep(&self) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| pending.since.elapsed() <= timeout);
        before - self.pending.len()
    }

    pub fn clear(&self) {
        self.pending.clear();
    }
}
