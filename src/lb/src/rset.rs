// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Replica sets: which nodes hold a replicated key and at which committed
//! version.
//!
//! Each entry lives behind its own reader-writer lock inside a concurrent
//! map, so the data path takes one shared lock per packet and mutation
//! never contends globally. `ver_completed` only ever advances; the ack
//! bitmap is cleared whenever a newer write supersedes the outstanding one,
//! so a late ack can neither complete the old version nor pollute the new.

use common::{KeyHash, NodeId, Version};
use dashmap::DashMap;
use parking_lot::RwLock;

use std::sync::Arc;

pub const MAX_REPLICAS: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RSetError {
    /// No replicas in the set; the caller falls back to the home node.
    Empty,
    /// The set already holds `MAX_REPLICAS` replicas.
    Full,
}

/// Outcome of recording one ack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// At or below `ver_completed`; replays are no-ops.
    Ignored,
    /// Counted toward the outstanding version.
    Recorded,
    /// All replicas have acknowledged; `ver_completed` advanced.
    Completed,
    /// Version or membership did not match the outstanding write. The
    /// caller logs and counts this rather than silently merging it.
    Mismatch,
}

#[derive(Clone, Debug)]
pub struct RSetData {
    ver_completed: Version,
    // version the bitmap is accumulating acks for; 0 when idle
    ver_pending: Version,
    ack_bitmap: u32,
    size: usize,
    replicas: [NodeId; MAX_REPLICAS],
}

impl RSetData {
    pub fn new(ver: Version, replica: NodeId) -> Self {
        let mut replicas = [0; MAX_REPLICAS];
        replicas[0] = replica;
        Self {
            ver_completed: ver,
            ver_pending: 0,
            ack_bitmap: 0,
            size: 1,
            replicas,
        }
    }

    pub fn ver_completed(&self) -> Version {
        self.ver_completed
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn replicas(&self) -> &[NodeId] {
        &self.replicas[..self.size]
    }

    fn position(&self, replica: NodeId) -> Option<usize> {
        self.replicas[..self.size].iter().position(|r| *r == replica)
    }

    pub fn contains(&self, replica: NodeId) -> bool {
        self.position(replica).is_some()
    }

    /// Pick the replica for a read: round-robin rotation keyed off the
    /// committed version, which preserves read-after-write on any member
    /// once `ver_completed` has advanced past the write.
    pub fn select(&self) -> Result<NodeId, RSetError> {
        if self.size == 0 {
            return Err(RSetError::Empty);
        }
        Ok(self.replicas[self.ver_completed as usize % self.size])
    }

    /// Append a replica if absent. Does not change `ver_completed`.
    pub fn insert(&mut self, replica: NodeId) -> Result<(), RSetError> {
        if self.position(replica).is_some() {
            return Ok(());
        }
        if self.size == MAX_REPLICAS {
            return Err(RSetError::Full);
        }
        self.replicas[self.size] = replica;
        self.size += 1;
        Ok(())
    }

    /// Drop a replica. Bitmap positions shift, so any outstanding write is
    /// abandoned; the next write supersedes it anyway.
    pub fn remove(&mut self, replica: NodeId) {
        if let Some(pos) = self.position(replica) {
            for i in pos..self.size - 1 {
                self.replicas[i] = self.replicas[i + 1];
            }
            self.size -= 1;
            self.ack_bitmap = 0;
            self.ver_pending = 0;
        }
    }

    /// Collapse to a single replica at `ver`.
    pub fn reset(&mut self, ver: Version, replica: NodeId) {
        self.replicas[0] = replica;
        self.size = 1;
        self.ver_completed = ver;
        self.ver_pending = 0;
        self.ack_bitmap = 0;
    }

    /// Start a write at `ver`: clear the bitmap before any fan-out copy is
    /// emitted so no ack races ahead of the emission.
    pub fn begin_write(&mut self, ver: Version) {
        self.ack_bitmap = 0;
        self.ver_pending = ver;
    }

    /// Record an ack carrying the version installed at `replica`.
    pub fn record_ack(&mut self, ver: Version, replica: NodeId) -> AckOutcome {
        if ver <= self.ver_completed {
            return AckOutcome::Ignored;
        }
        let pos = match self.position(replica) {
            Some(pos) => pos,
            None => return AckOutcome::Mismatch,
        };
        if self.ver_pending == 0 || ver > self.ver_pending {
            // a newer version supersedes whatever was outstanding
            self.ver_pending = ver;
            self.ack_bitmap = 0;
        } else if ver < self.ver_pending {
            // late ack for a superseded write; never counted
            return AckOutcome::Mismatch;
        }
        self.ack_bitmap |= 1 << pos;
        let full = u32::MAX >> (32 - self.size as u32);
        if self.ack_bitmap == full {
            self.ver_completed = ver;
            self.ver_pending = 0;
            self.ack_bitmap = 0;
            AckOutcome::Completed
        } else {
            AckOutcome::Recorded
        }
    }
}

/// The global keyhash -> replica set table, plus the degenerate set naming
/// every node for full-fleet fan-out.
pub struct RSetTable {
    entries: DashMap<KeyHash, Arc<RwLock<RSetData>>>,
    all_servers: RwLock<RSetData>,
}

impl RSetTable {
    pub fn new(num_nodes: usize) -> Self {
        let mut all = RSetData::new(0, 0);
        for node in 1..num_nodes {
            // the fleet is bounded by MAX_REPLICAS nodes
            let _ = all.insert(node as NodeId);
        }
        Self {
            entries: DashMap::new(),
            all_servers: RwLock::new(all),
        }
    }

    pub fn get(&self, keyhash: KeyHash) -> Option<Arc<RwLock<RSetData>>> {
        self.entries.get(&keyhash).map(|e| e.value().clone())
    }

    pub fn contains(&self, keyhash: KeyHash) -> bool {
        self.entries.contains_key(&keyhash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install `replica` for `keyhash`, creating the entry when the key is
    /// first replicated. A created entry starts from the authoritative
    /// `home` so reads keep hitting the owner as well as the new replica.
    pub fn insert_replica(
        &self,
        keyhash: KeyHash,
        home: NodeId,
        replica: NodeId,
        ver: Version,
    ) -> Result<(), RSetError> {
        let entry = self
            .entries
            .entry(keyhash)
            .or_insert_with(|| Arc::new(RwLock::new(RSetData::new(ver, home))))
            .value()
            .clone();
        entry.write().insert(replica)
    }

    /// Retire a replicated key: collapse the set onto the home node before
    /// dropping the entry, so a concurrent `select` sees the owner rather
    /// than a torn set. Returns whether an entry existed.
    pub fn evict(&self, keyhash: KeyHash, home: NodeId) -> bool {
        match self.get(keyhash) {
            Some(entry) => {
                let mut guard = entry.write();
                let ver = guard.ver_completed();
                guard.reset(ver, home);
                drop(guard);
                self.entries.remove(&keyhash);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Every node in the fleet, for operations that fan out fleet-wide.
    pub fn all_servers(&self) -> Vec<NodeId> {
        self.all_servers.read().replicas().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_rotates_round_robin() {
        let mut rset = RSetData::new(0, 0);
        rset.insert(1).unwrap();
        rset.insert(2).unwrap();

        // stationary ver_completed: selection is deterministic
        assert_eq!(rset.select().unwrap(), rset.select().unwrap());

        // over a window of advancing versions each replica is picked
        // between floor(W/k) and ceil(W/k) times
        let mut counts = [0usize; 3];
        for ver in 0..9u32 {
            rset.ver_completed = ver;
            counts[rset.select().unwrap() as usize] += 1;
        }
        assert_eq!(counts, [3, 3, 3]);
    }

    #[test]
    fn select_on_empty_fails() {
        let mut rset = RSetData::new(0, 0);
        rset.remove(0);
        assert_eq!(rset.select().unwrap_err(), RSetError::Empty);
    }

    #[test]
    fn insert_rejects_at_capacity_and_dedups() {
        let mut rset = RSetData::new(0, 0);
        for node in 1..MAX_REPLICAS as NodeId {
            rset.insert(node).unwrap();
        }
        assert_eq!(rset.size(), MAX_REPLICAS);
        // duplicate insert is fine
        assert!(rset.insert(3).is_ok());
        assert_eq!(rset.size(), MAX_REPLICAS);
        // a new node is refused
        assert_eq!(rset.insert(200).unwrap_err(), RSetError::Full);
    }

    #[test]
    fn ack_completion_advances_ver_completed() {
        let mut rset = RSetData::new(7, 0);
        rset.insert(1).unwrap();
        rset.begin_write(8);

        assert_eq!(rset.record_ack(8, 0), AckOutcome::Recorded);
        assert_eq!(rset.ver_completed(), 7);
        assert_eq!(rset.record_ack(8, 1), AckOutcome::Completed);
        assert_eq!(rset.ver_completed(), 8);
    }

    #[test]
    fn ack_is_idempotent() {
        let mut rset = RSetData::new(0, 0);
        rset.insert(1).unwrap();
        rset.begin_write(1);
        assert_eq!(rset.record_ack(1, 0), AckOutcome::Recorded);
        let snapshot = rset.clone();
        // replaying the same (ver, replica) pair changes nothing
        assert_eq!(rset.record_ack(1, 0), AckOutcome::Recorded);
        assert_eq!(rset.ack_bitmap, snapshot.ack_bitmap);
        assert_eq!(rset.ver_completed, snapshot.ver_completed);
        // and replay after completion is ignored
        rset.record_ack(1, 1);
        assert_eq!(rset.record_ack(1, 0), AckOutcome::Ignored);
        assert_eq!(rset.ver_completed(), 1);
    }

    #[test]
    fn newer_write_supersedes_outstanding_bitmap() {
        let mut rset = RSetData::new(9, 0);
        rset.insert(1).unwrap();

        // write at 10 is emitted, one ack lands
        rset.begin_write(10);
        assert_eq!(rset.record_ack(10, 0), AckOutcome::Recorded);

        // write at 11 is emitted before 10 completes
        rset.begin_write(11);

        // the late acks for 10 are ignored and never complete anything
        assert_eq!(rset.record_ack(10, 1), AckOutcome::Mismatch);
        assert_eq!(rset.ver_completed(), 9);

        // only the ack pair for 11 completes
        assert_eq!(rset.record_ack(11, 0), AckOutcome::Recorded);
        assert_eq!(rset.record_ack(11, 1), AckOutcome::Completed);
        assert_eq!(rset.ver_completed(), 11);
    }

    #[test]
    fn ack_from_nonmember_is_a_mismatch() {
        let mut rset = RSetData::new(0, 0);
        rset.begin_write(1);
        assert_eq!(rset.record_ack(1, 9), AckOutcome::Mismatch);
    }

    #[test]
    fn ver_completed_never_decreases() {
        let mut rset = RSetData::new(5, 0);
        rset.begin_write(6);
        rset.record_ack(6, 0);
        assert_eq!(rset.ver_completed(), 6);
        // stale completion attempts cannot move it back
        assert_eq!(rset.record_ack(3, 0), AckOutcome::Ignored);
        assert_eq!(rset.ver_completed(), 6);
    }

    #[test]
    fn reset_collapses_to_one_replica() {
        let mut rset = RSetData::new(0, 0);
        rset.insert(1).unwrap();
        rset.insert(2).unwrap();
        rset.begin_write(4);
        rset.reset(3, 2);
        assert_eq!(rset.replicas(), &[2]);
        assert_eq!(rset.ver_completed(), 3);
        // the abandoned write cannot complete after reset
        assert_eq!(rset.record_ack(4, 2), AckOutcome::Recorded);
    }

    #[test]
    fn table_insert_creates_from_home() {
        let table = RSetTable::new(4);
        let h = 0x1234;
        table.insert_replica(h, 2, 3, 10).unwrap();
        let entry = table.get(h).unwrap();
        let guard = entry.read();
        assert_eq!(guard.replicas(), &[2, 3]);
        assert_eq!(guard.ver_completed(), 10);
    }

    #[test]
    fn table_evict_falls_back_to_home() {
        let table = RSetTable::new(4);
        let h = 0x1234;
        table.insert_replica(h, 2, 3, 10).unwrap();
        table.evict(h, 2);
        assert!(table.get(h).is_none());
    }

    #[test]
    fn all_servers_names_every_node() {
        let table = RSetTable::new(3);
        assert_eq!(table.all_servers(), vec![0, 1, 2]);
    }
}
