// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Sampled hot-key detection.
//!
//! Unreplicated traffic dominates, so those accesses are counted
//! 1-in-`sample_rate` to keep the per-packet write cost down. Replicated
//! keys are counted exactly because their counts drive eviction. Every
//! epoch the counters are consumed into promotion/replacement proposals
//! and zeroed.

use crate::LB_HOT_CANDIDATE;

use common::KeyHash;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;

use std::collections::HashMap;

/// What the epoch tick wants done. Execution (version allocation, the
/// migration handshake, replica placement) belongs to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Proposal {
    /// A free replication slot exists: promote this key.
    Promote { keyhash: KeyHash, key: Box<[u8]> },
    /// All slots taken: promote this key, evicting the named cold one.
    Replace {
        keyhash: KeyHash,
        key: Box<[u8]>,
        evict: KeyHash,
    },
}

pub struct AccessStats {
    sample_rate: u32,
    hk_threshold: u64,
    max_rkeys: usize,
    replacement_margin: u64,

    // exact counts for replicated keys, sampled counts for the rest
    rkey_access_count: DashMap<KeyHash, u64>,
    ukey_access_count: DashMap<KeyHash, u64>,
    // candidates which crossed the threshold this epoch, with key bytes
    // captured for the eventual migration request
    hot_ukeys: DashMap<KeyHash, Box<[u8]>>,
    // currently replicated keys; mutated by the control path only
    rkeys: RwLock<HashMap<KeyHash, Box<[u8]>>>,
}

impl AccessStats {
    pub fn new(
        sample_rate: u32,
        hk_threshold: u64,
        max_rkeys: usize,
        replacement_margin: u64,
    ) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            hk_threshold: hk_threshold.max(1),
            max_rkeys,
            replacement_margin: replacement_margin.max(1),
            rkey_access_count: DashMap::new(),
            ukey_access_count: DashMap::new(),
            hot_ukeys: DashMap::new(),
            rkeys: RwLock::new(HashMap::new()),
        }
    }

    /// Exact count for an access against a replicated key.
    pub fn record_rkey(&self, keyhash: KeyHash) {
        *self.rkey_access_count.entry(keyhash).or_insert(0) += 1;
    }

    /// Sampled count for an access against an unreplicated key. The key
    /// bytes are only copied at the moment the threshold is crossed.
    pub fn record_ukey(&self, keyhash: KeyHash, key: &[u8]) {
        if self.sample_rate > 1 && !rand::thread_rng().gen_ratio(1, self.sample_rate) {
            return;
        }
        // release the counter shard before touching hot_ukeys; the epoch
        // thread walks these maps in the opposite order
        let crossed = {
            let mut count = self.ukey_access_count.entry(keyhash).or_insert(0);
            *count += 1;
            *count == self.hk_threshold
        };
        if crossed {
            LB_HOT_CANDIDATE.increment();
            self.hot_ukeys.insert(keyhash, key.into());
        }
    }

    /// Mark a key as replicated (migration installed).
    pub fn commit_promotion(&self, keyhash: KeyHash, key: Box<[u8]>) {
        self.rkeys.write().insert(keyhash, key);
    }

    /// Mark a key as no longer replicated.
    pub fn commit_eviction(&self, keyhash: KeyHash) {
        self.rkeys.write().remove(&keyhash);
    }

    pub fn rkey_count(&self) -> usize {
        self.rkeys.read().len()
    }

    pub fn home_key(&self, keyhash: KeyHash) -> Option<Box<[u8]>> {
        self.rkeys.read().get(&keyhash).cloned()
    }

    /// Consume one epoch of counters into ranked proposals and zero
    /// everything. `in_flight` replication slots are already spoken for by
    /// pending migrations and are not handed out again.
    pub fn epoch_decisions(&self, in_flight: usize) -> Vec<Proposal> {
        // rank candidates hottest-first
        let mut candidates: Vec<(u64, KeyHash, Box<[u8]>)> = self
            .hot_ukeys
            .iter()
            .map(|entry| {
                let count = self
                    .ukey_access_count
                    .get(entry.key())
                    .map(|c| *c)
                    .unwrap_or(0);
                (count, *entry.key(), entry.value().clone())
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        // rank current rkeys coldest-first
        let mut coldest: Vec<(u64, KeyHash)> = {
            let rkeys = self.rkeys.read();
            rkeys
                .keys()
                .map(|h| {
                    let count = self.rkey_access_count.get(h).map(|c| *c).unwrap_or(0);
                    (count, *h)
                })
                .collect()
        };
        coldest.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        let mut coldest = coldest.into_iter();

        let mut slots_free = self
            .max_rkeys
            .saturating_sub(self.rkey_count() + in_flight);

        let mut proposals = Vec::new();
        for (count, keyhash, key) in candidates {
            if slots_free > 0 {
                slots_free -= 1;
                proposals.push(Proposal::Promote { keyhash, key });
                continue;
            }
            // replacement: the hottest candidate must beat the coldest
            // current rkey by the configured margin, on comparable scales
            match coldest.next() {
                Some((cold_count, cold_hash))
                    if count.saturating_mul(self.sample_rate as u64)
                        > cold_count.saturating_mul(self.replacement_margin) =>
                {
                    proposals.push(Proposal::Replace {
                        keyhash,
                        key,
                        evict: cold_hash,
                    });
                }
                // candidates are sorted hottest-first: if this one cannot
                // displace anything, none of the rest can either
                _ => break,
            }
        }

        self.rkey_access_count.clear();
        self.ukey_access_count.clear();
        self.hot_ukeys.clear();

        proposals
    }

    /// Drop every counter and the replicated-key bookkeeping (fleet reset).
    pub fn clear(&self) {
        self.rkey_access_count.clear();
        self.ukey_access_count.clear();
        self.hot_ukeys.clear();
        self.rkeys.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> AccessStats {
        // sample_rate 1 for determinism
        AccessStats::new(1, 5, 2, 2)
    }

    #[test]
    fn threshold_crossing_creates_a_candidate() {
        let s = stats();
        for _ in 0..4 {
            s.record_ukey(0xa, b"x");
        }
        assert!(s.hot_ukeys.is_empty());
        s.record_ukey(0xa, b"x");
        assert_eq!(&**s.hot_ukeys.get(&0xa).unwrap().value(), b"x");
    }

    #[test]
    fn epoch_promotes_into_free_slots() {
        let s = stats();
        for _ in 0..5 {
            s.record_ukey(0xa, b"x");
        }
        let proposals = s.epoch_decisions(0);
        assert_eq!(
            proposals,
            vec![Proposal::Promote {
                keyhash: 0xa,
                key: (*b"x").into()
            }]
        );
        // counters were zeroed
        assert!(s.ukey_access_count.is_empty());
        assert!(s.hot_ukeys.is_empty());
    }

    #[test]
    fn epoch_ranks_candidates_hottest_first() {
        let s = stats();
        for _ in 0..5 {
            s.record_ukey(0xa, b"a");
        }
        for _ in 0..9 {
            s.record_ukey(0xb, b"b");
        }
        let proposals = s.epoch_decisions(0);
        assert_eq!(proposals.len(), 2);
        assert!(matches!(&proposals[0], Proposal::Promote { keyhash: 0xb, .. }));
    }

    #[test]
    fn replacement_evicts_the_coldest_rkey() {
        let s = stats();
        s.commit_promotion(0x1, (*b"p").into());
        s.commit_promotion(0x2, (*b"r").into());

        // p is cold, r is warm, q is hot
        s.record_rkey(0x1);
        s.record_rkey(0x1);
        for _ in 0..5 {
            s.record_rkey(0x2);
        }
        for _ in 0..6 {
            s.record_ukey(0x3, b"q");
        }

        let proposals = s.epoch_decisions(0);
        assert_eq!(
            proposals,
            vec![Proposal::Replace {
                keyhash: 0x3,
                key: (*b"q").into(),
                evict: 0x1
            }]
        );
    }

    #[test]
    fn replacement_respects_the_margin() {
        let s = stats();
        s.commit_promotion(0x1, (*b"p").into());
        s.commit_promotion(0x2, (*b"r").into());
        for _ in 0..5 {
            s.record_rkey(0x1);
            s.record_rkey(0x2);
        }
        // candidate at 6 does not double the coldest's 5
        for _ in 0..6 {
            s.record_ukey(0x3, b"q");
        }
        assert!(s.epoch_decisions(0).is_empty());
    }

    #[test]
    fn in_flight_migrations_consume_slots() {
        let s = stats();
        for _ in 0..5 {
            s.record_ukey(0xa, b"x");
        }
        // both slots already promised to pending migrations, and an empty
        // rkey ranking means nothing can be displaced
        assert!(s.epoch_decisions(2).is_empty());
    }
}
