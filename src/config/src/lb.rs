// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const SAMPLE_RATE: u32 = 1000;
const HK_THRESHOLD: u64 = 4;
const STATS_EPOCH: u64 = 10_000;
const MGR_TIMEOUT: u64 = 10_000;
const MAX_RKEYS: usize = 32;
const REPLY_RING_SIZE: usize = 128;
const REPLACEMENT_MARGIN: u64 = 2;

// helper functions
fn sample_rate() -> u32 {
    SAMPLE_RATE
}

fn hk_threshold() -> u64 {
    HK_THRESHOLD
}

fn stats_epoch() -> u64 {
    STATS_EPOCH
}

fn mgr_timeout() -> u64 {
    MGR_TIMEOUT
}

fn max_rkeys() -> usize {
    MAX_RKEYS
}

fn reply_ring_size() -> usize {
    REPLY_RING_SIZE
}

fn replacement_margin() -> u64 {
    REPLACEMENT_MARGIN
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Lb {
    #[serde(default = "sample_rate")]
    sample_rate: u32,
    #[serde(default = "hk_threshold")]
    hk_threshold: u64,
    #[serde(default = "stats_epoch")]
    stats_epoch: u64,
    #[serde(default = "mgr_timeout")]
    mgr_timeout: u64,
    #[serde(default = "max_rkeys")]
    max_rkeys: usize,
    #[serde(default = "reply_ring_size")]
    reply_ring_size: usize,
    #[serde(default = "replacement_margin")]
    replacement_margin: u64,
}

// implementation
impl Lb {
    /// Unreplicated-key accesses are counted 1-in-`sample_rate`.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Sampled count at which an unreplicated key becomes a promotion
    /// candidate.
    pub fn hk_threshold(&self) -> u64 {
        self.hk_threshold
    }

    /// Access-counter epoch, in microseconds.
    pub fn stats_epoch(&self) -> u64 {
        self.stats_epoch
    }

    /// Time after which a pending migration with no ack is discarded,
    /// in microseconds.
    pub fn mgr_timeout(&self) -> u64 {
        self.mgr_timeout
    }

    /// Upper bound on concurrently replicated keys.
    pub fn max_rkeys(&self) -> usize {
        self.max_rkeys
    }

    /// Per-client ring of recently forwarded request ids, used to suppress
    /// duplicate replies from write fan-out.
    pub fn reply_ring_size(&self) -> usize {
        self.reply_ring_size
    }

    /// A candidate replaces the coldest replicated key only when its
    /// scaled count exceeds the coldest count by this factor.
    pub fn replacement_margin(&self) -> u64 {
        self.replacement_margin
    }
}

// trait implementations
impl Default for Lb {
    fn default() -> Self {
        Self {
            sample_rate: sample_rate(),
            hk_threshold: hk_threshold(),
            stats_epoch: stats_epoch(),
            mgr_timeout: mgr_timeout(),
            max_rkeys: max_rkeys(),
            reply_ring_size: reply_ring_size(),
            replacement_margin: replacement_margin(),
        }
    }
}
