// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Key fingerprinting and the deterministic home mapping.
//!
//! Every node and the load balancer must agree on both functions, so they
//! live here rather than in any one role's crate.

use crate::{KeyHash, NodeId};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a over the key bytes. Collisions are tolerated by the
/// protocol because the full key is carried alongside the fingerprint.
pub fn keyhash(key: &[u8]) -> KeyHash {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Home node for a key that has no replica set.
pub fn home(keyhash: KeyHash, num_nodes: usize) -> NodeId {
    (keyhash as usize % num_nodes) as NodeId
}
