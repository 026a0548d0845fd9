// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Shared leaf types for the Pegasus crates: key fingerprinting, the home
//! node mapping, and inter-thread signals.

pub mod hash;
pub mod signal;

/// 32-bit transport-level key fingerprint carried in every Pegasus header.
pub type KeyHash = u32;

/// 8-bit backend server index, `0..num_nodes`.
pub type NodeId = u8;

/// Monotonic per-LB write version.
pub type Version = u32;

/// Client identifier reserved for server-to-server fetches during key
/// migration. Replies to this id are sent directly and never traverse the
/// load balancer.
pub const INTERNAL_CLIENT_ID: u8 = 0xFF;
