// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Pegasus is a load-balanced, replicated in-memory key-value cache. A
//! load balancer sits on the data path and dynamically replicates hot
//! keys across backend servers to absorb skew, keeping per-key
//! read-after-write ordering through a version-based coherence protocol.
//!
//! One binary hosts all three roles; `--role {client,server,lb}` selects
//! the entry point.

#[macro_use]
extern crate log;

use rustcommon_metrics::{Counter, Gauge};

use std::io::{BufRead, BufReader, Error, ErrorKind, Result};

/// A running server-side role, wrapped so `main` can drive either the
/// same way.
pub enum Pegasus {
    LoadBalancer(lb::LoadBalancer),
    Server(kvnode::Kvnode),
}

impl Pegasus {
    /// Block until the role's threads terminate.
    pub fn wait(self) {
        match self {
            Pegasus::LoadBalancer(lb) => lb.wait(),
            Pegasus::Server(node) => node.wait(),
        }
    }

    /// Gracefully stop the role's threads.
    pub fn shutdown(self) {
        match self {
            Pegasus::LoadBalancer(lb) => lb.shutdown(),
            Pegasus::Server(node) => node.shutdown(),
        }
    }
}

/// Load the workload key population, one key per line.
pub fn load_keys(path: &str) -> Result<Vec<Box<[u8]>>> {
    let file = std::fs::File::open(path)?;
    let mut keys = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let key = line.trim();
        if !key.is_empty() {
            keys.push(key.as_bytes().into());
        }
    }
    if keys.is_empty() {
        return Err(Error::new(ErrorKind::Other, "keyfile is empty"));
    }
    Ok(keys)
}

/// Log every registered counter and gauge with its current value.
pub fn dump_metrics() {
    let mut lines = Vec::new();
    for metric in &rustcommon_metrics::metrics() {
        let any = match metric.as_any() {
            Some(any) => any,
            None => continue,
        };
        if let Some(counter) = any.downcast_ref::<Counter>() {
            lines.push(format!("{}: {}", metric.name(), counter.value()));
        } else if let Some(gauge) = any.downcast_ref::<Gauge>() {
            lines.push(format!("{}: {}", metric.name(), gauge.value()));
        }
    }
    lines.sort();
    for line in lines {
        info!("{}", line);
    }
}
