// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The Pegasus backend server kernel: a versioned in-memory store behind a
//! fleet of datagram workers. Writes apply under a newest-version-wins
//! discipline, replies always carry the installed version, and the kernel
//! participates in the replica-install side of key migration.

#[macro_use]
extern crate log;

use rustcommon_metrics::*;

mod load;
mod process;
mod store;
mod worker;

pub use load::LoadTracker;
pub use process::Processor;
pub use store::Store;

use common::signal::Signal;
use config::{ServerConfig, TopologyConfig, WorkerConfig};
use crossbeam_channel::{bounded, Sender};
use net::Waker;
use worker::{Worker, WorkerBuilder};

use std::io::Result;
use std::sync::Arc;
use std::thread::JoinHandle;

counter!(KV_GET, "reads processed against the store");
counter!(KV_PUT, "writes installed into the store");
counter!(KV_DELETE, "deletes installed into the store");
counter!(
    KV_STALE_DISCARD,
    "writes and deletes discarded for carrying a stale version"
);
counter!(KV_MGR_REQ, "migration requests received");
counter!(KV_MGR_FETCH, "migration fetches completed against an owner");
counter!(KV_MGR_ACK, "migration acks sent");
counter!(KV_RESET, "reset requests handled");
counter!(KV_MALFORMED, "ingress frames which failed to parse");
counter!(KV_UNEXPECTED, "well-formed frames with no handler at a server");
gauge!(KV_ITEM_CURRENT, "current number of items, tombstones included");

const SIGNAL_QUEUE_CAPACITY: usize = 8;
const THREAD_PREFIX: &str = "pegasus_node";

/// A running backend node.
pub struct Kvnode {
    workers: Vec<JoinHandle<()>>,
    signals: Vec<(Sender<Signal>, Arc<Waker>)>,
}

pub struct KvnodeBuilder {
    workers: Vec<WorkerBuilder>,
}

impl KvnodeBuilder {
    pub fn new<T: ServerConfig + TopologyConfig + WorkerConfig>(
        config: &T,
        node_id: common::NodeId,
    ) -> Result<Self> {
        let addr = config.topology().node_addr(node_id)?;

        let store = Arc::new(Store::new(config.server().default_value().as_bytes()));
        let load = Arc::new(LoadTracker::new(config.server().load_epoch()));
        let processor = Arc::new(Processor::new(config, node_id, store, load)?);

        let mut workers = Vec::with_capacity(config.worker().threads());
        for _ in 0..config.worker().threads() {
            workers.push(WorkerBuilder::new(config, addr, processor.clone())?);
        }

        Ok(Self { workers })
    }

    pub fn spawn(self) -> Kvnode {
        let mut handles = Vec::with_capacity(self.workers.len());
        let mut signals = Vec::with_capacity(self.workers.len());

        for (id, builder) in self.workers.into_iter().enumerate() {
            let (signal_tx, signal_rx) = bounded(SIGNAL_QUEUE_CAPACITY);
            let waker = builder.waker();
            let mut worker: Worker = builder.build(signal_rx);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("{}_worker_{}", THREAD_PREFIX, id))
                    .spawn(move || worker.run())
                    .unwrap(),
            );
            signals.push((signal_tx, waker));
        }

        Kvnode {
            workers: handles,
            signals,
        }
    }
}

impl Kvnode {
    /// Send a shutdown to every worker and join them.
    pub fn shutdown(self) {
        for (tx, waker) in &self.signals {
            if tx.send(Signal::Shutdown).is_err() {
                error!("error sending shutdown signal to worker");
            }
            let _ = waker.wake();
        }
        self.wait()
    }

    /// Block until all workers terminate.
    pub fn wait(self) {
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}
