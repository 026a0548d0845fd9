// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The Pegasus load balancer.
//!
//! Sits on the data path between clients and the backend fleet. Each
//! packet is parsed, classified, routed through the replica-set table, and
//! re-emitted with its header rewritten in place. Hot keys are detected
//! from a sampled count of the traffic and replicated onto additional
//! nodes through a migration handshake; writes to replicated keys fan out
//! to every replica under a version-ordered coherence protocol.
//!
//! The LB holds soft state only: everything here is rebuilt from traffic
//! after a restart or a fleet reset.

#[macro_use]
extern crate log;

use rustcommon_metrics::*;

mod epoch;
mod migration;
mod process;
mod rset;
mod stats;
mod worker;

pub use migration::{MigrationState, MigrationTable};
pub use process::Pipeline;
pub use rset::{AckOutcome, RSetData, RSetError, RSetTable, MAX_REPLICAS};
pub use stats::{AccessStats, Proposal};

use common::signal::Signal;
use config::{LbConfig, TopologyConfig, WorkerConfig};
use crossbeam_channel::{bounded, Sender};
use epoch::{Epoch, EpochBuilder};
use net::Waker;
use worker::{Worker, WorkerBuilder};

use std::io::Result;
use std::sync::Arc;
use std::thread::JoinHandle;

counter!(LB_PKT, "ingress packets");
counter!(LB_PKT_MALFORMED, "ingress frames which failed to parse");
counter!(
    LB_PKT_UNEXPECTED,
    "well-formed frames with no handler or no route at the LB"
);
counter!(LB_READ, "reads routed");
counter!(LB_WRITE, "writes routed");
counter!(LB_DELETE, "deletes routed");
counter!(LB_FANOUT, "packets emitted by write fan-out");
counter!(LB_REPLY, "replies forwarded to clients");
counter!(LB_REPLY_SUPPRESSED, "duplicate replies suppressed");
counter!(LB_WRITE_COMPLETE, "writes acknowledged by every replica");
counter!(
    LB_ACK_MISMATCH,
    "acks whose version or membership matched no outstanding write"
);
counter!(
    LB_RSET_FALLBACK,
    "reads against an emptied replica set, rerouted to the home node"
);
counter!(LB_RSET_FULL, "promotions refused by a full replica set");
counter!(LB_HOT_CANDIDATE, "unreplicated keys crossing the hot threshold");
counter!(LB_PROMOTE, "replicas installed by migration");
counter!(LB_EVICT, "replicated keys retired");
counter!(LB_MGR_REQ, "migration requests sent");
counter!(LB_MGR_TIMEOUT, "migrations discarded on timeout");
counter!(LB_RESET, "fleet resets handled");
counter!(LB_RESET_REPLY, "reset acknowledgements received from nodes");
gauge!(LB_RKEY_CURRENT, "currently replicated keys");

const SIGNAL_QUEUE_CAPACITY: usize = 8;
const THREAD_PREFIX: &str = "pegasus_lb";

/// A running load balancer.
pub struct LoadBalancer {
    threads: Vec<JoinHandle<()>>,
    worker_signals: Vec<(Sender<Signal>, Arc<Waker>)>,
    epoch_signal: Sender<Signal>,
}

pub struct LoadBalancerBuilder {
    workers: Vec<WorkerBuilder>,
    epoch: EpochBuilder,
}

impl LoadBalancerBuilder {
    pub fn new<T: LbConfig + TopologyConfig + WorkerConfig>(config: &T) -> Result<Self> {
        let pipeline = Arc::new(Pipeline::new(config)?);
        let addr = config.topology().lb_addr()?;

        let mut workers = Vec::with_capacity(config.worker().threads());
        for _ in 0..config.worker().threads() {
            workers.push(WorkerBuilder::new(config, addr, pipeline.clone())?);
        }
        let epoch = EpochBuilder::new(config, pipeline)?;

        Ok(Self { workers, epoch })
    }

    pub fn spawn(self) -> LoadBalancer {
        let mut threads = Vec::with_capacity(self.workers.len() + 1);
        let mut worker_signals = Vec::with_capacity(self.workers.len());

        for (id, builder) in self.workers.into_iter().enumerate() {
            let (signal_tx, signal_rx) = bounded(SIGNAL_QUEUE_CAPACITY);
            let waker = builder.waker();
            let mut worker: Worker = builder.build(signal_rx);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{}_worker_{}", THREAD_PREFIX, id))
                    .spawn(move || worker.run())
                    .unwrap(),
            );
            worker_signals.push((signal_tx, waker));
        }

        let (epoch_signal, epoch_rx) = bounded(SIGNAL_QUEUE_CAPACITY);
        let mut epoch: Epoch = self.epoch.build(epoch_rx);
        threads.push(
            std::thread::Builder::new()
                .name(format!("{}_epoch", THREAD_PREFIX))
                .spawn(move || epoch.run())
                .unwrap(),
        );

        LoadBalancer {
            threads,
            worker_signals,
            epoch_signal,
        }
    }
}

impl LoadBalancer {
    /// Send a shutdown to every thread and join them.
    pub fn shutdown(self) {
        for (tx, waker) in &self.worker_signals {
            if tx.send(Signal::Shutdown).is_err() {
                error!("error sending shutdown signal to worker");
            }
            let _ = waker.wake();
        }
        if self.epoch_signal.send(Signal::Shutdown).is_err() {
            error!("error sending shutdown signal to epoch thread");
        }
        self.wait()
    }

    /// Block until all threads terminate.
    pub fn wait(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}
