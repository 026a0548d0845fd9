// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The epoch thread: every `stats_epoch` it consumes the access counters,
//! executes the detector's promotion and replacement proposals through the
//! migration handshake, and sweeps timed-out handshakes. This is the only
//! thread that takes exclusive locks outside the write fan-out path.

use crate::process::Pipeline;
use crate::stats::Proposal;
use crate::{LB_EVICT, LB_MGR_REQ, LB_MGR_TIMEOUT};

use common::signal::Signal;
use common::{hash, KeyHash, NodeId};
use config::{LbConfig, TopologyConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use protocol_common::Compose;
use protocol_pegasus::{Message, MigrationReq};

use std::io::Result;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct Epoch {
    interval: Duration,
    nodes: Vec<SocketAddr>,
    pipeline: Arc<Pipeline>,
    signal_rx: Receiver<Signal>,
    socket: UdpSocket,
}

pub(crate) struct EpochBuilder {
    interval: Duration,
    nodes: Vec<SocketAddr>,
    pipeline: Arc<Pipeline>,
    socket: UdpSocket,
}

impl EpochBuilder {
    pub fn new<T: LbConfig + TopologyConfig>(
        config: &T,
        pipeline: Arc<Pipeline>,
    ) -> Result<Self> {
        // control-plane sends ride their own ephemeral socket; acks come
        // back to the data-path ingress address
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        Ok(Self {
            interval: Duration::from_micros(config.lb().stats_epoch()),
            nodes: config.topology().node_addrs()?,
            pipeline,
            socket,
        })
    }

    pub fn build(self, signal_rx: Receiver<Signal>) -> Epoch {
        Epoch {
            interval: self.interval,
            nodes: self.nodes,
            pipeline: self.pipeline,
            signal_rx,
            socket: self.socket,
        }
    }
}

impl Epoch {
    pub fn run(&mut self) {
        loop {
            match self.signal_rx.recv_timeout(self.interval) {
                Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.tick();
                }
            }
        }
    }

    fn tick(&mut self) {
        let migrations = self.pipeline.migrations();
        let stats = self.pipeline.stats();

        let timed_out = migrations.sweep();
        if timed_out > 0 {
            LB_MGR_TIMEOUT.add(timed_out as u64);
            debug!("discarded {} timed-out migrations", timed_out);
        }

        for proposal in stats.epoch_decisions(migrations.len()) {
            let (keyhash, key) = match proposal {
                Proposal::Promote { keyhash, key } => (keyhash, key),
                Proposal::Replace { keyhash, key, evict } => {
                    LB_EVICT.increment();
                    self.pipeline.evict(evict);
                    (keyhash, key)
                }
            };
            self.promote(keyhash, key);
        }
    }

    /// Start the promotion handshake for one key: allocate a replica slot
    /// and a fresh version, then ask the chosen node to install the key,
    /// naming the authoritative owner it should fetch from.
    fn promote(&mut self, keyhash: KeyHash, key: Box<[u8]>) {
        let migrations = self.pipeline.migrations();
        if migrations.contains(keyhash) {
            return;
        }
        let replica = match self.choose_replica(keyhash) {
            Some(replica) => replica,
            None => {
                // single-node fleets and fully replicated keys have
                // nowhere to spread
                return;
            }
        };
        let owner = self.current_owner(keyhash);
        let ver = self.pipeline.ver_next().fetch_add(1, Ordering::Relaxed);

        if !migrations.propose(keyhash, replica, ver, key.clone()) {
            return;
        }

        let mut frame = Vec::new();
        Message::MigrationReq(MigrationReq {
            keyhash,
            owner,
            ver,
            key,
        })
        .compose(&mut frame);

        match self.nodes.get(replica as usize) {
            Some(addr) => match self.socket.send_to(&frame, addr) {
                Ok(_) => {
                    LB_MGR_REQ.increment();
                    migrations.mark_requested(keyhash);
                    trace!(
                        "migration request: keyhash {:08x} -> node {} at ver {}",
                        keyhash,
                        replica,
                        ver
                    );
                }
                Err(e) => {
                    error!("migration send failed: {}", e);
                }
            },
            None => {
                error!("no address for replica {}", replica);
            }
        }
    }

    /// Place the new replica on the least-loaded node not already holding
    /// the key, lowest id winning ties. Load is whatever the nodes last
    /// reported in their reply headers.
    fn choose_replica(&self, keyhash: KeyHash) -> Option<NodeId> {
        let holders: Vec<NodeId> = match self.pipeline.rset().get(keyhash) {
            Some(entry) => entry.read().replicas().to_vec(),
            None => vec![hash::home(keyhash, self.nodes.len())],
        };
        let load = self.pipeline.node_load();
        (0..self.nodes.len() as NodeId)
            .filter(|node| !holders.contains(node))
            .min_by_key(|node| (load[*node as usize].load(Ordering::Relaxed), *node))
    }

    fn current_owner(&self, keyhash: KeyHash) -> NodeId {
        match self.pipeline.rset().get(keyhash) {
            Some(entry) => entry
                .read()
                .select()
                .unwrap_or_else(|_| hash::home(keyhash, self.nodes.len())),
            None => hash::home(keyhash, self.nodes.len()),
        }
    }
}
