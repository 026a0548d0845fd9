// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The per-packet pipeline: parse, classify, consult the replica sets,
//! rewrite the header, choose egress, count. Runs to completion on the
//! worker that received the packet; takes one shared lock per read and one
//! exclusive lock per write fan-out.

use crate::migration::MigrationTable;
use crate::rset::{AckOutcome, RSetError, RSetTable};
use crate::stats::AccessStats;
use crate::{
    LB_ACK_MISMATCH, LB_DELETE, LB_FANOUT, LB_PKT, LB_PKT_MALFORMED, LB_PKT_UNEXPECTED,
    LB_PROMOTE, LB_READ, LB_REPLY, LB_REPLY_SUPPRESSED, LB_RESET, LB_RESET_REPLY,
    LB_RKEY_CURRENT, LB_RSET_FALLBACK, LB_RSET_FULL, LB_WRITE, LB_WRITE_COMPLETE,
};

use common::hash;
use common::{KeyHash, NodeId, Version};
use config::{LbConfig, TopologyConfig};
use parking_lot::Mutex;
use protocol_common::Compose;
use protocol_pegasus::{HeaderMut, HeaderView, Message, OpType, ResetReply, ResultCode};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

/// Recently forwarded request ids for one client. Bounded, overwriting the
/// oldest entry; sized at least pipeline depth x fleet size so fan-out
/// duplicates always land inside the window.
struct ReplyRing {
    slots: Box<[u32]>,
    filled: usize,
    pos: usize,
}

impl ReplyRing {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![0; capacity.max(1)].into_boxed_slice(),
            filled: 0,
            pos: 0,
        }
    }

    fn contains(&self, req_id: u32) -> bool {
        self.slots[..self.filled].contains(&req_id)
    }

    fn push(&mut self, req_id: u32) {
        self.slots[self.pos] = req_id;
        self.pos = (self.pos + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
    }
}

pub struct Pipeline {
    nodes: Vec<SocketAddr>,
    clients: Vec<SocketAddr>,
    num_nodes: usize,
    rset: Arc<RSetTable>,
    stats: Arc<AccessStats>,
    migrations: Arc<MigrationTable>,
    ver_next: Arc<AtomicU32>,
    // last load reported by each node, for replica placement
    node_load: Arc<Vec<AtomicU16>>,
    reply_rings: Vec<Mutex<ReplyRing>>,
}

impl Pipeline {
    pub fn new<T: LbConfig + TopologyConfig>(config: &T) -> std::io::Result<Self> {
        let topology = config.topology();
        topology.validate()?;
        let nodes = topology.node_addrs()?;
        let clients = topology.client_addrs()?;
        let num_nodes = nodes.len();
        let lb = config.lb();

        let reply_rings = (0..clients.len())
            .map(|_| Mutex::new(ReplyRing::new(lb.reply_ring_size())))
            .collect();

        Ok(Self {
            nodes,
            clients,
            num_nodes,
            rset: Arc::new(RSetTable::new(num_nodes)),
            stats: Arc::new(AccessStats::new(
                lb.sample_rate(),
                lb.hk_threshold(),
                lb.max_rkeys(),
                lb.replacement_margin(),
            )),
            migrations: Arc::new(MigrationTable::new(lb.mgr_timeout())),
            ver_next: Arc::new(AtomicU32::new(1)),
            node_load: Arc::new((0..num_nodes).map(|_| AtomicU16::new(0)).collect()),
            reply_rings,
        })
    }

    pub fn rset(&self) -> Arc<RSetTable> {
        self.rset.clone()
    }

    pub fn stats(&self) -> Arc<AccessStats> {
        self.stats.clone()
    }

    pub fn migrations(&self) -> Arc<MigrationTable> {
        self.migrations.clone()
    }

    pub fn ver_next(&self) -> Arc<AtomicU32> {
        self.ver_next.clone()
    }

    pub fn node_load(&self) -> Arc<Vec<AtomicU16>> {
        self.node_load.clone()
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Process one ingress frame, pushing egress datagrams onto `out`.
    pub fn process(&self, frame: &mut [u8], src: SocketAddr, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        LB_PKT.increment();

        let (op, keyhash, client_id, server_id, ver, load, req_id) =
            match HeaderView::parse(frame) {
                Ok(view) => {
                    let req_id = view
                        .payload()
                        .get(..4)
                        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
                    (
                        view.op(),
                        view.keyhash(),
                        view.client_id(),
                        view.server_id(),
                        view.ver(),
                        view.load(),
                        req_id,
                    )
                }
                Err(e) => {
                    // the LB is not authoritative for non-Pegasus traffic:
                    // count it and leave the frame alone
                    LB_PKT_MALFORMED.increment();
                    debug!("malformed frame from {}: {}", src, e);
                    return;
                }
            };

        // detector update for client ops
        if matches!(op, OpType::Read | OpType::Write | OpType::Del) {
            if self.rset.contains(keyhash) {
                self.stats.record_rkey(keyhash);
            } else if let Ok(view) = HeaderView::parse(frame) {
                self.stats.record_ukey(keyhash, view.key());
            }
        }

        match op {
            OpType::Read => self.handle_read(frame, keyhash, out),
            OpType::Write | OpType::Del => self.handle_write(frame, op, keyhash, out),
            OpType::Reply => {
                self.handle_reply(frame, keyhash, client_id, server_id, ver, load, req_id, out)
            }
            OpType::MgrAck => self.handle_mgr_ack(keyhash, server_id, ver),
            OpType::Reset => self.handle_reset(frame, src, out),
            OpType::ResetReply => {
                LB_RESET_REPLY.increment();
            }
            OpType::MgrReq => {
                LB_PKT_UNEXPECTED.increment();
            }
        }
    }

    fn push(&self, out: &mut Vec<(SocketAddr, Vec<u8>)>, node: NodeId, frame: &[u8]) {
        match self.nodes.get(node as usize) {
            Some(addr) => out.push((*addr, frame.to_vec())),
            None => {
                LB_PKT_UNEXPECTED.increment();
                warn!("no address for node {}", node);
            }
        }
    }

    fn handle_read(&self, frame: &mut [u8], keyhash: KeyHash, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        LB_READ.increment();

        let route = self.rset.get(keyhash).and_then(|entry| {
            let guard = entry.read();
            match guard.select() {
                Ok(node) => Some((node, guard.ver_completed())),
                Err(_) => {
                    // brief race between eviction and this read
                    LB_RSET_FALLBACK.increment();
                    None
                }
            }
        });

        let mut hdr = match HeaderMut::parse(frame) {
            Ok(hdr) => hdr,
            Err(_) => return,
        };
        match route {
            Some((node, ver_completed)) => {
                hdr.set_ver(ver_completed);
                hdr.set_server_id(node);
                self.push(out, node, frame);
            }
            None => {
                let node = hash::home(keyhash, self.num_nodes);
                hdr.set_server_id(node);
                self.push(out, node, frame);
            }
        }
    }

    fn handle_write(
        &self,
        frame: &mut [u8],
        op: OpType,
        keyhash: KeyHash,
        out: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        if op == OpType::Del {
            LB_DELETE.increment();
        } else {
            LB_WRITE.increment();
        }

        let ver = self.ver_next.fetch_add(1, Ordering::Relaxed);

        // clear the ack bitmap under the exclusive lock before any copy is
        // emitted, so no ack can race ahead of the fan-out
        let replicas = self.rset.get(keyhash).map(|entry| {
            let mut guard = entry.write();
            guard.begin_write(ver);
            guard.replicas().to_vec()
        });

        match replicas {
            Some(replicas) if !replicas.is_empty() => {
                LB_FANOUT.add(replicas.len() as u64);
                for node in replicas {
                    // logical copy per destination: the transport owns the
                    // buffer once submitted
                    let mut copy = frame.to_vec();
                    if let Ok(mut hdr) = HeaderMut::parse(&mut copy) {
                        hdr.set_ver(ver);
                        hdr.set_server_id(node);
                        self.push(out, node, &copy);
                    }
                }
            }
            _ => {
                let node = hash::home(keyhash, self.num_nodes);
                if let Ok(mut hdr) = HeaderMut::parse(frame) {
                    hdr.set_ver(ver);
                    hdr.set_server_id(node);
                    self.push(out, node, frame);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_reply(
        &self,
        frame: &[u8],
        keyhash: KeyHash,
        client_id: u8,
        server_id: NodeId,
        ver: Version,
        load: u16,
        req_id: Option<u32>,
        out: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        if let Some(slot) = self.node_load.get(server_id as usize) {
            slot.store(load, Ordering::Relaxed);
        }

        // a reply is only counted against the version it carries
        if ver != 0 {
            if let Some(entry) = self.rset.get(keyhash) {
                match entry.write().record_ack(ver, server_id) {
                    AckOutcome::Completed => {
                        LB_WRITE_COMPLETE.increment();
                    }
                    AckOutcome::Mismatch => {
                        LB_ACK_MISMATCH.increment();
                        debug!(
                            "ack mismatch: keyhash {:08x} ver {} from node {}",
                            keyhash, ver, server_id
                        );
                    }
                    _ => {}
                }
            }
        }

        let addr = match self.clients.get(client_id as usize) {
            Some(addr) => *addr,
            None => {
                // internal fetch replies never traverse the LB; anything
                // else with an unroutable client id is dropped after
                // counting
                LB_PKT_UNEXPECTED.increment();
                return;
            }
        };
        let req_id = match req_id {
            Some(req_id) => req_id,
            None => {
                LB_PKT_MALFORMED.increment();
                return;
            }
        };

        // forward the first reply per (client, req_id); suppress the rest
        // of the fan-out duplicates
        let suppressed = {
            let mut ring = self.reply_rings[client_id as usize].lock();
            if ring.contains(req_id) {
                true
            } else {
                ring.push(req_id);
                false
            }
        };
        if suppressed {
            LB_REPLY_SUPPRESSED.increment();
        } else {
            LB_REPLY.increment();
            out.push((addr, frame.to_vec()));
        }
    }

    fn handle_mgr_ack(&self, keyhash: KeyHash, server_id: NodeId, ver: Version) {
        let pending = match self.migrations.complete(keyhash, ver) {
            Some(pending) if pending.node == server_id => pending,
            _ => {
                // an ack after timeout, after reset, or from the wrong
                // node: the slot is gone, never install from it
                LB_ACK_MISMATCH.increment();
                debug!(
                    "unmatched migration ack: keyhash {:08x} ver {} from node {}",
                    keyhash, ver, server_id
                );
                return;
            }
        };

        let home = hash::home(keyhash, self.num_nodes);
        match self.rset.insert_replica(keyhash, home, pending.node, ver) {
            Ok(()) => {
                self.stats.commit_promotion(keyhash, pending.key);
                LB_PROMOTE.increment();
                LB_RKEY_CURRENT.add(1);
            }
            Err(RSetError::Full) => {
                LB_RSET_FULL.increment();
                warn!("replica set full for keyhash {:08x}", keyhash);
            }
            Err(_) => {}
        }
    }

    /// Retire a replicated key: collapse its set onto the home node and
    /// drop the detector bookkeeping. Called from the epoch thread.
    pub fn evict(&self, keyhash: KeyHash) {
        let home = hash::home(keyhash, self.num_nodes);
        if self.rset.evict(keyhash, home) {
            LB_RKEY_CURRENT.sub(1);
        }
        self.stats.commit_eviction(keyhash);
    }

    fn handle_reset(&self, frame: &[u8], src: SocketAddr, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        LB_RESET.increment();
        info!("reset: clearing {} replica sets", self.rset.len());

        self.rset.clear();
        self.stats.clear();
        self.migrations.clear();
        LB_RKEY_CURRENT.set(0);

        // full-fleet fan-out of the reset itself
        for node in self.rset.all_servers() {
            self.push(out, node, frame);
        }

        let mut ack = Vec::new();
        Message::ResetReply(ResetReply {
            result: ResultCode::Ok,
        })
        .compose(&mut ack);
        out.push((src, ack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::hash::keyhash;
    use protocol_pegasus::{MessageParser, MigrationAck, Op, Reply, Request};

    struct TestConfig {
        lb: config::Lb,
        topology: config::Topology,
    }

    impl LbConfig for TestConfig {
        fn lb(&self) -> &config::Lb {
            &self.lb
        }
    }

    impl TopologyConfig for TestConfig {
        fn topology(&self) -> &config::Topology {
            &self.topology
        }
    }

    fn pipeline() -> Pipeline {
        let config = TestConfig {
            lb: toml::from_str("sample_rate = 1\nhk_threshold = 5").unwrap(),
            topology: toml::from_str(
                r#"
                nodes = ["127.0.0.1:7001", "127.0.0.1:7002"]
                clients = ["127.0.0.1:7101"]
                lb = "127.0.0.1:7000"
                "#,
            )
            .unwrap(),
        };
        Pipeline::new(&config).unwrap()
    }

    fn src() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn node_addr(node: NodeId) -> SocketAddr {
        format!("127.0.0.1:{}", 7001 + node as u16).parse().unwrap()
    }

    fn compose(message: &Message) -> Vec<u8> {
        let mut buf = Vec::new();
        message.compose(&mut buf);
        buf
    }

    fn read_frame(key: &[u8], req_id: u32) -> Vec<u8> {
        compose(&Message::Request(Request {
            keyhash: keyhash(key),
            client_id: 0,
            server_id: 0,
            ver: 0,
            req_id,
            key: key.into(),
            op: Op::Read,
        }))
    }

    fn write_frame(key: &[u8], value: &[u8], req_id: u32) -> Vec<u8> {
        compose(&Message::Request(Request {
            keyhash: keyhash(key),
            client_id: 0,
            server_id: 0,
            ver: 0,
            req_id,
            key: key.into(),
            op: Op::Write(value.into()),
        }))
    }

    fn reply_frame(key: &[u8], server_id: NodeId, ver: Version, req_id: u32) -> Vec<u8> {
        compose(&Message::Reply(Reply {
            keyhash: keyhash(key),
            client_id: 0,
            server_id,
            load: 3,
            ver,
            req_id,
            result: ResultCode::Ok,
            value: Box::default(),
        }))
    }

    /// Install an rset {home, replica} for `key` the way a completed
    /// migration would, leaving the version counter past the migration
    /// version as the controller does.
    fn replicate(p: &Pipeline, key: &[u8], replica: NodeId, ver: Version) {
        let h = keyhash(key);
        let home = hash::home(h, p.num_nodes());
        p.ver_next().store(ver + 1, Ordering::Relaxed);
        p.migrations().propose(h, replica, ver, key.into());
        let mut out = Vec::new();
        let mut ack = compose(&Message::MigrationAck(MigrationAck {
            keyhash: h,
            server_id: replica,
            ver,
        }));
        p.process(&mut ack, src(), &mut out);
        assert!(out.is_empty());
        let entry = p.rset().get(h).expect("rset installed");
        assert!(entry.read().contains(home));
        assert!(entry.read().contains(replica));
    }

    #[test]
    fn unreplicated_read_routes_home() {
        let p = pipeline();
        let mut frame = read_frame(b"somekey", 1);
        let mut out = Vec::new();
        p.process(&mut frame, src(), &mut out);

        assert_eq!(out.len(), 1);
        let home = hash::home(keyhash(b"somekey"), 2);
        assert_eq!(out[0].0, node_addr(home));
        let view = HeaderView::parse(&out[0].1).unwrap();
        assert_eq!(view.server_id(), home);
    }

    #[test]
    fn replicated_read_carries_ver_completed() {
        let p = pipeline();
        replicate(&p, b"hot", 1, 7);

        let mut frame = read_frame(b"hot", 2);
        let mut out = Vec::new();
        p.process(&mut frame, src(), &mut out);

        assert_eq!(out.len(), 1);
        let view = HeaderView::parse(&out[0].1).unwrap();
        assert_eq!(view.ver(), 7);
        // destination is a member of the set
        let h = keyhash(b"hot");
        let entry = p.rset().get(h).unwrap();
        assert!(entry.read().contains(view.server_id()));
        assert_eq!(out[0].0, node_addr(view.server_id()));
    }

    #[test]
    fn write_fans_out_one_copy_per_replica() {
        let p = pipeline();
        replicate(&p, b"y", 1, 7);

        let mut frame = write_frame(b"y", b"b", 3);
        let mut out = Vec::new();
        p.process(&mut frame, src(), &mut out);

        // exactly k packets, identical payload, distinct destinations
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].0, out[1].0);
        let a = HeaderView::parse(&out[0].1).unwrap();
        let b = HeaderView::parse(&out[1].1).unwrap();
        assert_eq!(a.ver(), b.ver());
        assert_ne!(a.server_id(), b.server_id());
        assert_eq!(a.payload(), b.payload());
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn fanned_out_write_completes_on_all_acks() {
        let p = pipeline();
        replicate(&p, b"y", 1, 7);
        let h = keyhash(b"y");

        let mut frame = write_frame(b"y", b"b", 3);
        let mut out = Vec::new();
        p.process(&mut frame, src(), &mut out);
        let ver = HeaderView::parse(&out[0].1).unwrap().ver();
        assert!(ver > 7);

        // a read between the emissions and the acks still selects at the
        // old committed version
        let mut read = read_frame(b"y", 4);
        let mut read_out = Vec::new();
        p.process(&mut read, src(), &mut read_out);
        assert_eq!(HeaderView::parse(&read_out[0].1).unwrap().ver(), 7);

        // both replicas ack the new version
        let mut out = Vec::new();
        let mut r0 = reply_frame(b"y", 0, ver, 3);
        p.process(&mut r0, src(), &mut out);
        assert_eq!(p.rset().get(h).unwrap().read().ver_completed(), 7);
        let mut r1 = reply_frame(b"y", 1, ver, 3);
        p.process(&mut r1, src(), &mut out);
        assert_eq!(p.rset().get(h).unwrap().read().ver_completed(), ver);
    }

    #[test]
    fn duplicate_replies_are_suppressed() {
        let p = pipeline();
        replicate(&p, b"y", 1, 7);

        let mut out = Vec::new();
        let mut r0 = reply_frame(b"y", 0, 8, 3);
        p.process(&mut r0, src(), &mut out);
        let mut r1 = reply_frame(b"y", 1, 8, 3);
        p.process(&mut r1, src(), &mut out);

        // only the first reply reaches the client
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "127.0.0.1:7101".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn unreplicated_write_goes_to_home_with_fresh_ver() {
        let p = pipeline();
        let mut frame = write_frame(b"cold", b"v", 1);
        let mut out = Vec::new();
        p.process(&mut frame, src(), &mut out);

        assert_eq!(out.len(), 1);
        let view = HeaderView::parse(&out[0].1).unwrap();
        assert!(view.ver() > 0);
        assert_eq!(view.server_id(), hash::home(keyhash(b"cold"), 2));
    }

    #[test]
    fn versions_are_distinct_across_writes() {
        let p = pipeline();
        let mut vers = Vec::new();
        for req_id in 0..4 {
            let mut frame = write_frame(b"k", b"v", req_id);
            let mut out = Vec::new();
            p.process(&mut frame, src(), &mut out);
            vers.push(HeaderView::parse(&out[0].1).unwrap().ver());
        }
        vers.dedup();
        assert_eq!(vers.len(), 4);
        assert!(vers.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn migration_ack_with_wrong_version_does_not_install() {
        let p = pipeline();
        let h = keyhash(b"k");
        p.migrations().propose(h, 1, 10, (*b"k").into());

        let mut ack = compose(&Message::MigrationAck(MigrationAck {
            keyhash: h,
            server_id: 1,
            ver: 9,
        }));
        let mut out = Vec::new();
        p.process(&mut ack, src(), &mut out);
        assert!(p.rset().get(h).is_none());
        // the handshake is still outstanding
        assert!(p.migrations().contains(h));
    }

    #[test]
    fn eviction_falls_back_to_home() {
        let p = pipeline();
        replicate(&p, b"p", 1, 7);
        let h = keyhash(b"p");

        p.evict(h);
        assert!(p.rset().get(h).is_none());
        assert_eq!(p.stats().rkey_count(), 0);

        let mut frame = read_frame(b"p", 9);
        let mut out = Vec::new();
        p.process(&mut frame, src(), &mut out);
        assert_eq!(
            HeaderView::parse(&out[0].1).unwrap().server_id(),
            hash::home(h, 2)
        );
    }

    #[test]
    fn malformed_frame_is_counted_and_ignored() {
        let p = pipeline();
        let mut garbage = b"ethernet frame of some other protocol".to_vec();
        let before = garbage.clone();
        let mut out = Vec::new();
        p.process(&mut garbage, src(), &mut out);
        assert!(out.is_empty());
        // the frame itself is left untouched
        assert_eq!(garbage, before);
    }

    #[test]
    fn reset_clears_state_and_fans_out() {
        let p = pipeline();
        replicate(&p, b"hot", 1, 7);
        assert_eq!(p.rset().len(), 1);

        let controller = src();
        let mut frame = compose(&Message::Reset);
        let mut out = Vec::new();
        p.process(&mut frame, controller, &mut out);

        assert!(p.rset().is_empty());
        assert_eq!(p.stats().rkey_count(), 0);

        // one reset per node plus the reply to the controller
        assert_eq!(out.len(), 3);
        let reply = out.last().unwrap();
        assert_eq!(reply.0, controller);
        match MessageParser::new().parse_frame(&reply.1).unwrap() {
            Message::ResetReply(r) => assert_eq!(r.result, ResultCode::Ok),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reads_accumulate_hot_key_candidates() {
        let p = pipeline();
        for req_id in 0..5 {
            let mut frame = read_frame(b"x", req_id);
            let mut out = Vec::new();
            p.process(&mut frame, src(), &mut out);
        }
        let proposals = p.stats().epoch_decisions(0);
        assert_eq!(proposals.len(), 1);
    }
}
