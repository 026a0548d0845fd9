// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Per-datagram dispatch for the backend kernel: keyed operations against
//! the store, the replica-install side of the migration handshake, and
//! fleet reset.

use crate::load::LoadTracker;
use crate::store::Store;
use crate::{KV_MALFORMED, KV_MGR_ACK, KV_MGR_FETCH, KV_MGR_REQ, KV_RESET, KV_UNEXPECTED};

use common::{KeyHash, NodeId, Version, INTERNAL_CLIENT_ID};
use config::{ServerConfig, TopologyConfig};
use dashmap::DashMap;
use protocol_common::{Compose, Execute};
use protocol_pegasus::{
    Message, MessageParser, MigrationAck, MigrationReq, Op, Reply, Request, ResetReply,
    ResultCode,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Fetch {
    key: Box<[u8]>,
    keyhash: KeyHash,
    ver: Version,
}

pub struct Processor {
    node_id: NodeId,
    report_load: bool,
    lb_addr: SocketAddr,
    node_addrs: Vec<SocketAddr>,
    parser: MessageParser,
    store: Arc<Store>,
    load: Arc<LoadTracker>,
    // fetches outstanding against authoritative owners, keyed by the
    // internal req_id the owner will echo
    pending_fetch: DashMap<u32, Fetch>,
    fetch_req_id: AtomicU32,
}

impl Processor {
    pub fn new<T: ServerConfig + TopologyConfig>(
        config: &T,
        node_id: NodeId,
        store: Arc<Store>,
        load: Arc<LoadTracker>,
    ) -> std::io::Result<Self> {
        Ok(Self {
            node_id,
            report_load: config.server().report_load(),
            lb_addr: config.topology().lb_addr()?,
            node_addrs: config.topology().node_addrs()?,
            parser: MessageParser::new(),
            store,
            load,
            pending_fetch: DashMap::new(),
            fetch_req_id: AtomicU32::new(1),
        })
    }

    /// Process one ingress datagram, pushing any egress datagrams onto
    /// `out`. Runs to completion; no suspension points.
    pub fn handle_frame(
        &self,
        frame: &[u8],
        src: SocketAddr,
        out: &mut Vec<(SocketAddr, Vec<u8>)>,
    ) {
        let message = match self.parser.parse_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                KV_MALFORMED.increment();
                debug!("malformed frame from {}: {}", src, e);
                return;
            }
        };

        match message {
            Message::Request(request) => {
                self.load.record();
                let reply = self.execute(&request);
                out.push((src, compose(&Message::Reply(reply))));
            }
            Message::MigrationReq(mgr) => self.handle_migration_req(mgr, out),
            Message::Reply(reply) if reply.client_id == INTERNAL_CLIENT_ID => {
                self.handle_fetch_reply(reply, out)
            }
            Message::Reset => {
                KV_RESET.increment();
                self.store.clear();
                self.pending_fetch.clear();
                out.push((
                    src,
                    compose(&Message::ResetReply(ResetReply {
                        result: ResultCode::Ok,
                    })),
                ));
            }
            _ => {
                KV_UNEXPECTED.increment();
                debug!("unexpected message from {}", src);
            }
        }
    }

    /// Install side of a promotion. When the key is already known locally
    /// (or this node is the authoritative owner) the ack goes out
    /// immediately; otherwise the current value is fetched from the owner
    /// with an internal read and the ack is deferred to the fetch reply.
    fn handle_migration_req(&self, mgr: MigrationReq, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        KV_MGR_REQ.increment();

        if mgr.owner == self.node_id || self.store.contains(&mgr.key) {
            KV_MGR_ACK.increment();
            out.push((self.lb_addr, compose(&ack(mgr.keyhash, self.node_id, mgr.ver))));
            return;
        }

        let owner_addr = match self.node_addrs.get(mgr.owner as usize) {
            Some(addr) => *addr,
            None => {
                KV_UNEXPECTED.increment();
                warn!("migration names unknown owner {}", mgr.owner);
                return;
            }
        };

        let req_id = self.fetch_req_id.fetch_add(1, Ordering::Relaxed);
        self.pending_fetch.insert(
            req_id,
            Fetch {
                key: mgr.key.clone(),
                keyhash: mgr.keyhash,
                ver: mgr.ver,
            },
        );

        let fetch = Message::Request(Request {
            keyhash: mgr.keyhash,
            client_id: INTERNAL_CLIENT_ID,
            server_id: mgr.owner,
            ver: mgr.ver,
            req_id,
            key: mgr.key,
            op: Op::Read,
        });
        out.push((owner_addr, compose(&fetch)));
    }

    fn handle_fetch_reply(&self, reply: Reply, out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        let fetch = match self.pending_fetch.remove(&reply.req_id) {
            Some((_, fetch)) => fetch,
            None => {
                KV_UNEXPECTED.increment();
                return;
            }
        };
        KV_MGR_FETCH.increment();

        if reply.result == ResultCode::Ok {
            // the owner's value is authoritative as of max(its installed
            // version, the migration version); a never-written key installs
            // nothing and this replica serves the default like the home does
            self.store
                .write(&fetch.key, &reply.value, reply.ver.max(fetch.ver));
        }

        KV_MGR_ACK.increment();
        out.push((
            self.lb_addr,
            compose(&ack(fetch.keyhash, self.node_id, fetch.ver)),
        ));
    }
}

impl Execute<Request, Reply> for Processor {
    fn execute(&self, request: &Request) -> Reply {
        let (result, value, ver) = match &request.op {
            Op::Read => self.store.read(&request.key),
            Op::Write(value) => {
                let installed = self.store.write(&request.key, value, request.ver);
                (ResultCode::Ok, Box::default(), installed)
            }
            Op::Del => {
                let installed = self.store.delete(&request.key, request.ver);
                (ResultCode::Ok, Box::default(), installed)
            }
        };

        Reply {
            keyhash: request.keyhash,
            client_id: request.client_id,
            server_id: self.node_id,
            load: if self.report_load { self.load.load() } else { 0 },
            ver,
            req_id: request.req_id,
            result,
            value,
        }
    }
}

fn ack(keyhash: KeyHash, server_id: NodeId, ver: Version) -> Message {
    Message::MigrationAck(MigrationAck {
        keyhash,
        server_id,
        ver,
    })
}

fn compose(message: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    message.compose(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::hash::keyhash;

    struct TestConfig {
        server: config::Server,
        topology: config::Topology,
    }

    impl ServerConfig for TestConfig {
        fn server(&self) -> &config::Server {
            &self.server
        }
    }

    impl TopologyConfig for TestConfig {
        fn topology(&self) -> &config::Topology {
            &self.topology
        }
    }

    fn test_config() -> TestConfig {
        TestConfig {
            server: Default::default(),
            topology: toml::from_str(
                r#"
                nodes = ["127.0.0.1:7001", "127.0.0.1:7002"]
                clients = ["127.0.0.1:7101"]
                lb = "127.0.0.1:7000"
                "#,
            )
            .unwrap(),
        }
    }

    fn processor(node_id: NodeId) -> Processor {
        let store = Arc::new(Store::new(b""));
        let load = Arc::new(LoadTracker::new(1_000));
        Processor::new(&test_config(), node_id, store, load).unwrap()
    }

    fn client_src() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[test]
    fn write_then_read_replies_to_source() {
        let p = processor(0);
        let mut out = Vec::new();

        let write = Message::Request(Request {
            keyhash: keyhash(b"x"),
            client_id: 0,
            server_id: 0,
            ver: 1,
            req_id: 10,
            key: (*b"x").into(),
            op: Op::Write((*b"a").into()),
        });
        p.handle_frame(&compose(&write), client_src(), &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, client_src());

        out.clear();
        let read = Message::Request(Request {
            keyhash: keyhash(b"x"),
            client_id: 0,
            server_id: 0,
            ver: 1,
            req_id: 11,
            key: (*b"x").into(),
            op: Op::Read,
        });
        p.handle_frame(&compose(&read), client_src(), &mut out);
        let reply = match MessageParser::new().parse_frame(&out[0].1).unwrap() {
            Message::Reply(reply) => reply,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reply.result, ResultCode::Ok);
        assert_eq!(&*reply.value, b"a");
        assert_eq!(reply.ver, 1);
        assert_eq!(reply.req_id, 11);
    }

    #[test]
    fn stale_write_acks_installed_version() {
        let p = processor(0);
        let mut out = Vec::new();
        for (ver, value, req_id) in [(5u32, b"new", 1u32), (3, b"old", 2)] {
            let write = Message::Request(Request {
                keyhash: keyhash(b"k"),
                client_id: 0,
                server_id: 0,
                ver,
                req_id,
                key: (*b"k").into(),
                op: Op::Write((*value).into()),
            });
            p.handle_frame(&compose(&write), client_src(), &mut out);
        }
        let reply = match MessageParser::new().parse_frame(&out[1].1).unwrap() {
            Message::Reply(reply) => reply,
            other => panic!("unexpected {:?}", other),
        };
        // the discarded write still acks, carrying the installed version
        assert_eq!(reply.ver, 5);
    }

    #[test]
    fn migration_with_local_key_acks_immediately() {
        let p = processor(1);
        let mut out = Vec::new();
        let write = Message::Request(Request {
            keyhash: keyhash(b"hot"),
            client_id: 0,
            server_id: 1,
            ver: 2,
            req_id: 1,
            key: (*b"hot").into(),
            op: Op::Write((*b"v").into()),
        });
        p.handle_frame(&compose(&write), client_src(), &mut out);
        out.clear();

        let mgr = Message::MigrationReq(MigrationReq {
            keyhash: keyhash(b"hot"),
            owner: 0,
            ver: 9,
            key: (*b"hot").into(),
        });
        p.handle_frame(&compose(&mgr), client_src(), &mut out);
        assert_eq!(out.len(), 1);
        // ack goes to the LB ingress address
        assert_eq!(out[0].0, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
        match MessageParser::new().parse_frame(&out[0].1).unwrap() {
            Message::MigrationAck(ack) => {
                assert_eq!(ack.server_id, 1);
                assert_eq!(ack.ver, 9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn migration_without_local_key_fetches_from_owner() {
        let p = processor(1);
        let mut out = Vec::new();
        let mgr = Message::MigrationReq(MigrationReq {
            keyhash: keyhash(b"cold"),
            owner: 0,
            ver: 9,
            key: (*b"cold").into(),
        });
        p.handle_frame(&compose(&mgr), client_src(), &mut out);

        // an internal read is sent to the owner, no ack yet
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "127.0.0.1:7001".parse::<SocketAddr>().unwrap());
        let fetch = match MessageParser::new().parse_frame(&out[0].1).unwrap() {
            Message::Request(request) => request,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(fetch.client_id, INTERNAL_CLIENT_ID);
        assert_eq!(fetch.op, Op::Read);

        // the owner's reply installs the value and releases the ack
        out.clear();
        let owner_reply = Message::Reply(Reply {
            keyhash: keyhash(b"cold"),
            client_id: INTERNAL_CLIENT_ID,
            server_id: 0,
            load: 0,
            ver: 4,
            req_id: fetch.req_id,
            result: ResultCode::Ok,
            value: (*b"vv").into(),
        });
        p.handle_frame(&compose(&owner_reply), client_src(), &mut out);
        assert_eq!(out.len(), 1);
        match MessageParser::new().parse_frame(&out[0].1).unwrap() {
            Message::MigrationAck(ack) => assert_eq!(ack.ver, 9),
            other => panic!("unexpected {:?}", other),
        }

        // the value is now served locally at the migration version
        let mut read_out = Vec::new();
        let read = Message::Request(Request {
            keyhash: keyhash(b"cold"),
            client_id: 0,
            server_id: 1,
            ver: 9,
            req_id: 50,
            key: (*b"cold").into(),
            op: Op::Read,
        });
        p.handle_frame(&compose(&read), client_src(), &mut read_out);
        match MessageParser::new().parse_frame(&read_out[0].1).unwrap() {
            Message::Reply(reply) => {
                assert_eq!(&*reply.value, b"vv");
                assert_eq!(reply.ver, 9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reset_clears_store_and_acks() {
        let p = processor(0);
        let mut out = Vec::new();
        let write = Message::Request(Request {
            keyhash: keyhash(b"x"),
            client_id: 0,
            server_id: 0,
            ver: 1,
            req_id: 1,
            key: (*b"x").into(),
            op: Op::Write((*b"a").into()),
        });
        p.handle_frame(&compose(&write), client_src(), &mut out);
        out.clear();

        p.handle_frame(&compose(&Message::Reset), client_src(), &mut out);
        match MessageParser::new().parse_frame(&out[0].1).unwrap() {
            Message::ResetReply(r) => assert_eq!(r.result, ResultCode::Ok),
            other => panic!("unexpected {:?}", other),
        }

        out.clear();
        let read = Message::Request(Request {
            keyhash: keyhash(b"x"),
            client_id: 0,
            server_id: 0,
            ver: 0,
            req_id: 2,
            key: (*b"x").into(),
            op: Op::Read,
        });
        p.handle_frame(&compose(&read), client_src(), &mut out);
        match MessageParser::new().parse_frame(&out[0].1).unwrap() {
            Message::Reply(reply) => assert_eq!(reply.result, ResultCode::NotFound),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_frame_is_counted_not_answered() {
        let p = processor(0);
        let mut out = Vec::new();
        p.handle_frame(b"not a pegasus frame", client_src(), &mut out);
        assert!(out.is_empty());
    }
}
