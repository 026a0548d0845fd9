// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;

use common::NodeId;

// constants to define default values
const NUM_RACKS: usize = 1;

// helper functions
fn num_racks() -> usize {
    NUM_RACKS
}

/// The fleet layout every role must agree on: backend node addresses in
/// node-id order, client addresses in client-id order, and the LB address
/// on the data path between them.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Topology {
    #[serde(default = "num_racks")]
    num_racks: usize,
    #[serde(default)]
    nodes: Vec<String>,
    #[serde(default)]
    clients: Vec<String>,
    #[serde(default)]
    lb: String,
    #[serde(default)]
    controller: String,
}

impl Topology {
    pub fn num_racks(&self) -> usize {
        self.num_racks
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::new(ErrorKind::Other, "topology lists no nodes"));
        }
        if self.nodes.len() > NodeId::MAX as usize {
            return Err(Error::new(ErrorKind::Other, "too many nodes for 8-bit ids"));
        }
        if self.clients.len() > common::INTERNAL_CLIENT_ID as usize {
            return Err(Error::new(
                ErrorKind::Other,
                "too many clients for 8-bit ids",
            ));
        }
        Ok(())
    }

    pub fn node_addr(&self, node: NodeId) -> Result<SocketAddr> {
        self.nodes
            .get(node as usize)
            .ok_or_else(|| Error::new(ErrorKind::Other, "node id out of range"))
            .and_then(|a| parse_addr(a))
    }

    pub fn node_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.nodes.iter().map(|a| parse_addr(a)).collect()
    }

    pub fn client_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.clients.iter().map(|a| parse_addr(a)).collect()
    }

    pub fn lb_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.lb)
    }

    pub fn controller_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.controller)
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|_| Error::new(ErrorKind::Other, format!("bad address: {}", addr)))
}
