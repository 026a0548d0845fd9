// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Configuration for the Pegasus roles: a toml file with a `[topology]`
//! table shared by every role plus per-role tuning sections. Library crates
//! accept any type implementing the relevant `*Config` traits so the same
//! sections can be embedded in other harnesses (integration tests build
//! them inline).

#[macro_use]
extern crate log;

mod lb;
mod server;
mod topology;
mod worker;

pub use lb::Lb;
pub use server::Server;
pub use topology::Topology;
pub use worker::Worker;

use serde::{Deserialize, Serialize};

use std::io::Read;

use common::NodeId;

// constants to define default values
const NODE_ID: NodeId = 0;
const CLIENT_ID: u8 = 0;

// helper functions
fn node_id() -> NodeId {
    NODE_ID
}

fn client_id() -> u8 {
    CLIENT_ID
}

pub trait WorkerConfig {
    fn worker(&self) -> &Worker;
}

pub trait LbConfig {
    fn lb(&self) -> &Lb;
}

pub trait ServerConfig {
    fn server(&self) -> &Server;
}

pub trait TopologyConfig {
    fn topology(&self) -> &Topology;
}

// struct definitions
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PegasusConfig {
    // top-level
    #[serde(default = "node_id")]
    node_id: NodeId,
    #[serde(default = "client_id")]
    client_id: u8,

    // application modules
    #[serde(default)]
    worker: Worker,
    #[serde(default)]
    lb: Lb,
    #[serde(default)]
    server: Server,
    #[serde(default)]
    topology: Topology,
}

// implementation
impl PegasusConfig {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let config: Self = match toml::from_str(&content) {
            Ok(t) => t,
            Err(e) => {
                error!("{}", e);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "Error parsing config",
                ));
            }
        };
        config.topology.validate()?;
        Ok(config)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn client_id(&self) -> u8 {
        self.client_id
    }
}

// trait implementations
impl WorkerConfig for PegasusConfig {
    fn worker(&self) -> &Worker {
        &self.worker
    }
}

impl LbConfig for PegasusConfig {
    fn lb(&self) -> &Lb {
        &self.lb
    }
}

impl ServerConfig for PegasusConfig {
    fn server(&self) -> &Server {
        &self.server
    }
}

impl TopologyConfig for PegasusConfig {
    fn topology(&self) -> &Topology {
        &self.topology
    }
}
