// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const THREADS: usize = 1;
const TIMEOUT: usize = 100;
const NEVENT: usize = 1024;

// helper functions
fn threads() -> usize {
    THREADS
}

fn timeout() -> usize {
    TIMEOUT
}

fn nevent() -> usize {
    NEVENT
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Worker {
    #[serde(default = "threads")]
    threads: usize,
    #[serde(default = "timeout")]
    timeout: usize,
    #[serde(default = "nevent")]
    nevent: usize,
}

// implementation
impl Worker {
    /// Number of data-path worker threads; each owns its own socket.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Poll timeout in milliseconds.
    pub fn timeout(&self) -> usize {
        self.timeout
    }

    /// Maximum events returned per poll.
    pub fn nevent(&self) -> usize {
        self.nevent
    }
}

// trait implementations
impl Default for Worker {
    fn default() -> Self {
        Self {
            threads: threads(),
            timeout: timeout(),
            nevent: nevent(),
        }
    }
}
