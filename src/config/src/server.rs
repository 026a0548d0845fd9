// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// constants to define default values
const LOAD_EPOCH: u64 = 1_000;
const DEFAULT_VALUE: &str = "";
const REPORT_LOAD: bool = true;

// helper functions
fn load_epoch() -> u64 {
    LOAD_EPOCH
}

fn default_value() -> String {
    DEFAULT_VALUE.to_owned()
}

fn report_load() -> bool {
    REPORT_LOAD
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct Server {
    #[serde(default = "load_epoch")]
    load_epoch: u64,
    #[serde(default = "default_value")]
    default_value: String,
    #[serde(default = "report_load")]
    report_load: bool,
}

// implementation
impl Server {
    /// Width of the rolling window for load reporting, in microseconds.
    pub fn load_epoch(&self) -> u64 {
        self.load_epoch
    }

    /// Value returned for reads against keys not in the store.
    pub fn default_value(&self) -> &str {
        &self.default_value
    }

    /// Whether replies carry the rolling request count in the load field.
    pub fn report_load(&self) -> bool {
        self.report_load
    }
}

// trait implementations
impl Default for Server {
    fn default() -> Self {
        Self {
            load_epoch: load_epoch(),
            default_value: default_value(),
            report_load: report_load(),
        }
    }
}
