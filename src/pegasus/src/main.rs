// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! The entry point into a Pegasus node. Parses the command line, loads the
//! configuration, and launches the threads for the selected role.

#[macro_use]
extern crate log;

use backtrace::Backtrace;
use clap::{App, Arg};
use client::{Client, Dynamism, KeyDist, Workload};
use config::{PegasusConfig, WorkerConfig};
use kvnode::KvnodeBuilder;
use lb::LoadBalancerBuilder;
use pegasus::{dump_metrics, load_keys, Pegasus};

use std::sync::Arc;
use std::time::Duration;

// exit codes
const EXIT_CONFIG: i32 = 1;
const EXIT_TRANSPORT: i32 = 2;

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        error!("{}", s);
        eprintln!("{:?}", Backtrace::new());
        std::process::exit(101);
    }));

    // initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // parse command line options
    let matches = App::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_about(
            "A load-balanced, replicated in-memory key-value cache. The \
            load balancer replicates hot keys across the backend fleet and \
            keeps replicas coherent with version-ordered writes. One binary \
            hosts the load balancer, the backend server, and the synthetic \
            client.",
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .value_name("FILE")
                .help("Topology and tuning configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("role")
                .long("role")
                .value_name("ROLE")
                .help("Entry point: client, server, or lb")
                .possible_values(&["client", "server", "lb"])
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("duration")
                .long("duration")
                .value_name("SECONDS")
                .help("Total run time; 0 runs until killed")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("keys")
                .long("keys")
                .value_name("FILE")
                .help("Keyfile for the workload, one key per line")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("value-len")
                .long("value-len")
                .value_name("BYTES")
                .help("Synthetic value size")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("get-ratio")
                .long("get-ratio")
                .value_name("FRACTION")
                .help("Fraction of GETs; remainder after put-ratio is DEL")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("put-ratio")
                .long("put-ratio")
                .value_name("FRACTION")
                .help("Fraction of PUTs")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("key-dist")
                .long("key-dist")
                .value_name("DIST")
                .help("Key popularity distribution")
                .possible_values(&["uniform", "zipf"])
                .takes_value(true),
        )
        .arg(
            Arg::with_name("alpha")
                .long("alpha")
                .value_name("SKEW")
                .help("Zipf skew parameter")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dynamism")
                .long("dynamism")
                .value_name("MODE")
                .help("Workload shift mode")
                .possible_values(&["none", "hotin", "random"])
                .takes_value(true),
        )
        .arg(
            Arg::with_name("d-interval")
                .long("d-interval")
                .value_name("MICROSECONDS")
                .help("Interval between workload shifts")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("d-nkeys")
                .long("d-nkeys")
                .value_name("COUNT")
                .help("Keys moved per workload shift")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("mean-interval")
                .long("mean-interval")
                .value_name("MICROSECONDS")
                .help("Poisson mean inter-arrival time per sender; 0 sends at full rate")
                .takes_value(true),
        )
        .get_matches();

    // load config from file
    let config = if let Some(file) = matches.value_of("config") {
        match PegasusConfig::load(file) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("unable to load config file: {}", e);
                std::process::exit(EXIT_CONFIG);
            }
        }
    } else {
        Default::default()
    };

    let duration: u64 = parse_flag(&matches, "duration", 60);

    match matches.value_of("role").unwrap() {
        "lb" => {
            let lb = match LoadBalancerBuilder::new(&config) {
                Ok(builder) => builder.spawn(),
                Err(e) => {
                    eprintln!("error launching load balancer: {}", e);
                    std::process::exit(EXIT_TRANSPORT);
                }
            };
            info!("load balancer running");
            run_for(Pegasus::LoadBalancer(lb), duration);
        }
        "server" => {
            let node = match KvnodeBuilder::new(&config, config.node_id()) {
                Ok(builder) => builder.spawn(),
                Err(e) => {
                    eprintln!("error launching server: {}", e);
                    std::process::exit(EXIT_TRANSPORT);
                }
            };
            info!("server {} running", config.node_id());
            run_for(Pegasus::Server(node), duration);
        }
        "client" => {
            run_client(&matches, &config, duration);
        }
        _ => unreachable!(),
    }

    dump_metrics();
}

/// Drive a server-side role for the requested duration, or forever.
fn run_for(role: Pegasus, duration: u64) {
    if duration == 0 {
        role.wait();
    } else {
        std::thread::sleep(Duration::from_secs(duration));
        role.shutdown();
    }
}

fn run_client(matches: &clap::ArgMatches, config: &PegasusConfig, duration: u64) {
    let keyfile = match matches.value_of("keys") {
        Some(keyfile) => keyfile,
        None => {
            eprintln!("client role requires --keys");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let keys = match load_keys(keyfile) {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("unable to load keyfile: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let get_ratio: f32 = parse_flag(matches, "get-ratio", 0.9);
    let put_ratio: f32 = parse_flag(matches, "put-ratio", 0.1);
    if !(0.0..=1.0).contains(&(get_ratio + put_ratio)) {
        eprintln!("get-ratio + put-ratio must be within [0.0, 1.0]");
        std::process::exit(EXIT_CONFIG);
    }

    let key_dist = match matches.value_of("key-dist").unwrap_or("uniform") {
        "zipf" => KeyDist::Zipf,
        _ => KeyDist::Uniform,
    };
    let dynamism = match matches.value_of("dynamism").unwrap_or("none") {
        "hotin" => Dynamism::HotIn,
        "random" => Dynamism::Random,
        _ => Dynamism::None,
    };

    let workload = Arc::new(Workload::new(
        keys,
        parse_flag(matches, "value-len", 64),
        get_ratio,
        put_ratio,
        key_dist,
        parse_flag(matches, "alpha", 1.0),
        dynamism,
        parse_flag(matches, "d-nkeys", 0),
        parse_flag(matches, "mean-interval", 0.0),
    ));

    let client = match Client::new(
        config,
        config.client_id(),
        workload,
        config.worker().threads(),
        Duration::from_secs(duration.max(1)),
        Duration::from_micros(parse_flag(matches, "d-interval", 0)),
    ) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error launching client: {}", e);
            std::process::exit(EXIT_TRANSPORT);
        }
    };

    match client.run() {
        Ok(stats) => stats.report(),
        Err(e) => {
            eprintln!("client run failed: {}", e);
            std::process::exit(EXIT_TRANSPORT);
        }
    }
}

fn parse_flag<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str, default: T) -> T {
    match matches.value_of(name) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            eprintln!("invalid value for --{}: {}", name, value);
            std::process::exit(EXIT_CONFIG);
        }),
        None => default,
    }
}
