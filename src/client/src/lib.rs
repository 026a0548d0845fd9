// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Synthetic Pegasus client: sender threads draw operations from the
//! workload generator and issue them through the load balancer; a receiver
//! thread matches replies to pending requests and records latency. The run
//! is split into warmup, record, and cooldown phases and only the record
//! phase contributes to the reported histogram.

#[macro_use]
extern crate log;

pub mod workload;

pub use workload::{Dynamism, Generator, KeyDist, NextOperation, OpKind, Workload};

use common::hash::{home, keyhash};
use config::TopologyConfig;
use dashmap::DashMap;
use hdrhistogram::Histogram;
use protocol_common::Compose;
use protocol_pegasus::{Message, MessageParser, Op, Request, ResultCode};

use std::io::{ErrorKind, Result};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// run phases, per the warmup/record/cooldown split
const PHASE_WARMUP: u8 = 0;
const PHASE_RECORD: u8 = 1;
const PHASE_COOLDOWN: u8 = 2;

const WARMUP_FRACTION: f64 = 0.2;
const RECORD_FRACTION: f64 = 0.6;

// largest latency the histogram can hold: 1 second, in nanoseconds
const MAX_LATENCY: u64 = 1_000_000_000;

struct PendingRequest {
    start: Instant,
    recorded: bool,
}

struct Shared {
    socket: UdpSocket,
    lb_addr: std::net::SocketAddr,
    num_nodes: usize,
    client_id: u8,
    req_id: AtomicU32,
    pending: DashMap<u32, PendingRequest>,
    phase: AtomicU8,
    running: AtomicBool,
    issued: AtomicU64,
    completed: AtomicU64,
    misses: AtomicU64,
}

/// Latency and throughput over the record phase.
pub struct RunStats {
    pub histogram: Histogram<u64>,
    pub completed: u64,
    pub misses: u64,
    pub issued: u64,
    pub elapsed: Duration,
}

impl RunStats {
    /// Log the run summary.
    pub fn report(&self) {
        let rate = self.completed as f64 / self.elapsed.as_secs_f64();
        info!("rate: {:.2} rps", rate);
        info!("issued: {} completed: {} misses: {}", self.issued, self.completed, self.misses);
        info!("min: {} ns", self.histogram.min());
        for (label, quantile) in [
            ("p25", 0.25),
            ("p50", 0.50),
            ("p75", 0.75),
            ("p90", 0.90),
            ("p99", 0.99),
            ("p999", 0.999),
        ] {
            info!(
                "{}: {} ns",
                label,
                self.histogram.value_at_quantile(quantile)
            );
        }
        info!("max: {} ns", self.histogram.max());
    }
}

pub struct Client {
    shared: Arc<Shared>,
    workload: Arc<Workload>,
    threads: usize,
    duration: Duration,
    d_interval: Duration,
}

impl Client {
    pub fn new<T: TopologyConfig>(
        config: &T,
        client_id: u8,
        workload: Arc<Workload>,
        threads: usize,
        duration: Duration,
        d_interval: Duration,
    ) -> Result<Self> {
        let topology = config.topology();
        topology.validate()?;
        let bind = topology
            .client_addrs()?
            .get(client_id as usize)
            .copied()
            .ok_or_else(|| {
                std::io::Error::new(ErrorKind::Other, "client id not in topology")
            })?;
        let socket = UdpSocket::bind(bind)?;
        socket.set_read_timeout(Some(Duration::from_millis(50)))?;

        Ok(Self {
            shared: Arc::new(Shared {
                socket,
                lb_addr: topology.lb_addr()?,
                num_nodes: topology.num_nodes(),
                client_id,
                req_id: AtomicU32::new(1),
                pending: DashMap::new(),
                phase: AtomicU8::new(PHASE_WARMUP),
                running: AtomicBool::new(true),
                issued: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
            workload,
            threads: threads.max(1),
            duration,
            d_interval,
        })
    }

    /// Run the workload to completion and return the record-phase stats.
    pub fn run(self) -> Result<RunStats> {
        let mut senders = Vec::with_capacity(self.threads);
        for id in 0..self.threads {
            let shared = self.shared.clone();
            let generator = Generator::new(self.workload.clone());
            senders.push(
                std::thread::Builder::new()
                    .name(format!("pegasus_client_send_{}", id))
                    .spawn(move || sender(shared, generator))
                    .unwrap(),
            );
        }
        let receiver = {
            let shared = self.shared.clone();
            std::thread::Builder::new()
                .name("pegasus_client_recv".to_string())
                .spawn(move || receiver(shared))
                .unwrap()
        };

        // phase timeline, with workload dynamism applied on its interval
        let warmup = self.duration.mul_f64(WARMUP_FRACTION);
        let record = self.duration.mul_f64(RECORD_FRACTION);
        let cooldown = self.duration.saturating_sub(warmup + record);

        let mut rng = rand::thread_rng();
        let dynamism = self.workload.dynamism() != Dynamism::None
            && !self.d_interval.is_zero();

        self.pace(warmup, dynamism, &mut rng);
        info!("warmup complete, recording");
        self.shared.phase.store(PHASE_RECORD, Ordering::Release);
        let record_start = Instant::now();
        self.pace(record, dynamism, &mut rng);
        let elapsed = record_start.elapsed();
        self.shared.phase.store(PHASE_COOLDOWN, Ordering::Release);
        info!("record complete, cooling down");
        self.pace(cooldown, dynamism, &mut rng);

        self.shared.running.store(false, Ordering::Release);
        for thread in senders {
            let _ = thread.join();
        }
        let histogram = receiver
            .join()
            .map_err(|_| std::io::Error::new(ErrorKind::Other, "receiver panicked"))?;

        Ok(RunStats {
            histogram,
            completed: self.shared.completed.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            issued: self.shared.issued.load(Ordering::Relaxed),
            elapsed,
        })
    }

    /// Sleep through a phase, applying key dynamism on its interval.
    fn pace<R: rand::Rng>(&self, span: Duration, dynamism: bool, rng: &mut R) {
        if !dynamism {
            std::thread::sleep(span);
            return;
        }
        let deadline = Instant::now() + span;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let step = self.d_interval.min(deadline - now);
            std::thread::sleep(step);
            self.workload.change_keys(rng);
        }
    }
}

fn sender(shared: Arc<Shared>, mut generator: Generator) {
    let mut buf = Vec::with_capacity(512);

    while shared.running.load(Ordering::Acquire) {
        let next = generator.next_operation();
        if next.delay_us > 0 {
            std::thread::sleep(Duration::from_micros(next.delay_us));
        }

        let h = keyhash(&next.key);
        let req_id = shared.req_id.fetch_add(1, Ordering::Relaxed);
        let op = match next.kind {
            OpKind::Get => Op::Read,
            OpKind::Put => Op::Write(generator.workload().value().into()),
            OpKind::Del => Op::Del,
        };

        shared.pending.insert(
            req_id,
            PendingRequest {
                start: Instant::now(),
                recorded: shared.phase.load(Ordering::Acquire) == PHASE_RECORD,
            },
        );

        buf.clear();
        Message::Request(Request {
            keyhash: h,
            client_id: shared.client_id,
            server_id: home(h, shared.num_nodes),
            ver: 0,
            req_id,
            key: next.key,
            op,
        })
        .compose(&mut buf);

        match shared.socket.send_to(&buf, shared.lb_addr) {
            Ok(_) => {
                shared.issued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("send failed: {}", e);
            }
        }
    }
}

fn receiver(shared: Arc<Shared>) -> Histogram<u64> {
    let parser = MessageParser::new();
    let mut histogram =
        Histogram::new_with_max(MAX_LATENCY, 3).expect("histogram construction cannot fail");
    let mut buf = vec![0u8; 64 * 1024];

    while shared.running.load(Ordering::Acquire) || !shared.pending.is_empty() {
        let len = match shared.socket.recv(&mut buf) {
            Ok(len) => len,
            Err(e)
                if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
            {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                continue;
            }
            Err(e) => {
                error!("recv error: {}", e);
                break;
            }
        };

        let reply = match parser.parse_frame(&buf[..len]) {
            Ok(Message::Reply(reply)) => reply,
            Ok(_) => continue,
            Err(e) => {
                debug!("malformed reply: {}", e);
                continue;
            }
        };

        // first reply completes the op; the LB suppresses the rest
        if let Some((_, pending)) = shared.pending.remove(&reply.req_id) {
            shared.completed.fetch_add(1, Ordering::Relaxed);
            if reply.result == ResultCode::NotFound {
                shared.misses.fetch_add(1, Ordering::Relaxed);
            }
            if pending.recorded
                && shared.phase.load(Ordering::Acquire) == PHASE_RECORD
            {
                let nanos = pending.start.elapsed().as_nanos() as u64;
                let _ = histogram.record(nanos.min(MAX_LATENCY));
            }
        }
    }

    histogram
}
