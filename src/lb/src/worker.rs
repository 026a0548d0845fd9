// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Data-path worker: one reuseport ingress socket, one poll, each packet
//! parsed, routed, rewritten, and emitted on the thread that received it.

use crate::process::Pipeline;

use common::signal::Signal;
use config::WorkerConfig;
use crossbeam_channel::Receiver;
use net::{bind_udp, Events, Interest, Poll, Token, UdpSocket, Waker};

use std::io::{ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(usize::MAX);

const RX_BUFFER_SIZE: usize = 64 * 1024;

pub(crate) struct Worker {
    nevent: usize,
    pipeline: Arc<Pipeline>,
    poll: Poll,
    signal_rx: Receiver<Signal>,
    socket: UdpSocket,
    timeout: Duration,
    #[allow(dead_code)]
    waker: Arc<Waker>,
}

pub(crate) struct WorkerBuilder {
    nevent: usize,
    pipeline: Arc<Pipeline>,
    poll: Poll,
    socket: UdpSocket,
    timeout: Duration,
    waker: Arc<Waker>,
}

impl WorkerBuilder {
    pub fn new<T: WorkerConfig>(
        config: &T,
        addr: SocketAddr,
        pipeline: Arc<Pipeline>,
    ) -> Result<Self> {
        let config = config.worker();

        let poll = Poll::new()?;
        let mut socket = bind_udp(addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());

        Ok(Self {
            nevent: config.nevent(),
            pipeline,
            poll,
            socket,
            timeout: Duration::from_millis(config.timeout() as u64),
            waker,
        })
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn build(self, signal_rx: Receiver<Signal>) -> Worker {
        Worker {
            nevent: self.nevent,
            pipeline: self.pipeline,
            poll: self.poll,
            signal_rx,
            socket: self.socket,
            timeout: self.timeout,
            waker: self.waker,
        }
    }
}

impl Worker {
    fn drain(&mut self, buf: &mut [u8], out: &mut Vec<(SocketAddr, Vec<u8>)>) {
        loop {
            match self.socket.recv_from(buf) {
                Ok((len, src)) => {
                    self.pipeline.process(&mut buf[..len], src, out);
                    for (dst, frame) in out.drain(..) {
                        if let Err(e) = self.socket.send_to(&frame, dst) {
                            if e.kind() != ErrorKind::WouldBlock {
                                debug!("send to {} failed: {}", dst, e);
                            }
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("recv error: {}", e);
                    break;
                }
            }
        }
    }

    pub fn run(&mut self) {
        let mut events = Events::with_capacity(self.nevent);
        let mut buf = vec![0u8; RX_BUFFER_SIZE];
        let mut out = Vec::new();

        loop {
            if self.poll.poll(&mut events, Some(self.timeout)).is_err() {
                error!("Error polling");
            }

            for event in events.iter() {
                match event.token() {
                    SOCKET_TOKEN => {
                        self.drain(&mut buf, &mut out);
                    }
                    WAKER_TOKEN => {
                        while let Ok(signal) = self.signal_rx.try_recv() {
                            match signal {
                                Signal::Shutdown => {
                                    return;
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}
