// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Datagram socket plumbing for the Pegasus roles. Re-exports the mio
//! types the event loops are written against and provides reuseport UDP
//! binding so multiple workers can share one ingress address.

pub use mio::event::Event;
pub use mio::net::UdpSocket;
pub use mio::{Events, Interest, Poll, Token, Waker};

use socket2::{Domain, Protocol, Socket, Type};

use std::io::Result;
use std::net::SocketAddr;

/// Bind a non-blocking UDP socket with `SO_REUSEPORT` set, so every worker
/// thread can bind the same ingress address and the kernel spreads
/// datagrams across them.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuseport_allows_two_binds() {
        let a = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = a.local_addr().unwrap();
        // second bind of the same address must succeed with reuseport
        let b = bind_udp(addr);
        assert!(b.is_ok());
    }
}
