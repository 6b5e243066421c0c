// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Multicast socket setup shared by the audio and status listeners.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Open a UDP socket joined to `group`, with address and port reuse so
/// sidecar tools can listen alongside the server.
pub fn join_multicast(group: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if group.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddr::new(
        if group.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
        },
        group.port(),
    );
    socket.bind(&bind_addr.into())?;

    match group.ip() {
        IpAddr::V4(addr) if addr.is_multicast() => {
            socket.join_multicast_v4(&addr, &Ipv4Addr::UNSPECIFIED)?;
        }
        IpAddr::V6(addr) if addr.is_multicast() => {
            socket.join_multicast_v6(&addr, 0)?;
        }
        _ => {}
    }

    UdpSocket::from_std(socket.into())
}

/// Wall clock in nanoseconds since the epoch, captured at packet
/// receipt and propagated to clients for inter-server alignment.
pub fn gps_time_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
