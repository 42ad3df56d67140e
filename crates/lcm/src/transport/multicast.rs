// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast socket setup.
//!
//! Receivers bind the group port with address (and on unix, port) reuse so
//! several processes on one host can share a group. Senders use a separate
//! ephemeral socket carrying the TTL and loopback settings.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// Socket for publishing to `group`.
///
/// Multicast loopback is enabled so subscribers in this process and on
/// this host see local traffic.
pub fn open_send_socket(ttl: u32) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_multicast_loop_v4(true)?;
    if ttl == 0 {
        tracing::info!("[UDPM] multicast TTL is 0, packets will not leave localhost");
    }
    Ok(socket.into())
}

/// Socket joined to `group`, bound to its port on all interfaces.
pub fn open_recv_socket(
    group: SocketAddrV4,
    recv_buf_size: Option<usize>,
    read_timeout: Duration,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    set_reuseport(&socket)?;

    if let Some(requested) = recv_buf_size {
        socket.set_recv_buffer_size(requested)?;
        let granted = socket.recv_buffer_size()?;
        if granted < requested {
            tracing::warn!(
                "[UDPM] receive buffer is {} bytes, {} requested; raise net.core.rmem_max",
                granted,
                requested
            );
        }
    }

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, group.port()));
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    tracing::debug!("[UDPM] joined {} bound to {}", group, bind_addr);

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket)
}

/// Set SO_REUSEPORT so several processes can bind the group port.
#[cfg(unix)]
fn set_reuseport(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with valid fd, standard socket option, and correctly sized optval pointer
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
