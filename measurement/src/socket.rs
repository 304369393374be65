//! Socket construction shared by the scheduler and server workers: plain
//! `socket2` setup plus the handful of options (`SO_BINDTODEVICE`,
//! `TCP_MAXSEG`, `SO_SNDTIMEO`/`SO_RCVTIMEO`) `socket2` doesn't expose,
//! reached via raw `libc::setsockopt` the same way `forwarding::socket` and
//! `icmp-relay` do for options outside its surface.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use socket2::{Domain, Socket, Type};

/// Binds a TCP socket at `bind_addr`, optionally pinned to `device` via
/// `SO_BINDTODEVICE` and carrying `SO_SNDTIMEO`/`SO_RCVTIMEO`. Left
/// blocking and converted to a `std::net::TcpStream`/`TcpListener` by the
/// caller, matching `original_source/src/net.c`'s `tcp_cli`/`tcp_serv`
/// socket setup sequence (socket, setsockopt*, bind).
pub fn bind_tcp(
    bind_addr: SocketAddr,
    device: Option<&str>,
    snd_timeout: Option<Duration>,
    rcv_timeout: Option<Duration>,
) -> io::Result<Socket> {
    let domain = if bind_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;

    if let Some(device) = device {
        bind_to_device(&socket, device)?;
    }
    if let Some(timeout) = snd_timeout {
        socket.set_write_timeout(Some(timeout))?;
    }
    if let Some(timeout) = rcv_timeout {
        socket.set_read_timeout(Some(timeout))?;
    }
    socket.bind(&bind_addr.into())?;

    Ok(socket)
}

/// Sets `TCP_MAXSEG` on an already-created TCP socket. Per spec.md §4.5,
/// applied only to the tunneled connection's socket.
pub fn set_tcp_maxseg(socket: &Socket, mss: u32) -> io::Result<()> {
    // SAFETY: `mss` is a valid `c_int`-sized value living on the stack for
    // the duration of the call; `socket`'s fd is open and owned by us.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_MAXSEG,
            std::ptr::addr_of!(mss).cast(),
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bind_to_device(socket: &Socket, device: &str) -> io::Result<()> {
    // SAFETY: `device` is a valid byte slice; the kernel only reads
    // `device.len()` bytes from it.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            device.as_ptr().cast(),
            device.len() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

