//! The outer transport: a UDP or raw-IP socket, unified behind one type so
//! the engine's select loop doesn't need to branch on transport kind.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};

use packet_shaper::Family;
use tokio::io::unix::AsyncFd;

/// An outer socket: UDP or raw IP, bound to one address family. Owns its fd
/// (closed on drop) and is wrapped for `tokio` readiness.
pub struct OuterSocket {
    fd: AsyncFd<RawFd>,
    pub family: Family,
    pub is_udp: bool,
}

impl Drop for OuterSocket {
    fn drop(&mut self) {
        // SAFETY: this fd is owned exclusively by this socket.
        unsafe {
            libc::close(self.fd.as_raw_fd());
        }
    }
}

impl OuterSocket {
    pub fn bind_udp(bind_addr: SocketAddr) -> io::Result<Self> {
        let domain = if bind_addr.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        if bind_addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&bind_addr.into())?;

        let family = if bind_addr.is_ipv6() { Family::V6 } else { Family::V4 };
        Ok(OuterSocket {
            fd: AsyncFd::new(socket.into_raw_fd())?,
            family,
            is_udp: true,
        })
    }

    /// Opens a raw-IP socket carrying `protocol_num`, bound to `bind_addr`.
    /// For IPv4, `IP_HDRINCL` is set so the caller supplies the outer IP
    /// header on send, matching `original_source/src/sock.c`'s raw-socket
    /// setup; IPv6 raw sockets have no standardized header-include option
    /// and are left to the kernel's defaults.
    pub fn bind_raw(bind_addr: IpAddr, protocol_num: u8) -> io::Result<Self> {
        let (domain, family) = if bind_addr.is_ipv6() {
            (socket2::Domain::IPV6, Family::V6)
        } else {
            (socket2::Domain::IPV4, Family::V4)
        };
        let socket = socket2::Socket::new(
            domain,
            socket2::Type::RAW,
            Some(socket2::Protocol::from(i32::from(protocol_num))),
        )?;
        socket.set_nonblocking(true)?;
        if family == Family::V4 {
            socket.set_header_included_v4(true)?;
        }
        socket.bind(&SocketAddr::new(bind_addr, 0).into())?;

        Ok(OuterSocket {
            fd: AsyncFd::new(socket.into_raw_fd())?,
            family,
            is_udp: false,
        })
    }

    pub fn enable_recverr(&self) -> io::Result<()> {
        icmp_relay::enable_recverr(self.fd.as_raw_fd(), self.family == Family::V6)
    }

    pub fn drain_error_queue(&self) -> io::Result<Option<icmp_relay::IcmpError>> {
        icmp_relay::drain_error_queue(self.fd.as_raw_fd())
    }

    /// Receives one datagram. Returns the source address (port meaningful
    /// only for UDP transports; raw sockets report port 0, matching
    /// `original_source`'s own `sockaddr_in`-based extraction regardless of
    /// transport — see DESIGN.md).
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| recvfrom(*inner.get_ref(), buf, self.family));
            match result {
                Ok(inner) => return inner,
                Err(_would_block) => continue,
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: `storage`/`len` describe a buffer sized for any sockaddr.
        let rc = unsafe {
            libc::getsockname(
                self.fd.as_raw_fd(),
                std::ptr::addr_of_mut!(storage).cast(),
                std::ptr::addr_of_mut!(len),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sockaddr_storage_to_socket_addr(&storage, self.family))
    }

    pub async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| sendto(*inner.get_ref(), buf, dst));
            match result {
                Ok(inner) => return inner,
                Err(_would_block) => continue,
            }
        }
    }

    /// One ingress step: a plain receive, or — when the kernel reports a
    /// pending asynchronous error instead of handing back data — the drained
    /// ICMP report (§4.3). `IP_RECVERR`/`IPV6_RECVERR` make the ordinary
    /// receive itself fail first; the error queue is only consulted once
    /// that happens, matching the socket's actual notification order.
    pub async fn ingress(&self, buf: &mut [u8]) -> io::Result<IngressEvent> {
        match self.recv_from(buf).await {
            Ok((len, from)) => Ok(IngressEvent::Packet { len, from }),
            Err(error) => match self.drain_error_queue() {
                Ok(Some(icmp_error)) => Ok(IngressEvent::IcmpError(icmp_error)),
                Ok(None) => Err(error),
                Err(drain_error) => Err(drain_error),
            },
        }
    }
}

/// The outcome of one [`OuterSocket::ingress`] step.
pub enum IngressEvent {
    Packet { len: usize, from: SocketAddr },
    IcmpError(icmp_relay::IcmpError),
}

fn recvfrom(fd: RawFd, buf: &mut [u8], family: Family) -> io::Result<(usize, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    // SAFETY: `storage`/`len` describe a buffer sized for any sockaddr the
    // kernel may write, and `buf` is valid for `buf.len()` bytes.
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            std::ptr::addr_of_mut!(storage).cast(),
            std::ptr::addr_of_mut!(len),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = sockaddr_storage_to_socket_addr(&storage, family);
    Ok((n as usize, addr))
}

fn sendto(fd: RawFd, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
    let sockaddr = socket2::SockAddr::from(dst);

    // SAFETY: `sockaddr` is a valid sockaddr of the length it reports, and
    // `buf` is valid for `buf.len()` bytes.
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr().cast(),
            buf.len(),
            0,
            sockaddr.as_ptr(),
            sockaddr.len(),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn sockaddr_storage_to_socket_addr(storage: &libc::sockaddr_storage, family: Family) -> SocketAddr {
    match family {
        Family::V4 => {
            // SAFETY: the kernel filled `storage` for an AF_INET-family
            // socket, so reading it as `sockaddr_in` is valid.
            let sin: libc::sockaddr_in = unsafe { std::ptr::read(std::ptr::addr_of!(*storage).cast()) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port))
        }
        Family::V6 => {
            // SAFETY: as above, for an AF_INET6-family socket.
            let sin6: libc::sockaddr_in6 = unsafe { std::ptr::read(std::ptr::addr_of!(*storage).cast()) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_sockets_round_trip_a_datagram_over_loopback() {
        let a = OuterSocket::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = OuterSocket::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();

        let b_addr = b.local_addr().unwrap();
        a.send_to(b"hello outer", b_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], b"hello outer");
        assert_eq!(from.ip(), std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn ingress_reports_a_plain_packet_event() {
        let a = OuterSocket::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = OuterSocket::bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();

        a.send_to(b"datagram", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0u8; 64];
        match b.ingress(&mut buf).await.unwrap() {
            IngressEvent::Packet { len, .. } => assert_eq!(&buf[..len], b"datagram"),
            IngressEvent::IcmpError(_) => panic!("expected a plain packet event"),
        }
    }
}
