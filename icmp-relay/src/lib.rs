//! The ICMP side-channel: draining the kernel's per-socket error queue and
//! synthesising a minimal ICMP packet to inject into the inner tun so that
//! the tunneled TCP sees path errors end-to-end.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;

/// An asynchronous error observed on an outer socket's error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpError {
    pub origin_is_icmp6: bool,
    pub icmp_type: u8,
    pub icmp_code: u8,
    /// The offending datagram's source address, when the origin was ICMPv4.
    /// `None` for ICMPv6 origins (see DESIGN.md's Open Question resolution:
    /// v6 offenders are logged only, never forged).
    pub offender_v4: Option<Ipv4Addr>,
    /// The first bytes of the datagram the error refers to, as delivered
    /// alongside the control message by `recvmsg(MSG_ERRQUEUE)` itself —
    /// this is the same data `forge` echoes back per RFC 792.
    pub offending_head: [u8; 8],
}

/// Enables kernel error-queue reporting (`IP_RECVERR`/`IPV6_RECVERR`) on an
/// already-bound outer socket.
pub fn enable_recverr(fd: RawFd, is_v6: bool) -> std::io::Result<()> {
    let one: libc::c_int = 1;
    let (level, name) = if is_v6 {
        (libc::IPPROTO_IPV6, libc::IPV6_RECVERR)
    } else {
        (libc::IPPROTO_IP, libc::IP_RECVERR)
    };

    // SAFETY: `fd` is a valid, open socket owned by the caller for the
    // duration of this call; `one` outlives the call as a local.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of_val(&one) as libc::socklen_t,
        )
    };

    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Drains one control message from the socket's error queue via
/// `recvmsg(MSG_ERRQUEUE)`, returning the parsed [`IcmpError`] if the
/// reported origin was an ICMP message (v4 or v6). Returns `Ok(None)` when
/// there is nothing pending or the origin wasn't ICMP.
pub fn drain_error_queue(fd: RawFd) -> std::io::Result<Option<IcmpError>> {
    let mut cmsg_buf = [0u8; 256];
    let mut data_buf = [0u8; 8];
    let mut iov = libc::iovec {
        iov_base: data_buf.as_mut_ptr().cast(),
        iov_len: data_buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: `msg` is a well-formed msghdr pointing at buffers that
    // outlive this call.
    let rc = unsafe { libc::recvmsg(fd, std::ptr::addr_of_mut!(msg), libc::MSG_ERRQUEUE) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    // SAFETY: `msg` was just populated by `recvmsg` above.
    let mut cmsg_ptr = unsafe { libc::CMSG_FIRSTHDR(std::ptr::addr_of!(msg)) };
    while !cmsg_ptr.is_null() {
        // SAFETY: `cmsg_ptr` was returned non-null by CMSG_FIRSTHDR/NXTHDR
        // and points into `cmsg_buf`, which is still alive.
        let cmsg = unsafe { &*cmsg_ptr };

        let is_v4_err = cmsg.cmsg_level == libc::IPPROTO_IP && cmsg.cmsg_type == libc::IP_RECVERR;
        let is_v6_err =
            cmsg.cmsg_level == libc::IPPROTO_IPV6 && cmsg.cmsg_type == libc::IPV6_RECVERR;

        if is_v4_err || is_v6_err {
            // SAFETY: the kernel sizes this control message to contain at
            // least a `sock_extended_err` per IP_RECVERR/IPV6_RECVERR.
            let ee_ptr = unsafe { libc::CMSG_DATA(cmsg_ptr) } as *const libc::sock_extended_err;
            let ee = unsafe { std::ptr::read_unaligned(ee_ptr) };

            let is_icmp = ee.ee_origin == libc::SO_EE_ORIGIN_ICMP as u8
                || ee.ee_origin == libc::SO_EE_ORIGIN_ICMP6 as u8;
            if !is_icmp {
                // SAFETY: `cmsg_ptr` and `msg` remain valid for the lifetime
                // of this loop.
                cmsg_ptr = unsafe { libc::CMSG_NXTHDR(std::ptr::addr_of!(msg), cmsg_ptr) };
                continue;
            }

            let offender_v4 = if is_v4_err {
                // SAFETY: for IP_RECVERR, a `sockaddr_in` describing the
                // offender follows the `sock_extended_err` in the same
                // control message.
                let sa_ptr = unsafe { (ee_ptr.add(1)) as *const libc::sockaddr_in };
                let sa = unsafe { std::ptr::read_unaligned(sa_ptr) };
                Some(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)))
            } else {
                None
            };

            return Ok(Some(IcmpError {
                origin_is_icmp6: is_v6_err,
                icmp_type: ee.ee_type,
                icmp_code: ee.ee_code,
                offender_v4,
                offending_head: data_buf,
            }));
        }

        // SAFETY: `cmsg_ptr` and `msg` remain valid for the lifetime of
        // this loop.
        cmsg_ptr = unsafe { libc::CMSG_NXTHDR(std::ptr::addr_of!(msg), cmsg_ptr) };
    }

    Ok(None)
}

/// Synthesises a minimal IPv4 + ICMP packet reporting `icmp_type`/
/// `icmp_code` as having originated from `offender`, addressed to
/// `target_private` so the tun's owning stack attributes the error to the
/// right inner flow. `offending_head` is the first 8 bytes of the datagram
/// the error refers to, echoed back per RFC 792.
///
/// Pure: no socket dependency, so it is testable without a kernel error
/// queue (see DESIGN NOTES).
pub fn forge(
    offender: Ipv4Addr,
    icmp_type: u8,
    icmp_code: u8,
    offending_head: &[u8; 8],
    target_private: Ipv4Addr,
) -> [u8; 36] {
    let mut icmp = [0u8; 16];
    icmp[0] = icmp_type;
    icmp[1] = icmp_code;
    // icmp[2..4] checksum, filled below.
    // icmp[4..8] unused, left zero.
    icmp[8..16].copy_from_slice(offending_head);
    let icmp_checksum = calcsum(&icmp);
    icmp[2..4].copy_from_slice(&icmp_checksum.to_be_bytes());

    let mut ip = [0u8; 20];
    ip[0] = 0x45; // version 4, IHL 5
    ip[1] = 0; // DSCP/ECN
    let total_len: u16 = (ip.len() + icmp.len()) as u16;
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    ip[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags + fragment offset
    ip[8] = 255; // ttl
    ip[9] = 1; // protocol: ICMP
    // ip[10..12] checksum, filled below.
    ip[12..16].copy_from_slice(&offender.octets());
    ip[16..20].copy_from_slice(&target_private.octets());
    let ip_checksum = calcsum(&ip);
    ip[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    let mut packet = [0u8; 36];
    packet[..20].copy_from_slice(&ip);
    packet[20..].copy_from_slice(&icmp);
    packet
}

/// The 16-bit one's-complement checksum used by both the IPv4 and ICMP
/// headers: sum all 16-bit words (the field itself treated as zero), fold
/// carries, complement.
fn calcsum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = *chunks.remainder() {
        sum += u32::from(last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forge_produces_valid_ip_and_icmp_checksums() {
        let offender: Ipv4Addr = "203.0.113.7".parse().unwrap();
        let target: Ipv4Addr = "10.0.0.2".parse().unwrap();
        let offending_head = [0x45, 0x00, 0x00, 0x28, 0x00, 0x00, 0x40, 0x00];

        let packet = forge(offender, 3, 3, &offending_head, target);

        assert_eq!(packet[0], 0x45);
        assert_eq!(packet[9], 1, "protocol field must be ICMP");
        assert_eq!(&packet[12..16], &offender.octets());
        assert_eq!(&packet[16..20], &target.octets());
        assert_eq!(calcsum(&packet[..20]), 0, "IP header checksum must verify");
        assert_eq!(calcsum(&packet[20..]), 0, "ICMP checksum must verify");
        assert_eq!(packet[20], 3, "icmp type preserved");
        assert_eq!(packet[21], 3, "icmp code preserved");
        assert_eq!(&packet[28..36], &offending_head);
    }

    #[test]
    fn calcsum_of_known_header_matches_expectation() {
        // A textbook example: header with checksum field zeroed sums to a
        // value whose one's complement, written back in, makes the whole
        // buffer sum to 0xFFFF's complement (i.e. checksum verifies as 0).
        let mut header = [
            0x45, 0x00, 0x00, 0x3c, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xac, 0x10,
            0x0a, 0x63, 0xac, 0x10, 0x0a, 0x0c,
        ];
        let checksum = calcsum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());

        assert_eq!(calcsum(&header), 0);
    }

    #[test]
    fn odd_length_buffer_pads_last_byte_as_high_order() {
        let even = calcsum(&[0x00, 0x01]);
        let odd = calcsum(&[0x00, 0x01, 0x00]);

        assert_eq!(even, odd);
    }
}
