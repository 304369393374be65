//! Stateless header shaping applied immediately before an outer-socket send
//! and immediately after an outer-socket receive: the PPI tun prefix and the
//! configurable "raw header" prefix.

use bytes::BytesMut;

/// Link-type tag some tun drivers require ahead of every frame.
pub const PPI_PREFIX: [u8; 4] = [0x00, 0x00, 0x08, 0x00];

/// Size of the outer IP header a raw-IP receiver sees prepended by the
/// kernel, per address family.
pub const OUTER_HEADER_V4: usize = 20;
pub const OUTER_HEADER_V6: usize = 40;

/// Below this many bytes an inner packet is dropped rather than forwarded
/// (too small to be a valid IPv4 header).
pub const MIN_PACKET_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// Reads the IP version nibble from the first byte of an inner packet.
/// `0x4_` dispatches to v4, `0x6_` to v6; anything else has no defined
/// family and the caller should drop-with-log.
pub fn detect_family(packet: &[u8]) -> Option<Family> {
    match packet.first()?.wrapping_shr(4) {
        4 => Some(Family::V4),
        6 => Some(Family::V6),
        _ => None,
    }
}

pub fn inner_dst_addr_v4(packet: &[u8]) -> Option<std::net::Ipv4Addr> {
    let bytes: [u8; 4] = packet.get(16..20)?.try_into().ok()?;
    Some(std::net::Ipv4Addr::from(bytes))
}

pub fn inner_dst_addr_v6(packet: &[u8]) -> Option<std::net::Ipv6Addr> {
    let bytes: [u8; 16] = packet.get(24..40)?.try_into().ok()?;
    Some(std::net::Ipv6Addr::from(bytes))
}

pub fn inner_dst_port_v4(packet: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = packet.get(22..24)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

pub fn inner_dst_port_v6(packet: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = packet.get(42..44)?.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ShapeError {
    #[error("not enough reserved headroom to prepend {requested} bytes (have {available})")]
    InsufficientHeadroom { requested: usize, available: usize },
    #[error("cannot strip {requested} bytes, only {available} remain")]
    Underflow { requested: usize, available: usize },
}

/// A packet buffer backed by a single allocation with slack reserved ahead
/// of the payload, so prepend/strip is a pointer shift rather than a copy.
pub struct Frame {
    buf: BytesMut,
    head: usize,
    tail: usize,
}

impl Frame {
    /// Builds a frame from a payload, reserving `headroom` bytes ahead of
    /// it for subsequent prepends.
    pub fn with_headroom(headroom: usize, payload: &[u8]) -> Self {
        let mut buf = BytesMut::zeroed(headroom + payload.len());
        buf[headroom..].copy_from_slice(payload);
        Frame {
            buf,
            head: headroom,
            tail: headroom + payload.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn prepend(&mut self, header: &[u8]) -> Result<(), ShapeError> {
        if header.len() > self.head {
            return Err(ShapeError::InsufficientHeadroom {
                requested: header.len(),
                available: self.head,
            });
        }
        self.head -= header.len();
        self.buf[self.head..self.head + header.len()].copy_from_slice(header);
        Ok(())
    }

    pub fn strip(&mut self, n: usize) -> Result<(), ShapeError> {
        let available = self.tail - self.head;
        if n > available {
            return Err(ShapeError::Underflow {
                requested: n,
                available,
            });
        }
        self.head += n;
        Ok(())
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf[self.head..self.tail].to_vec()
    }
}

/// Applied on the tun-egress path (tun → outer): strip the PPI prefix (if
/// `planetlab`), then prepend the configured raw header.
pub fn shape_egress(frame: &mut Frame, planetlab: bool, raw_header: &[u8]) -> Result<(), ShapeError> {
    if planetlab {
        frame.strip(PPI_PREFIX.len())?;
    }
    if !raw_header.is_empty() {
        frame.prepend(raw_header)?;
    }
    Ok(())
}

/// Applied on the outer-ingress path (outer → tun): strip `raw_header_size`
/// bytes, plus the outer IP header size when the outer transport is raw IP
/// (not UDP, which the kernel has already stripped for us), then prepend
/// the PPI prefix (if `planetlab`).
pub fn shape_ingress(
    frame: &mut Frame,
    family: Family,
    udp: bool,
    raw_header_size: usize,
    planetlab: bool,
) -> Result<(), ShapeError> {
    let mut strip_len = raw_header_size;
    if !udp {
        strip_len += match family {
            Family::V4 => OUTER_HEADER_V4,
            Family::V6 => OUTER_HEADER_V6,
        };
    }
    if strip_len > 0 {
        frame.strip(strip_len)?;
    }
    if planetlab {
        frame.prepend(&PPI_PREFIX)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ppi_prepend_then_strip_is_identity() {
        let payload = b"hello inner packet";
        let mut frame = Frame::with_headroom(64, payload);

        frame.prepend(&PPI_PREFIX).unwrap();
        frame.strip(PPI_PREFIX.len()).unwrap();

        assert_eq!(frame.as_slice(), payload);
    }

    #[test]
    fn raw_header_prepend_then_strip_is_identity() {
        let payload = b"\x45\x00\x00\x1capayload";
        let raw_header = b"layer4.5";
        let mut frame = Frame::with_headroom(64, payload);

        frame.prepend(raw_header).unwrap();
        frame.strip(raw_header.len()).unwrap();

        assert_eq!(frame.as_slice(), payload);
    }

    #[test]
    fn shape_egress_then_reverse_shape_ingress_round_trips() {
        let payload = b"\x45\x00\x00\x1cinner-ip-packet-bytes";
        let raw_header = b"shim";
        let mut frame = Frame::with_headroom(64, payload);

        frame.prepend(&PPI_PREFIX).unwrap(); // simulate an ingress-shaped frame already on tun
        shape_egress(&mut frame, true, raw_header).unwrap();

        assert_eq!(&frame.as_slice()[..raw_header.len()], raw_header);

        // Reverse it as if the far side received this on the wire.
        frame.strip(raw_header.len()).unwrap();
        frame.prepend(&PPI_PREFIX).unwrap();

        assert_eq!(&frame.as_slice()[..PPI_PREFIX.len()], &PPI_PREFIX);
        assert_eq!(&frame.as_slice()[PPI_PREFIX.len()..], payload);
    }

    #[test]
    fn insufficient_headroom_is_an_error_not_a_panic() {
        let mut frame = Frame::with_headroom(2, b"x");

        let err = frame.prepend(&PPI_PREFIX).unwrap_err();

        assert_eq!(
            err,
            ShapeError::InsufficientHeadroom {
                requested: 4,
                available: 2
            }
        );
    }

    #[test]
    fn strip_underflow_is_an_error_not_a_panic() {
        let mut frame = Frame::with_headroom(4, b"ab");

        let err = frame.strip(8).unwrap_err();

        assert_eq!(
            err,
            ShapeError::Underflow {
                requested: 8,
                available: 2
            }
        );
    }

    #[test]
    fn detects_version_nibble() {
        assert_eq!(detect_family(&[0x45, 0, 0, 0]), Some(Family::V4));
        assert_eq!(detect_family(&[0x60, 0, 0, 0]), Some(Family::V6));
        assert_eq!(detect_family(&[0x00]), None);
    }

    #[test]
    fn shape_ingress_strips_outer_header_only_for_raw_transport() {
        let mut raw_buf = vec![0u8; OUTER_HEADER_V4 + 10];
        raw_buf[OUTER_HEADER_V4..].fill(0xAB);
        let mut frame = Frame::with_headroom(64, &raw_buf);

        shape_ingress(&mut frame, Family::V4, false, 0, false).unwrap();

        assert_eq!(frame.len(), 10);
        assert!(frame.as_slice().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn shape_ingress_does_not_strip_outer_header_for_udp_transport() {
        let payload = vec![0xCDu8; 10];
        let mut frame = Frame::with_headroom(64, &payload);

        shape_ingress(&mut frame, Family::V4, true, 0, false).unwrap();

        assert_eq!(frame.as_slice(), payload.as_slice());
    }
}
