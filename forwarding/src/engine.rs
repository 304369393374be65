//! Shared egress/ingress mechanics used by all three forwarding roles
//! (§4.4.1-4.4.3): address-keyed and port-keyed egress dispatch, and the
//! outer-ingress step common to client, server, and peer sockets.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use directory::{Directory, PeerRecord};
use packet_shaper::{Family, Frame};
use tracing::{debug, warn};
use udptun_config::Config;

use crate::socket::{IngressEvent, OuterSocket};
use crate::OuterSockets;

/// What the caller should do after processing one ingress event.
pub(crate) enum IngressOutcome {
    Continue,
    Fatal,
}

/// Reads the family off a tun packet, dropping with a log on an
/// unrecognized version nibble (§4.4.4).
fn classify(packet: &[u8]) -> Option<Family> {
    match packet_shaper::detect_family(packet) {
        Some(family) => Some(family),
        None => {
            warn!(len = packet.len(), "dropping tun packet with unrecognized IP version nibble");
            None
        }
    }
}

/// Client/peer-client-path egress: the inner destination *address* selects
/// the peer (§4.4.1, §4.4.3).
pub(crate) async fn forward_egress_by_address(
    config: &Config,
    directory: &Directory,
    sockets: &OuterSockets,
    packet: &[u8],
) {
    let Some(family) = classify(packet) else { return };

    let record = match family {
        Family::V4 => packet_shaper::inner_dst_addr_v4(packet).and_then(|addr| directory.by_priv4.get(&addr)),
        Family::V6 => packet_shaper::inner_dst_addr_v6(packet).and_then(|addr| directory.by_priv6.get(&addr)),
    };
    let Some(record) = record else {
        debug!(?family, "egress address lookup miss, dropping");
        return;
    };

    send_to_peer(config, sockets, family, record, packet).await;
}

/// Server/peer-server-path egress: the inner destination *port* selects the
/// peer via `by_sport` (§4.4.2, §4.4.3).
pub(crate) async fn forward_egress_by_port(
    config: &Config,
    directory: &Directory,
    sockets: &OuterSockets,
    packet: &[u8],
) {
    let Some(family) = classify(packet) else { return };

    let port = match family {
        Family::V4 => packet_shaper::inner_dst_port_v4(packet),
        Family::V6 => packet_shaper::inner_dst_port_v6(packet),
    };
    let Some(port) = port else {
        debug!(?family, "egress packet too short to contain an inner port, dropping");
        return;
    };

    let Some(record) = directory.by_sport.get(port) else {
        debug!(port, "egress port lookup miss, dropping");
        return;
    };

    send_to_peer(config, sockets, family, record, packet).await;
}

/// Peer-role egress dispatch (§4.4.3): equality with `private_port` is the
/// only signal separating locally-originated inner traffic (address-routed,
/// over the client-side socket pair) from locally-answered server replies
/// (port-routed, over the server-side socket pair).
pub(crate) async fn forward_egress_peer(
    config: &Config,
    directory: &Directory,
    client_sockets: &OuterSockets,
    server_sockets: &OuterSockets,
    packet: &[u8],
) {
    let Some(family) = classify(packet) else { return };

    let port = match family {
        Family::V4 => packet_shaper::inner_dst_port_v4(packet),
        Family::V6 => packet_shaper::inner_dst_port_v6(packet),
    };
    let Some(port) = port else {
        debug!(?family, "egress packet too short to contain an inner port, dropping");
        return;
    };

    if port == config.private_port {
        forward_egress_by_address(config, directory, client_sockets, packet).await;
    } else {
        forward_egress_by_port(config, directory, server_sockets, packet).await;
    }
}

async fn send_to_peer(
    config: &Config,
    sockets: &OuterSockets,
    family: Family,
    record: &Arc<PeerRecord>,
    packet: &[u8],
) {
    let socket = match family {
        Family::V4 => sockets.v4.as_ref(),
        Family::V6 => sockets.v6.as_ref(),
    };
    let Some(socket) = socket else {
        debug!(?family, "no outer socket bound for this family, dropping");
        return;
    };

    let want_v6 = family == Family::V6;
    let Some(dst) = directory::public_socket_addr(record, config.public_port, want_v6) else {
        debug!(port = record.port, ?family, "peer has no public address for this family, dropping");
        return;
    };

    let mut frame = Frame::with_headroom(config.raw_header.len().max(packet_shaper::PPI_PREFIX.len()), packet);
    if let Err(error) = packet_shaper::shape_egress(&mut frame, config.planetlab, &config.raw_header) {
        warn!(%error, "failed to shape egress packet, dropping");
        return;
    }

    if let Err(error) = socket.send_to(frame.as_slice(), dst).await {
        warn!(%error, peer_port = record.port, "outer send failed");
    }
}

/// Processes one already-received ingress event (a datagram or a drained
/// ICMP report — see [`OuterSocket::ingress`]): shapes it and writes it to
/// tun, or synthesises and injects an ICMP packet (§4.3). When
/// `record_dynamic` is set (server and peer-server-path sockets), a
/// successful receive also extends `by_sport` per the `fd_lim`/`locked`
/// policy (§4.4.2). The wait for `event` itself happens in the caller's
/// `select!` branch, so this never blocks on the socket.
pub(crate) async fn handle_ingress_event(
    config: &Config,
    directory: &mut Directory,
    tun: &Arc<dyn tun_device::Tun>,
    socket: &OuterSocket,
    buf: &[u8],
    event: IngressEvent,
    record_dynamic: bool,
) -> IngressOutcome {
    let (len, from) = match event {
        IngressEvent::IcmpError(icmp_error) => return inject_icmp_error(config, tun, &icmp_error).await,
        IngressEvent::Packet { len, from } => (len, from),
    };

    if len <= packet_shaper::MIN_PACKET_LEN {
        debug!(len, "dropping undersized outer packet");
        return IngressOutcome::Continue;
    }

    if record_dynamic {
        record_dynamic_peer(config, directory, socket.family, from);
    }

    let mut frame = Frame::with_headroom(packet_shaper::PPI_PREFIX.len(), &buf[..len]);
    if let Err(error) =
        packet_shaper::shape_ingress(&mut frame, socket.family, socket.is_udp, config.raw_header_size, config.planetlab)
    {
        warn!(%error, "failed to shape ingress packet, dropping");
        return IngressOutcome::Continue;
    }

    match tun.send(frame.as_slice()).await {
        Ok(()) => IngressOutcome::Continue,
        Err(error) => {
            tracing::error!(%error, "tun write failed, terminating");
            IngressOutcome::Fatal
        }
    }
}

async fn inject_icmp_error(
    config: &Config,
    tun: &Arc<dyn tun_device::Tun>,
    icmp_error: &icmp_relay::IcmpError,
) -> IngressOutcome {
    let Some(offender) = icmp_error.offender_v4 else {
        debug!(family = "v6", "ICMP error for IPv6 offender; synthesis not defined, logging only");
        return IngressOutcome::Continue;
    };
    let Some(private4) = config.private_addr4 else {
        debug!("ICMP error observed but no private v4 address configured, logging only");
        return IngressOutcome::Continue;
    };

    let synthetic = icmp_relay::forge(
        offender,
        icmp_error.icmp_type,
        icmp_error.icmp_code,
        &icmp_error.offending_head,
        private4,
    );
    match tun.send(&synthetic).await {
        Ok(()) => IngressOutcome::Continue,
        Err(error) => {
            tracing::error!(%error, "tun write failed while injecting ICMP packet, terminating");
            IngressOutcome::Fatal
        }
    }
}

/// Extends `by_sport` with a peer discovered from an inbound datagram's
/// source address, subject to the `locked` policy and `fd_lim` (§4.4.2).
/// Already-known ports (static or previously admitted) are a no-op.
fn record_dynamic_peer(config: &Config, directory: &mut Directory, family: Family, from: SocketAddr) {
    let port = from.port();
    if directory.by_sport.get(port).is_some() {
        return;
    }
    if config.locked {
        debug!(port, "dynamic admission rejected: locked policy, peer not in static directory");
        return;
    }

    let record = match (family, from.ip()) {
        (Family::V4, IpAddr::V4(ip)) => Arc::new(PeerRecord {
            port,
            public4: Some(ip),
            private4: None,
            public6: None,
            private6: None,
        }),
        (Family::V6, IpAddr::V6(ip)) => Arc::new(PeerRecord {
            port,
            public4: None,
            private4: None,
            public6: Some(ip),
            private6: None,
        }),
        _ => {
            warn!(?family, "outer socket family did not match its own recv_from address, dropping admission");
            return;
        }
    };

    if !directory.by_sport.admit_dynamic(port, record) {
        debug!(port, "fd_lim exceeded, dropping new dynamic peer");
    }
}
