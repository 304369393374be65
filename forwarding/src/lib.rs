//! The forwarding engine (C4): the select-driven loop that multiplexes a tun
//! handle and one or more outer sockets, shaped by [`packet_shaper`] and
//! fed by [`icmp_relay`] on the error-queue path. Three entry points realize
//! the three roles named in §4.4: [`run_client`], [`run_server`], and
//! [`run_peer`].

mod client;
mod engine;
mod peer;
mod server;
pub mod socket;

pub use client::run_client;
pub use peer::run_peer;
pub use server::run_server;
pub use socket::OuterSocket;

use std::sync::Arc;

use directory::Directory;
use lifecycle::{Barrier, Lifecycle};
use tun_device::Tun;
use udptun_config::Config;

/// The pair of outer sockets a role may hold for one transport endpoint —
/// v4, v6, or both, per the configured stack mode (§4.4.4).
#[derive(Default)]
pub struct OuterSockets {
    pub v4: Option<OuterSocket>,
    pub v6: Option<OuterSocket>,
}

impl OuterSockets {
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

/// Everything a role's forwarding loop needs apart from its outer sockets,
/// which differ in count and binding per role (§3's `RuntimeState`, split
/// here so the dynamic `by_sport` write — the one shared-write hotspot in
/// §5 — can be borrowed mutably without fighting the rest of the struct).
pub struct RuntimeState {
    pub config: Config,
    pub directory: Directory,
    pub tun: Arc<dyn Tun>,
    pub lifecycle: Lifecycle,
    pub barrier: Arc<Barrier>,
}

async fn inactivity_sleep(seconds: i64) {
    if seconds < 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(std::time::Duration::from_secs(seconds as u64)).await;
    }
}

async fn ingress_or_pending(
    socket: Option<&OuterSocket>,
    buf: &mut [u8],
) -> std::io::Result<socket::IngressEvent> {
    match socket {
        Some(socket) => socket.ingress(buf).await,
        None => std::future::pending().await,
    }
}
