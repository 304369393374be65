//! Fullmesh peer role (§4.4.3): binds a client-side socket pair (port) and
//! a server-side socket pair (public_port) and runs one forwarding loop
//! over both. Tun egress dispatch is the crucial bit: inner destination
//! port equal to `private_port` means locally-originated traffic, routed
//! by address over the client-side sockets; anything else is a
//! locally-answered server reply, routed by port over the server-side
//! sockets (§4.4.3's "only way to tell them apart without a second tun").
//!
//! The embedded scheduler and server threads the role description mentions
//! are spawned by the binary alongside this loop, not inside it — C4 only
//! ever owns the forwarding loop itself.

use tracing::{error, info, warn};

use crate::engine::{self, IngressOutcome};
use crate::{inactivity_sleep, ingress_or_pending, OuterSockets, RuntimeState};

/// Runs the peer forwarding loop until the shutdown flag is set or the
/// configured inactivity timeout expires (§4.4.5). Unlike the client role,
/// a peer's loop terminating on inactivity timeout is the only shutdown
/// signal its scheduler relies on (§4.5: "a peer scheduler does not [invoke
/// the shutdown hook]; the forwarding loop terminates instead").
pub async fn run_peer(mut state: RuntimeState, client_sockets: OuterSockets, server_sockets: OuterSockets) {
    info!("peer forwarding loop starting");
    state.barrier.wait().await;

    let shutdown = state.lifecycle.shutdown_token();
    let mut tun_buf = vec![0u8; state.config.buf_length];
    let mut client_v4_buf = vec![0u8; state.config.buf_length];
    let mut client_v6_buf = vec![0u8; state.config.buf_length];
    let mut server_v4_buf = vec![0u8; state.config.buf_length];
    let mut server_v6_buf = vec![0u8; state.config.buf_length];

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                info!("peer forwarding loop shutting down");
                return;
            }
            () = inactivity_sleep(state.config.inactivity_timeout) => {
                info!("peer forwarding loop exiting after inactivity timeout");
                return;
            }
            result = state.tun.recv(&mut tun_buf) => {
                match result {
                    Ok(n) => {
                        engine::forward_egress_peer(
                            &state.config,
                            &state.directory,
                            &client_sockets,
                            &server_sockets,
                            &tun_buf[..n],
                        )
                        .await;
                    }
                    Err(error) => {
                        error!(%error, "tun read failed, terminating peer forwarding loop");
                        return;
                    }
                }
            }
            result = ingress_or_pending(client_sockets.v4.as_ref(), &mut client_v4_buf) => {
                match result {
                    Ok(event) => {
                        let outcome = engine::handle_ingress_event(
                            &state.config,
                            &mut state.directory,
                            &state.tun,
                            client_sockets.v4.as_ref().expect("branch only polled when Some"),
                            &client_v4_buf,
                            event,
                            false,
                        )
                        .await;
                        if matches!(outcome, IngressOutcome::Fatal) {
                            return;
                        }
                    }
                    Err(error) => warn!(%error, "client-side v4 outer socket error"),
                }
            }
            result = ingress_or_pending(client_sockets.v6.as_ref(), &mut client_v6_buf) => {
                match result {
                    Ok(event) => {
                        let outcome = engine::handle_ingress_event(
                            &state.config,
                            &mut state.directory,
                            &state.tun,
                            client_sockets.v6.as_ref().expect("branch only polled when Some"),
                            &client_v6_buf,
                            event,
                            false,
                        )
                        .await;
                        if matches!(outcome, IngressOutcome::Fatal) {
                            return;
                        }
                    }
                    Err(error) => warn!(%error, "client-side v6 outer socket error"),
                }
            }
            result = ingress_or_pending(server_sockets.v4.as_ref(), &mut server_v4_buf) => {
                match result {
                    Ok(event) => {
                        let outcome = engine::handle_ingress_event(
                            &state.config,
                            &mut state.directory,
                            &state.tun,
                            server_sockets.v4.as_ref().expect("branch only polled when Some"),
                            &server_v4_buf,
                            event,
                            true,
                        )
                        .await;
                        if matches!(outcome, IngressOutcome::Fatal) {
                            return;
                        }
                    }
                    Err(error) => warn!(%error, "server-side v4 outer socket error"),
                }
            }
            result = ingress_or_pending(server_sockets.v6.as_ref(), &mut server_v6_buf) => {
                match result {
                    Ok(event) => {
                        let outcome = engine::handle_ingress_event(
                            &state.config,
                            &mut state.directory,
                            &state.tun,
                            server_sockets.v6.as_ref().expect("branch only polled when Some"),
                            &server_v6_buf,
                            event,
                            true,
                        )
                        .await;
                        if matches!(outcome, IngressOutcome::Fatal) {
                            return;
                        }
                    }
                    Err(error) => warn!(%error, "server-side v6 outer socket error"),
                }
            }
        }
    }
}
