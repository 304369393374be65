//! Client role (§4.4.1): tun-egress routes by inner destination address;
//! outer ingress never records dynamic peers — the client only ever talks
//! to the statically-known peers in its directory.

use tracing::{error, info, warn};

use crate::engine::{self, IngressOutcome};
use crate::{inactivity_sleep, ingress_or_pending, OuterSockets, RuntimeState};

/// Runs the client forwarding loop until the shutdown flag is set or the
/// configured inactivity timeout expires. Returns in both cases (§4.4.5);
/// a tun read/write failure is fatal and also returns, after logging.
pub async fn run_client(mut state: RuntimeState, sockets: OuterSockets) {
    info!("client forwarding loop starting");
    state.barrier.wait().await;

    let shutdown = state.lifecycle.shutdown_token();
    let mut tun_buf = vec![0u8; state.config.buf_length];
    let mut v4_buf = vec![0u8; state.config.buf_length];
    let mut v6_buf = vec![0u8; state.config.buf_length];

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                info!("client forwarding loop shutting down");
                return;
            }
            () = inactivity_sleep(state.config.inactivity_timeout) => {
                info!("client forwarding loop exiting after inactivity timeout");
                return;
            }
            result = state.tun.recv(&mut tun_buf) => {
                match result {
                    Ok(n) => {
                        engine::forward_egress_by_address(&state.config, &state.directory, &sockets, &tun_buf[..n])
                            .await;
                    }
                    Err(error) => {
                        error!(%error, "tun read failed, terminating client forwarding loop");
                        return;
                    }
                }
            }
            result = ingress_or_pending(sockets.v4.as_ref(), &mut v4_buf) => {
                match result {
                    Ok(event) => {
                        let outcome = engine::handle_ingress_event(
                            &state.config,
                            &mut state.directory,
                            &state.tun,
                            sockets.v4.as_ref().expect("branch only polled when Some"),
                            &v4_buf,
                            event,
                            false,
                        )
                        .await;
                        if matches!(outcome, IngressOutcome::Fatal) {
                            return;
                        }
                    }
                    Err(error) => warn!(%error, "outer v4 socket error"),
                }
            }
            result = ingress_or_pending(sockets.v6.as_ref(), &mut v6_buf) => {
                match result {
                    Ok(event) => {
                        let outcome = engine::handle_ingress_event(
                            &state.config,
                            &mut state.directory,
                            &state.tun,
                            sockets.v6.as_ref().expect("branch only polled when Some"),
                            &v6_buf,
                            event,
                            false,
                        )
                        .await;
                        if matches!(outcome, IngressOutcome::Fatal) {
                            return;
                        }
                    }
                    Err(error) => warn!(%error, "outer v6 socket error"),
                }
            }
        }
    }
}
