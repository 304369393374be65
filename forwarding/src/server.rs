//! Server role (§4.4.2): tun-egress routes by inner destination port via the
//! dynamically-extended `by_sport` index; outer ingress admits unknown
//! peers up to `fd_lim`, gated by the `locked` policy.

use tracing::{error, info, warn};

use crate::engine::{self, IngressOutcome};
use crate::{inactivity_sleep, ingress_or_pending, OuterSockets, RuntimeState};

/// Runs the server forwarding loop until the shutdown flag is set or the
/// configured inactivity timeout expires (§4.4.5).
pub async fn run_server(mut state: RuntimeState, sockets: OuterSockets) {
    info!("server forwarding loop starting");
    state.barrier.wait().await;

    let shutdown = state.lifecycle.shutdown_token();
    let mut tun_buf = vec![0u8; state.config.buf_length];
    let mut v4_buf = vec![0u8; state.config.buf_length];
    let mut v6_buf = vec![0u8; state.config.buf_length];

    loop {
        tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                info!("server forwarding loop shutting down");
                return;
            }
            () = inactivity_sleep(state.config.inactivity_timeout) => {
                info!("server forwarding loop exiting after inactivity timeout");
                return;
            }
            result = state.tun.recv(&mut tun_buf) => {
                match result {
                    Ok(n) => {
                        engine::forward_egress_by_port(&state.config, &state.directory, &sockets, &tun_buf[..n])
                            .await;
                    }
                    Err(error) => {
                        error!(%error, "tun read failed, terminating server forwarding loop");
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
                            true,
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
                            true,
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
