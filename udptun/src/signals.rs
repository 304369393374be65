//! SIGINT/SIGTERM handling (ground: teacher's `headless-client/src/signals`).

use tokio::signal::unix::{signal, Signal, SignalKind};

pub struct Terminate {
    sigint: Signal,
    sigterm: Signal,
}

impl Terminate {
    pub fn new() -> std::io::Result<Self> {
        Ok(Terminate {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Waits for SIGINT or SIGTERM.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {}
            _ = self.sigterm.recv() => {}
        }
    }
}
