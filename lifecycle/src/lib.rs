//! Process-wide registry of owned resources, released in LIFO order on
//! shutdown, plus the synchronization barrier that holds traffic-generating
//! tasks back until every capture sink has armed.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long the teardown path waits for a registered task to notice
/// cancellation and exit before giving up on it.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Registry {
    tasks: Vec<JoinHandle<()>>,
    fds: Vec<RawFd>,
}

/// The process-wide resource registry and shutdown flag. Cloning shares the
/// same underlying registry and token; there is exactly one real
/// `Lifecycle` per process, held by `RuntimeState`.
#[derive(Clone)]
pub struct Lifecycle {
    registry: Arc<Mutex<Registry>>,
    shutdown: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Lifecycle {
            registry: Arc::new(Mutex::new(Registry::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// The shutdown flag. The signal handler is the only writer (via
    /// [`Lifecycle::cancel`]); every forwarding loop is a reader.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sets the shutdown flag. Safe to call from a signal handler context
    /// since it only sets an atomic internally (`CancellationToken::cancel`).
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn register_task(&self, handle: JoinHandle<()>) {
        self.registry.lock().await.tasks.push(handle);
    }

    pub async fn register_fd(&self, fd: RawFd) {
        self.registry.lock().await.fds.push(fd);
    }

    /// Cancels the shutdown flag, then releases every registered resource in
    /// LIFO order: abort and join tasks first (each bounded by
    /// [`CLOSE_TIMEOUT`]), then close file descriptors.
    ///
    /// No child-process registry is realized here: nothing in this crate
    /// forks, so the source's "kill and reap children" step has no
    /// counterpart (see DESIGN.md's Open Question resolution for C7).
    pub async fn teardown(&self) {
        self.cancel();

        let mut registry = self.registry.lock().await;

        while let Some(handle) = registry.tasks.pop() {
            if handle.is_finished() {
                let _ = handle.await;
                continue;
            }

            handle.abort();
            match tokio::time::timeout(CLOSE_TIMEOUT, handle).await {
                Ok(_) => {}
                Err(_) => tracing::warn!("task did not terminate within CLOSE_TIMEOUT"),
            }
        }

        while let Some(fd) = registry.fds.pop() {
            // SAFETY: `fd` was handed to us by a registrant that owns it and
            // will not use it again after registering it here.
            let rc = unsafe { libc::close(fd) };
            if rc != 0 {
                tracing::warn!(fd, error = %std::io::Error::last_os_error(), "failed to close fd during teardown");
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// A rendezvous point so that capture sinks are armed before any
/// traffic-generating task sends its first packet. Every participant
/// (forwarding loop, scheduler, capture sinks) waits here exactly once.
pub struct Barrier {
    inner: tokio::sync::Barrier,
}

impl Barrier {
    pub fn new(participants: usize) -> Self {
        Barrier {
            inner: tokio::sync::Barrier::new(participants.max(1)),
        }
    }

    pub async fn wait(&self) {
        self.inner.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn teardown_cancels_shutdown_token() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_shutting_down());

        lifecycle.teardown().await;

        assert!(lifecycle.is_shutting_down());
    }

    #[tokio::test]
    async fn teardown_aborts_registered_tasks() {
        let lifecycle = Lifecycle::new();
        let token = lifecycle.shutdown_token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
            std::future::pending::<()>().await;
        });
        lifecycle.register_task(handle).await;

        tokio::time::timeout(Duration::from_secs(1), lifecycle.teardown())
            .await
            .expect("teardown should complete promptly after aborting the stuck task");
    }

    #[tokio::test]
    async fn barrier_releases_all_participants() {
        let barrier = Arc::new(Barrier::new(3));
        let mut handles = Vec::new();

        for _ in 0..3 {
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
            }));
        }

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("barrier should release all participants")
                .expect("task should not panic");
        }
    }
}
