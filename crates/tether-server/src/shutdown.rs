//! Gateway shutdown signal.
//!
//! One [`CancellationToken`] fans out to the HTTP listener, every device
//! socket task (which closes with 1001 `GOING_AWAY`) and every SSE stream.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Drain deadline used when the caller passes none.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owner of the process-wide shutdown token.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// A coordinator that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Child token for a task that must stop on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Fire the signal. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether the signal has fired. New device upgrades are refused once it has.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire the signal and wait up to `timeout` for `handles` to drain.
    ///
    /// Returns `false` when the deadline passed with tasks still running.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> bool {
        let deadline = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(tasks = handles.len(), deadline_ms = deadline.as_millis(), "draining gateway");

        let drained = tokio::time::timeout(deadline, futures::future::join_all(handles))
            .await
            .is_ok();
        if !drained {
            warn!(deadline_ms = deadline.as_millis(), "drain deadline passed with tasks still running");
        }
        drained
    }
}
