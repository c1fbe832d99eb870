// Package shutdown coordinates process exit: wait for a stop trigger,
// then retire the running configuration within a bounded window.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::signal;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
#[error("config retirement exceeded the shutdown deadline")]
pub struct TimeoutError;

/// Coordinates the end of the process. Blocks until an OS signal or a
/// programmatic cancel, then drives the teardown (unloading the current
/// config generation, which drains its servers) up to a deadline; a
/// generation that cannot drain in time is abandoned and the process
/// exits with the quit-failure code.
pub struct GracefulShutdown {
    token: CancellationToken,
    deadline: Duration,
}

impl GracefulShutdown {
    pub fn new(token: CancellationToken, deadline: Duration) -> Self {
        Self { token, deadline }
    }

    /// Waits for a stop trigger, then runs `teardown` to completion or
    /// to the deadline, whichever comes first.
    pub async fn run<F>(self, teardown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!(
                    component = "shutdown",
                    event = "signal_received",
                    signal = "SIGINT",
                    "stopping on operator signal"
                );
            }
            _ = self.token.cancelled() => {
                info!(
                    component = "shutdown",
                    event = "stop_requested",
                    "stopping on programmatic cancel"
                );
            }
        }

        self.token.cancel();

        match timeout(self.deadline, teardown).await {
            Ok(()) => {
                info!(
                    component = "shutdown",
                    event = "config_retired",
                    "running config retired; exiting"
                );
                Ok(())
            }
            Err(_) => {
                warn!(
                    component = "shutdown",
                    event = "retirement_deadline_exceeded",
                    deadline_secs = self.deadline.as_secs(),
                    "config generation did not drain in time"
                );
                Err(TimeoutError.into())
            }
        }
    }
}
