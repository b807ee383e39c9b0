//! Fixed-interval loop around the orchestrator.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::TriageError;
use crate::pipeline::orchestrator::TriageOrchestrator;

/// Default polling interval: 5 minutes.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

/// Runs a cycle immediately, then once per interval, until cancelled.
pub struct CycleScheduler {
    orchestrator: Arc<TriageOrchestrator>,
    interval: Duration,
}

impl CycleScheduler {
    pub fn new(orchestrator: Arc<TriageOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Spawn the loop on the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(cancel).await;
        })
    }

    /// Loop until `cancel` fires. Returns the number of cycles started.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        info!(
            interval_secs = self.interval.as_secs(),
            "Triage scheduler started"
        );
        let mut cycles = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            cycles += 1;
            self.run_contained(&cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(cycles, "Triage scheduler shutting down");
        cycles
    }

    /// One cycle with panics caught; nothing escapes.
    async fn run_contained(&self, cancel: &CancellationToken) {
        let cycle = AssertUnwindSafe(self.orchestrator.run_cycle(cancel)).catch_unwind();
        match cycle.await {
            Ok(Ok(_report)) => {}
            Ok(Err(TriageError::Cancelled)) => info!("Cycle cancelled"),
            Ok(Err(e)) => error!(error = %e, "Cycle failed"),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %reason, "Cycle panicked, continuing");
            }
        }
    }
}
