//! Background loop running one sweep per interval.

use crate::reconcile::sweep::Reconciler;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Timer-driven reconciliation loop.
///
/// Sweeps never overlap: the next sleep only starts once the previous sweep
/// has returned. A sweep that errors or panics is logged and the loop keeps
/// its schedule.
pub struct ReconciliationWorker;

impl ReconciliationWorker {
    /// Start the loop on the current runtime.
    ///
    /// The first sweep runs immediately. The returned handle resolves to the
    /// number of sweeps that completed once `shutdown` is cancelled.
    pub fn spawn(
        reconciler: Arc<Reconciler>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<u64> {
        tokio::spawn(async move {
            let mut completed = 0u64;
            info!(interval_secs = interval.as_secs(), "Reconciliation worker started");

            while !shutdown.is_cancelled() {
                let run = Arc::clone(&reconciler);
                match tokio::spawn(async move { run.sweep().await }).await {
                    Ok(Ok(_)) => completed += 1,
                    Ok(Err(e)) => error!(error = %e, "Reconciliation sweep failed"),
                    Err(e) => error!(error = %e, "Reconciliation sweep panicked"),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            info!(sweeps = completed, "Reconciliation worker stopped");
            completed
        })
    }
}
