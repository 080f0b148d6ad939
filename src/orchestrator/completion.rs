//! Background task that records natural exits of load tool runs.

use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::{Inner, Orchestrator};
use crate::load::launcher::CompletionEvent;
use crate::load::Phase;
use crate::storage::TransitionOutcome;

/// Drain completion events until the orchestrator and every running
/// monitor are gone.
pub(super) async fn run_completion_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<CompletionEvent>,
) {
    debug!("completion loop started");
    while let Some(event) = events.recv().await {
        let Some(orchestrator) = Orchestrator::from_weak(&inner) else {
            debug!(test_key = %event.test_key, "orchestrator dropped, discarding completion");
            break;
        };
        // keys settle independently; one held lock must not stall the rest
        tokio::spawn(async move { orchestrator.apply_completion(event).await });
    }
    debug!("completion loop stopped");
}

impl Orchestrator {
    /// Move a key from `RUNNING` to the phase its exit implies. Events for
    /// keys that already left `RUNNING` (stopped, recovered) are dropped.
    pub(super) async fn apply_completion(&self, event: CompletionEvent) {
        let key = event.test_key;
        let _guard = self.inner.locks.lock(&key).await;
        self.take_run(&key);

        let reason = event.outcome.failure_reason();
        let next = if reason.is_some() {
            Phase::Failed
        } else {
            Phase::Completed
        };

        match self
            .inner
            .store
            .transition(&key, Phase::Running, next, reason.as_deref())
        {
            Ok(TransitionOutcome::Applied) => {
                info!(test_key = %key, phase = %next, reason = reason.as_deref().unwrap_or(""), "load test finished");
            }
            Ok(TransitionOutcome::Rejected { current }) => {
                debug!(test_key = %key, ?current, "stale completion event ignored");
            }
            Err(e) => {
                error!(test_key = %key, error = %e, "failed to record load test completion");
            }
        }
    }
}
