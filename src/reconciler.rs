use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::backend::JobBackend;
use crate::store::JobStore;
use crate::types::JobId;

/// Handle to the background reconciliation loop.
///
/// The loop polls the backend every `poll_interval` while any job is
/// queued or running and sleeps otherwise, waking when a job becomes
/// active again. A failed poll is logged and retried on the next tick.
///
/// Dropping the handle stops the loop.
pub struct ReconcilerHandle {
    task: JoinHandle<()>,
    focus_tx: watch::Sender<Option<JobId>>,
    wake: Arc<Notify>,
}

impl ReconcilerHandle {
    pub(crate) fn spawn<B: JobBackend>(store: JobStore<B>) -> Self {
        let (focus_tx, focus_rx) = watch::channel(None);
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run_loop(store, focus_rx, Arc::clone(&wake)));

        Self {
            task,
            focus_tx,
            wake,
        }
    }

    /// Restrict polling to a single job, or poll every job with `None`.
    pub fn focus(&self, job_id: Option<JobId>) {
        self.focus_tx.send_replace(job_id);
    }

    /// Run a pass right away, even if no job is active.
    pub fn reconcile_now(&self) {
        self.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it to wind down.
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_loop<B: JobBackend>(
    store: JobStore<B>,
    focus_rx: watch::Receiver<Option<JobId>>,
    wake: Arc<Notify>,
) {
    let mut active_rx = store.watch_active();
    let poll_interval = store.config().poll_interval;

    loop {
        let active = *active_rx.borrow_and_update();

        let forced = if active {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => false,
                _ = wake.notified() => true,
            }
        } else {
            tracing::debug!("No active jobs, reconciler idle");
            tokio::select! {
                changed = active_rx.changed() => {
                    if changed.is_err() {
                        // Store dropped.
                        return;
                    }
                    continue;
                }
                _ = wake.notified() => true,
            }
        };

        if !forced && !store.has_active_jobs() {
            continue;
        }

        let focus = focus_rx.borrow().clone();
        match store.reconcile(focus.as_deref()).await {
            Ok(changed) => {
                tracing::trace!(changed, focus = ?focus, "Reconciliation pass");
            }
            Err(e) => {
                tracing::warn!("Reconciliation poll failed: {}", e);
            }
        }
    }
}
