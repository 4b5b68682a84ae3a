use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::JobBackend;
use crate::config::TrackerConfig;
use crate::events::JobEvent;
use crate::reducer::StoreMessage;
use crate::store::JobStore;

/// Create the channel that carries push events into a store.
///
/// Hand the sender to whatever receives backend events (an IPC listener,
/// [`crate::protocol::pump_lines`], a test) and the receiver to
/// [`JobStore::subscribe()`].
pub fn event_channel(config: &TrackerConfig) -> (mpsc::Sender<JobEvent>, mpsc::Receiver<JobEvent>) {
    mpsc::channel(config.event_buffer.max(1))
}

/// A running push-event subscription.
///
/// Dropping it stops delivery; no events are applied afterwards.
pub struct EventSubscription {
    task: JoinHandle<()>,
}

impl EventSubscription {
    pub(crate) fn spawn<B: JobBackend>(store: JobStore<B>, mut events: mpsc::Receiver<JobEvent>) -> Self {
        let sweep_every = if store.config().orphan_grace.is_zero() {
            Duration::from_secs(60)
        } else {
            store.config().orphan_grace
        };

        let task = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else {
                            tracing::debug!("Event channel closed, subscription ending");
                            break;
                        };
                        tracing::trace!(job_id = %event.job_id(), channel = event.channel(), "Push event");
                        store.dispatch(StoreMessage::Event(event));
                    }
                    _ = sweep.tick() => {
                        if store.orphan_count() > 0 {
                            store.dispatch(StoreMessage::ExpireOrphans);
                        }
                    }
                }
            }
        });

        Self { task }
    }

    /// Whether the subscription has stopped (sender closed or shut down).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop delivery and wait for the task to wind down.
    pub async fn shutdown(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
