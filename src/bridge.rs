//! Forwarding of store changes to a Tauri front-end.

use serde::Serialize;
use tauri::{AppHandle, Emitter, Runtime};
use tokio::sync::broadcast::error::RecvError;

use crate::backend::JobBackend;
use crate::error::{Result, TrackerError};
use crate::reducer::StoreChange;
use crate::store::{JobStore, StoreView};
use crate::types::JobId;

/// Emitted with the full job record whenever it changes.
pub const JOBS_CHANGED_EVENT: &str = "jobs:changed";
pub const JOBS_REMOVED_EVENT: &str = "jobs:removed";
pub const ACTIVE_CHANGED_EVENT: &str = "jobs:active_changed";
/// Emitted with a full [`StoreView`] after changes were skipped; replaces
/// whatever the webview holds.
pub const JOBS_RESYNC_EVENT: &str = "jobs:resync";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRemovedEvent {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveJobChangedEvent {
    pub job_id: Option<JobId>,
}

/// Emit every store change to the webview until the store goes away.
///
/// If the front-end falls behind the change buffer, the skipped changes
/// are replaced by one `jobs:resync` carrying the whole store.
pub fn forward_changes<B, R>(store: &JobStore<B>, app_handle: AppHandle<R>)
where
    B: JobBackend,
    R: Runtime,
{
    let mut changes = store.changes();
    let store = store.downgrade();

    tauri::async_runtime::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    if let Err(e) = emit_change(&app_handle, &change) {
                        tracing::warn!("Failed to emit store change: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Front-end bridge lagged behind store changes, resyncing");
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    if let Err(e) = emit_resync(&app_handle, store.view()) {
                        tracing::warn!("Failed to emit store resync: {}", e);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn emit_resync<R: Runtime>(app_handle: &AppHandle<R>, view: StoreView) -> Result<()> {
    app_handle
        .emit(JOBS_RESYNC_EVENT, view)
        .map_err(|e| TrackerError::Event(e.to_string()))
}

fn emit_change<R: Runtime>(app_handle: &AppHandle<R>, change: &StoreChange) -> Result<()> {
    let emitted = match change {
        StoreChange::JobUpdated(job) => app_handle.emit(JOBS_CHANGED_EVENT, &**job),
        StoreChange::JobRemoved(job_id) => app_handle.emit(
            JOBS_REMOVED_EVENT,
            JobRemovedEvent {
                job_id: job_id.clone(),
            },
        ),
        StoreChange::ActiveJobChanged(job_id) => app_handle.emit(
            ACTIVE_CHANGED_EVENT,
            ActiveJobChangedEvent {
                job_id: job_id.clone(),
            },
        ),
    };
    emitted.map_err(|e| TrackerError::Event(e.to_string()))
}
