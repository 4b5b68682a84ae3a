use std::cmp::Ordering;
#[cfg(feature = "tauri")]
use std::sync::Weak;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::backend::{JobBackend, JobFilter};
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::events::JobEvent;
use crate::reconciler::ReconcilerHandle;
use crate::reducer::{reduce, StoreChange, StoreMessage, StoreState};
use crate::stats::JobStatistics;
use crate::subscription::EventSubscription;
use crate::types::{Job, JobId, JobSpec};

/// The single source of truth for job state on the front-end side.
///
/// Wraps a [`JobBackend`] and keeps an in-memory job set that is updated
/// from three directions: command results, push events (see
/// [`subscribe()`](Self::subscribe)) and reconciliation polls (see
/// [`spawn_reconciler()`](Self::spawn_reconciler)). Every update goes
/// through [`dispatch()`](Self::dispatch).
///
/// Cloning is cheap; clones share the same state.
///
/// # Example
///
/// ```ignore
/// let store = JobStore::new(backend, TrackerConfig::default());
/// let (events_tx, events_rx) = event_channel(store.config());
/// let _subscription = store.subscribe(events_rx);
/// let _reconciler = store.spawn_reconciler();
///
/// let job_id = store.create_job(spec).await?;
/// store.start_job(&job_id).await?;
/// ```
/// A consistent copy of the whole store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreView {
    /// Newest first.
    pub jobs: Vec<Job>,
    pub active_job_id: Option<JobId>,
}

pub struct JobStore<B> {
    inner: Arc<Inner<B>>,
}

struct Inner<B> {
    backend: B,
    config: TrackerConfig,
    state: Mutex<StoreState>,
    active_tx: watch::Sender<bool>,
    changes_tx: broadcast::Sender<StoreChange>,
}

/// Non-owning handle for tasks that must not keep the store alive.
#[cfg(feature = "tauri")]
pub(crate) struct WeakJobStore<B> {
    inner: Weak<Inner<B>>,
}

#[cfg(feature = "tauri")]
impl<B> WeakJobStore<B> {
    pub(crate) fn upgrade(&self) -> Option<JobStore<B>> {
        self.inner.upgrade().map(|inner| JobStore { inner })
    }
}

impl<B> Clone for JobStore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B> JobStore<B>
where
    B: JobBackend,
{
    pub fn new(backend: B, config: TrackerConfig) -> Self {
        let state = StoreState::new(&config);
        let (active_tx, _) = watch::channel(false);
        let (changes_tx, _) = broadcast::channel(config.change_buffer);

        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                state: Mutex::new(state),
                active_tx,
                changes_tx,
            }),
        }
    }

    #[cfg(feature = "tauri")]
    pub(crate) fn downgrade(&self) -> WeakJobStore<B> {
        WeakJobStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Apply one message through the reducer and publish the resulting changes.
    ///
    /// Publication happens under the state lock, so watchers and change
    /// receivers observe updates in the order they were reduced.
    pub fn dispatch(&self, message: StoreMessage) -> Vec<StoreChange> {
        let mut state = self.lock_state();
        let changes = reduce(&mut state, message, Utc::now(), Instant::now());
        let has_active = state.has_active_jobs();

        self.inner.active_tx.send_if_modified(|current| {
            if *current == has_active {
                false
            } else {
                *current = has_active;
                true
            }
        });
        for change in &changes {
            // No receivers is fine.
            let _ = self.inner.changes_tx.send(change.clone());
        }
        drop(state);
        changes
    }

    /// Decode a payload from a named backend channel and apply it.
    pub fn ingest(&self, channel: &str, payload: Value) -> Result<Vec<StoreChange>> {
        let event = JobEvent::decode(channel, payload)?;
        Ok(self.dispatch(StoreMessage::Event(event)))
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Create a job on the backend and add it to the store. Returns the job ID.
    pub async fn create_job(&self, spec: JobSpec) -> Result<JobId> {
        let kind = spec.kind();
        let job_id = self.inner.backend.create_job(&spec).await.map_err(|e| {
            tracing::warn!(kind = %kind, "Create job failed: {}", e);
            e
        })?;

        let job = match self.inner.backend.get_job(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Created job not returned by backend, tracking locally");
                Job::new(spec).with_id(job_id.clone())
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, "Fetching created job failed, tracking locally: {}", e);
                Job::new(spec).with_id(job_id.clone())
            }
        };

        tracing::info!(job_id = %job_id, kind = %kind, "Created job");
        self.dispatch(StoreMessage::Inserted(job));
        Ok(job_id)
    }

    /// Start a job. On success the job becomes the active job; its status
    /// changes once the backend reports it.
    pub async fn start_job(&self, job_id: &str) -> Result<()> {
        self.inner.backend.start_job(job_id).await.map_err(|e| {
            tracing::warn!(job_id = %job_id, "Start job failed: {}", e);
            e
        })?;
        tracing::info!(job_id = %job_id, "Started job");
        self.dispatch(StoreMessage::Started(job_id.to_string()));
        Ok(())
    }

    /// Cancel a job. On success the job is marked cancelled right away.
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.inner.backend.cancel_job(job_id).await.map_err(|e| {
            tracing::warn!(job_id = %job_id, "Cancel job failed: {}", e);
            e
        })?;
        tracing::info!(job_id = %job_id, "Cancelled job");
        self.dispatch(StoreMessage::Cancelled(job_id.to_string()));
        Ok(())
    }

    /// Delete a job from the backend and the store.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.inner.backend.delete_job(job_id).await.map_err(|e| {
            tracing::warn!(job_id = %job_id, "Delete job failed: {}", e);
            e
        })?;
        tracing::info!(job_id = %job_id, "Deleted job");
        self.dispatch(StoreMessage::Removed(job_id.to_string()));
        Ok(())
    }

    /// Read one job straight from the backend without touching the store.
    pub async fn fetch_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.inner.backend.get_job(job_id).await
    }

    /// Read jobs straight from the backend without touching the store.
    pub async fn fetch_jobs(&self, filter: Option<&JobFilter>) -> Result<Vec<Job>> {
        self.inner.backend.get_jobs(filter).await
    }

    /// Populate the store from the backend. Returns the number of jobs fetched.
    pub async fn load_jobs(&self, filter: Option<&JobFilter>) -> Result<usize> {
        let jobs = self.inner.backend.get_jobs(filter).await?;
        let count = jobs.len();
        tracing::debug!(count, "Loaded jobs from backend");
        self.dispatch(StoreMessage::Loaded(jobs));
        Ok(count)
    }

    /// The backend's own statistics, as opposed to [`statistics()`](Self::statistics).
    pub async fn backend_statistics(&self) -> Result<JobStatistics> {
        self.inner.backend.get_job_statistics().await
    }

    /// Run one reconciliation pass: fetch snapshots and merge them.
    ///
    /// With `focus` set only that job is fetched.
    pub async fn reconcile(&self, focus: Option<&str>) -> Result<usize> {
        let snapshots = match focus {
            Some(job_id) => self
                .inner
                .backend
                .get_job(job_id)
                .await?
                .into_iter()
                .collect(),
            None => self.inner.backend.get_jobs(None).await?,
        };
        let changed = self.dispatch(StoreMessage::Snapshot(snapshots)).len();
        Ok(changed)
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// All jobs, newest first.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self.lock_state().jobs().cloned().collect();
        jobs.sort_by(|a, b| newest_first(a, b));
        jobs
    }

    pub fn job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.lock_state().job(job_id)
    }

    /// The job most recently started, until it finishes or is deleted.
    pub fn active_job(&self) -> Option<JobId> {
        self.lock_state().active_job().map(str::to_string)
    }

    /// Whether any job is queued or running.
    pub fn has_active_jobs(&self) -> bool {
        self.lock_state().has_active_jobs()
    }

    /// Counts per status, recomputed from the current job set.
    pub fn statistics(&self) -> JobStatistics {
        let state = self.lock_state();
        JobStatistics::from_jobs(state.jobs().map(|job| &**job))
    }

    /// Every job plus the active pointer, read under one lock.
    ///
    /// Lets a consumer that missed changes rebuild its view from scratch.
    pub fn view(&self) -> StoreView {
        let state = self.lock_state();
        let mut jobs: Vec<Job> = state.jobs().map(|job| (**job).clone()).collect();
        jobs.sort_by(newest_first);
        StoreView {
            jobs,
            active_job_id: state.active_job().map(str::to_string),
        }
    }

    pub fn orphan_count(&self) -> usize {
        self.lock_state().orphan_count()
    }

    /// Receive every change applied from now on.
    pub fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.inner.changes_tx.subscribe()
    }

    /// Watch whether any job is queued or running.
    pub fn watch_active(&self) -> watch::Receiver<bool> {
        self.inner.active_tx.subscribe()
    }

    // ── Wiring ──────────────────────────────────────────────────────

    /// Feed a push-event stream into the store.
    ///
    /// Must be called from within a tokio runtime. The subscription stops
    /// when the sender side closes, on [`EventSubscription::shutdown`], or
    /// when the returned value is dropped.
    pub fn subscribe(&self, events: mpsc::Receiver<JobEvent>) -> EventSubscription {
        EventSubscription::spawn(self.clone(), events)
    }

    /// Start the reconciliation loop. Must be called from within a tokio runtime.
    pub fn spawn_reconciler(&self) -> ReconcilerHandle {
        ReconcilerHandle::spawn(self.clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        // Entries are replaced whole, so a poisoned lock still guards a consistent map.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn newest_first(a: &Job, b: &Job) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.id.cmp(&b.id))
}
