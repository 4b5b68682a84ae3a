//! The store's single mutation entry point.
//!
//! Commands, push events and poll results are all turned into
//! [`StoreMessage`] values and folded into [`StoreState`] by [`reduce`].
//! Because `reduce` always reads the state it is handed, no update source
//! can act on a stale copy of a job.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::config::TrackerConfig;
use crate::events::{JobEvent, StatusChanged};
use crate::merge::{self, Merge};
use crate::types::{Job, JobId, JobStatus};

/// One state transition request.
#[derive(Debug, Clone)]
pub enum StoreMessage {
    /// A job returned by a successful create command.
    Inserted(Job),
    /// Jobs from an initial listing. Known jobs are reconciled, not replaced.
    Loaded(Vec<Job>),
    /// A push event from the backend.
    Event(JobEvent),
    /// Snapshots from a reconciliation poll.
    Snapshot(Vec<Job>),
    /// The backend accepted a start command.
    Started(JobId),
    /// The backend accepted a cancel command.
    Cancelled(JobId),
    /// The backend accepted a delete command.
    Removed(JobId),
    /// Drop orphan events whose grace window has passed.
    ExpireOrphans,
}

/// What changed as the result of one message.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    JobUpdated(Arc<Job>),
    JobRemoved(JobId),
    ActiveJobChanged(Option<JobId>),
}

/// The job set plus the active job pointer.
#[derive(Debug)]
pub struct StoreState {
    jobs: HashMap<JobId, Arc<Job>>,
    active_job: Option<JobId>,
    orphans: OrphanBuffer,
}

impl StoreState {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            jobs: HashMap::new(),
            active_job: None,
            orphans: OrphanBuffer::new(config.orphan_grace, config.max_orphan_events),
        }
    }

    pub fn job(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.get(job_id).cloned()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Arc<Job>> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn active_job(&self) -> Option<&str> {
        self.active_job.as_deref()
    }

    /// Whether any job is queued or running.
    pub fn has_active_jobs(&self) -> bool {
        self.jobs.values().any(|job| job.status.is_active())
    }

    /// Number of events held for jobs the store has not seen yet.
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }
}

/// Apply one message to the state and report what changed.
///
/// `now` stamps lifecycle timestamps; `clock` drives orphan expiry.
pub fn reduce(
    state: &mut StoreState,
    message: StoreMessage,
    now: DateTime<Utc>,
    clock: Instant,
) -> Vec<StoreChange> {
    let mut changes = Vec::new();
    state.orphans.expire(clock);

    match message {
        StoreMessage::Inserted(job) => upsert(state, job, now, &mut changes),
        StoreMessage::Loaded(jobs) => {
            for job in jobs {
                upsert(state, job, now, &mut changes);
            }
        }
        StoreMessage::Event(event) => {
            let Some(current) = state.jobs.get(event.job_id()).cloned() else {
                state.orphans.push(event, clock);
                return changes;
            };
            let outcome = merge::apply_event(&current, &event, now);
            commit(state, &current.id, outcome, event.channel(), &mut changes);
        }
        StoreMessage::Snapshot(snapshots) => {
            for snapshot in snapshots {
                match state.jobs.get(&snapshot.id).cloned() {
                    Some(current) => {
                        let outcome = merge::reconcile(&current, &snapshot, now);
                        commit(state, &current.id, outcome, "snapshot", &mut changes);
                    }
                    None => tracing::debug!(
                        job_id = %snapshot.id,
                        "Ignoring snapshot for job not in the store"
                    ),
                }
            }
        }
        StoreMessage::Started(job_id) => match state.jobs.get(&job_id).map(|job| job.status) {
            Some(status) if status.is_terminal() => tracing::debug!(
                job_id = %job_id,
                status = %status,
                "Start acknowledged for a job that already finished"
            ),
            Some(_) => set_active(state, Some(job_id), &mut changes),
            None => tracing::debug!(job_id = %job_id, "Start acknowledged for unknown job"),
        },
        StoreMessage::Cancelled(job_id) => {
            let Some(current) = state.jobs.get(&job_id).cloned() else {
                tracing::debug!(job_id = %job_id, "Cancel acknowledged for unknown job");
                return changes;
            };
            let event = JobEvent::StatusChange(StatusChanged {
                job_id: job_id.clone(),
                status: JobStatus::Cancelled,
                message: None,
            });
            let outcome = merge::apply_event(&current, &event, now);
            commit(state, &job_id, outcome, "cancel", &mut changes);
        }
        StoreMessage::Removed(job_id) => {
            state.orphans.take(&job_id);
            if state.jobs.remove(&job_id).is_some() {
                changes.push(StoreChange::JobRemoved(job_id.clone()));
            }
            if state.active_job.as_deref() == Some(job_id.as_str()) {
                set_active(state, None, &mut changes);
            }
        }
        StoreMessage::ExpireOrphans => {}
    }

    changes
}

fn upsert(state: &mut StoreState, job: Job, now: DateTime<Utc>, changes: &mut Vec<StoreChange>) {
    let job_id = job.id.clone();
    match state.jobs.get(&job_id).cloned() {
        Some(current) => {
            let outcome = merge::reconcile(&current, &job, now);
            commit(state, &job_id, outcome, "insert", changes);
        }
        None => {
            let job = Arc::new(job);
            state.jobs.insert(job_id.clone(), Arc::clone(&job));
            changes.push(StoreChange::JobUpdated(job));
        }
    }

    // Replay anything that arrived before the job was known.
    for event in state.orphans.take(&job_id) {
        let Some(current) = state.jobs.get(&job_id).cloned() else {
            break;
        };
        tracing::debug!(job_id = %job_id, channel = event.channel(), "Replaying buffered event");
        let outcome = merge::apply_event(&current, &event, now);
        commit(state, &job_id, outcome, event.channel(), changes);
    }
}

fn commit(
    state: &mut StoreState,
    job_id: &str,
    outcome: Merge,
    source: &'static str,
    changes: &mut Vec<StoreChange>,
) {
    match outcome {
        Merge::Applied(job) => {
            let terminal = job.is_terminal();
            let job = Arc::new(job);
            state.jobs.insert(job_id.to_string(), Arc::clone(&job));
            changes.push(StoreChange::JobUpdated(job));
            if terminal && state.active_job.as_deref() == Some(job_id) {
                set_active(state, None, changes);
            }
        }
        Merge::Unchanged => {}
        Merge::Rejected(reason) => {
            tracing::debug!(job_id = %job_id, source, "Dropped update: {}", reason);
        }
    }
}

fn set_active(state: &mut StoreState, job_id: Option<JobId>, changes: &mut Vec<StoreChange>) {
    if state.active_job != job_id {
        state.active_job = job_id.clone();
        changes.push(StoreChange::ActiveJobChanged(job_id));
    }
}

/// Events for jobs the store does not know yet, oldest first.
#[derive(Debug)]
struct OrphanBuffer {
    grace: Duration,
    capacity: usize,
    events: VecDeque<(Instant, JobEvent)>,
}

impl OrphanBuffer {
    fn new(grace: Duration, capacity: usize) -> Self {
        Self {
            grace,
            capacity,
            events: VecDeque::new(),
        }
    }

    fn len(&self) -> usize {
        self.events.len()
    }

    fn push(&mut self, event: JobEvent, at: Instant) {
        if self.grace.is_zero() || self.capacity == 0 {
            tracing::warn!(
                job_id = %event.job_id(),
                channel = event.channel(),
                "Dropping event for unknown job"
            );
            return;
        }
        if self.events.len() >= self.capacity {
            if let Some((_, oldest)) = self.events.pop_front() {
                tracing::warn!(
                    job_id = %oldest.job_id(),
                    channel = oldest.channel(),
                    "Orphan buffer full, dropping oldest event for unknown job"
                );
            }
        }
        self.events.push_back((at, event));
    }

    fn take(&mut self, job_id: &str) -> Vec<JobEvent> {
        if self.events.is_empty() {
            return Vec::new();
        }
        let (matching, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.events)
            .into_iter()
            .partition(|(_, event)| event.job_id() == job_id);
        self.events = rest;
        matching.into_iter().map(|(_, event)| event).collect()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((at, _)) = self.events.front() {
            if now.saturating_duration_since(*at) < self.grace {
                break;
            }
            if let Some((_, event)) = self.events.pop_front() {
                tracing::warn!(
                    job_id = %event.job_id(),
                    channel = event.channel(),
                    "Dropping event for unknown job after grace period"
                );
            }
        }
    }
}
