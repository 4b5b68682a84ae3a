//! Pure merge rules: how a push event or a polled snapshot changes one job.
//!
//! Every function here takes the current record by reference and returns a
//! whole new record (or a reason for not producing one). The store swaps the
//! new record in atomically, so nothing ever sees a half-merged job.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::events::{ChunkComplete, JobEvent, ProgressUpdate};
use crate::types::{clamp_percent, Job, JobLog, JobResult, JobStatus, ProgressStep};

/// Outcome of merging one update into a job.
#[derive(Debug, Clone, PartialEq)]
pub enum Merge {
    /// The job changed. The new record has its revision bumped.
    Applied(Job),
    /// The update carried nothing new.
    Unchanged,
    /// The update would break the state machine and was dropped.
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The job already reached a terminal state.
    Terminal { status: JobStatus },
    /// The requested status change is not a legal step.
    IllegalTransition { from: JobStatus, to: JobStatus },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Terminal { status } => write!(f, "job is already {}", status),
            Rejection::IllegalTransition { from, to } => {
                write!(f, "illegal transition {} -> {}", from, to)
            }
        }
    }
}

/// Apply one push event to a job.
pub fn apply_event(job: &Job, event: &JobEvent, now: DateTime<Utc>) -> Merge {
    if job.is_terminal() {
        return Merge::Rejected(Rejection::Terminal { status: job.status });
    }

    let mut next = job.clone();
    match event {
        JobEvent::Progress(update) => {
            mark_running(&mut next, now);
            merge_progress(&mut next, update, now);
        }
        JobEvent::Log(entry) => next.logs.push(JobLog {
            timestamp: entry.timestamp.unwrap_or(now),
            level: entry.level,
            message: entry.message.clone(),
        }),
        JobEvent::ChunkComplete(chunk) => {
            mark_running(&mut next, now);
            merge_chunk_event(&mut next, chunk);
        }
        JobEvent::Complete(done) => {
            finish(&mut next, JobStatus::Completed, now);
            next.result = match &done.result {
                Some(value) if !value.is_null() => {
                    match JobResult::decode(job.kind(), value.clone()) {
                        Ok(result) => Some(result),
                        Err(e) => {
                            tracing::warn!(
                                job_id = %job.id,
                                kind = %job.kind(),
                                "Discarding undecodable job result: {}",
                                e
                            );
                            None
                        }
                    }
                }
                _ => None,
            };
        }
        JobEvent::Error(failed) => {
            finish(&mut next, JobStatus::Failed, now);
            next.error = Some(failed.error.clone());
        }
        JobEvent::StatusChange(change) => {
            if change.status == job.status {
                return Merge::Unchanged;
            }
            if !job.status.can_transition_to(change.status) {
                return Merge::Rejected(Rejection::IllegalTransition {
                    from: job.status,
                    to: change.status,
                });
            }
            if change.status == JobStatus::Running {
                mark_running(&mut next, now);
            } else {
                finish(&mut next, change.status, now);
            }
            if let Some(message) = &change.message {
                next.progress.message = Some(message.clone());
            }
        }
    }

    commit(job, next)
}

/// Merge a polled snapshot into the local record.
///
/// A terminal snapshot replaces an active local record. A terminal local
/// record ignores every snapshot. Between two active records only the
/// fields the snapshot is authoritative for are merged, and never
/// backwards.
pub fn reconcile(local: &Job, snapshot: &Job, now: DateTime<Utc>) -> Merge {
    if local.is_terminal() {
        return if snapshot.status == local.status {
            Merge::Unchanged
        } else {
            Merge::Rejected(Rejection::Terminal {
                status: local.status,
            })
        };
    }

    if snapshot.is_terminal() {
        let mut next = snapshot.clone();
        next.id = local.id.clone();
        if local.logs.len() > next.logs.len() {
            next.logs = local.logs.clone();
        }
        if local.progress.steps.len() > next.progress.steps.len() {
            next.progress.steps = local.progress.steps.clone();
        }
        next.started_at = next.started_at.or(local.started_at);
        if next.completed_at.is_none() {
            next.completed_at = Some(not_before(now, next.started_at));
        }
        next.progress.percent = if next.status == JobStatus::Completed {
            100
        } else {
            next.progress.percent.max(local.progress.percent)
        };
        order_timestamps(&mut next);
        return commit(local, next);
    }

    let mut next = local.clone();

    if local.status == JobStatus::Queued && snapshot.status == JobStatus::Running {
        next.status = JobStatus::Running;
        next.started_at = Some(
            snapshot
                .started_at
                .unwrap_or_else(|| not_before(now, Some(local.created_at))),
        );
    } else if next.started_at.is_none() && next.status == JobStatus::Running {
        next.started_at = snapshot.started_at;
    }

    if snapshot.progress.percent > local.progress.percent {
        let steps = std::mem::take(&mut next.progress.steps);
        next.progress = snapshot.progress.clone();
        if steps.len() > next.progress.steps.len() {
            next.progress.steps = steps;
        }
    } else {
        let progress = &mut next.progress;
        let theirs = &snapshot.progress;
        if progress.phase.is_none() {
            progress.phase = theirs.phase.clone();
        }
        if progress.message.is_none() {
            progress.message = theirs.message.clone();
        }
        progress.current_frame = progress.current_frame.or(theirs.current_frame);
        progress.total_frames = progress.total_frames.or(theirs.total_frames);
        if theirs.steps.len() > progress.steps.len() {
            progress.steps = theirs.steps.clone();
        }
    }

    if snapshot.logs.len() > local.logs.len() {
        next.logs = snapshot.logs.clone();
    }

    if let Some(count) = snapshot.chunk_count {
        merge_chunks(&mut next, count, snapshot.chunks_completed.unwrap_or(0));
    }

    order_timestamps(&mut next);
    commit(local, next)
}

fn commit(previous: &Job, mut next: Job) -> Merge {
    next.revision = previous.revision;
    if next == *previous {
        Merge::Unchanged
    } else {
        next.revision = previous.revision + 1;
        Merge::Applied(next)
    }
}

/// `now`, but never earlier than `floor`. Keeps lifecycle timestamps ordered
/// when backend clocks run ahead of ours.
fn not_before(now: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    match floor {
        Some(floor) if floor > now => floor,
        _ => now,
    }
}

/// Backend timestamps can come from a skewed clock; keep
/// `created_at <= started_at <= completed_at`.
fn order_timestamps(job: &mut Job) {
    job.started_at = job
        .started_at
        .map(|started| not_before(started, Some(job.created_at)));
    let floor = job.started_at.or(Some(job.created_at));
    job.completed_at = job
        .completed_at
        .map(|completed| not_before(completed, floor));
}

/// Progress for a queued job means the backend started it and the
/// status-change event has not arrived yet.
fn mark_running(job: &mut Job, now: DateTime<Utc>) {
    if job.status == JobStatus::Queued {
        job.status = JobStatus::Running;
    }
    if job.started_at.is_none() {
        job.started_at = Some(not_before(now, Some(job.created_at)));
    }
}

fn finish(job: &mut Job, status: JobStatus, now: DateTime<Utc>) {
    job.status = status;
    job.completed_at = Some(not_before(
        now,
        Some(job.started_at.unwrap_or(job.created_at)),
    ));
    if status == JobStatus::Completed {
        job.progress.percent = 100;
    }
}

fn merge_progress(job: &mut Job, update: &ProgressUpdate, now: DateTime<Utc>) {
    let ratio_driven = matches!(job.chunk_count, Some(count) if count > 0);
    let progress = &mut job.progress;

    if let Some(percent) = update.percent {
        if !ratio_driven && percent > progress.percent {
            progress.percent = percent;
        }
    }
    if let Some(phase) = &update.phase {
        progress.phase = Some(phase.clone());
    }
    if let Some(message) = &update.message {
        progress.message = Some(message.clone());
    }
    if let Some(frame) = update.current_frame {
        progress.current_frame = Some(frame);
    }
    if let Some(total) = update.total_frames {
        progress.total_frames = Some(total);
    }
    if let Some(step) = &update.step {
        let repeated = progress.steps.last().map(|s| &s.message) == Some(step);
        if !repeated {
            progress.steps.push(ProgressStep {
                message: step.clone(),
                timestamp: now,
            });
        }
    }
}

fn merge_chunk_event(job: &mut Job, chunk: &ChunkComplete) {
    merge_chunks(job, chunk.chunk_count, chunk.chunks_completed);
    if let Some(message) = &chunk.message {
        job.progress.message = Some(message.clone());
    }
}

/// Completed chunks only grow for a given chunk count; a late `2/10` after
/// `3/10` is stale and keeps `3/10`. A zero count carries no ratio and is
/// ignored.
fn merge_chunks(job: &mut Job, count: u32, completed: u32) {
    if count == 0 {
        return;
    }
    let completed = completed.min(count);
    let completed = match (job.chunk_count, job.chunks_completed) {
        (Some(known), Some(done)) if known == count => done.max(completed),
        _ => completed,
    };
    job.chunk_count = Some(count);
    job.chunks_completed = Some(completed);

    let derived = clamp_percent(f64::from(completed) / f64::from(count) * 100.0);
    job.progress.percent = job.progress.percent.max(derived);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{JobCompleted, JobFailed, LogEntry, StatusChanged};
    use crate::types::{ClipConfig, JobError, JobSpec, LogLevel};
    use chrono::Duration;
    use serde_json::{json, Map};

    fn job() -> Job {
        Job::new(JobSpec::Clip(ClipConfig {
            video_path: "/videos/a.mp4".into(),
            clipper: None,
            options: Map::new(),
        }))
        .with_id("j1")
    }

    fn running() -> Job {
        let mut job = job();
        job.status = JobStatus::Running;
        job.started_at = Some(job.created_at);
        job
    }

    fn applied(merge: Merge) -> Job {
        match merge {
            Merge::Applied(job) => job,
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    fn progress(percent: Option<u8>) -> JobEvent {
        JobEvent::Progress(ProgressUpdate {
            job_id: "j1".into(),
            percent,
            ..Default::default()
        })
    }

    fn chunks(done: u32, count: u32) -> JobEvent {
        JobEvent::ChunkComplete(ChunkComplete {
            job_id: "j1".into(),
            chunk_count: count,
            chunks_completed: done,
            chunk_index: None,
            message: None,
        })
    }

    fn status(status: JobStatus) -> JobEvent {
        JobEvent::StatusChange(StatusChanged {
            job_id: "j1".into(),
            status,
            message: None,
        })
    }

    #[test]
    fn test_progress_merges_only_named_fields() {
        let mut current = running();
        current.progress.message = Some("loading".into());
        current.progress.total_frames = Some(900);

        let event = JobEvent::Progress(ProgressUpdate {
            job_id: "j1".into(),
            percent: Some(40),
            phase: Some("detection".into()),
            current_frame: Some(360),
            ..Default::default()
        });
        let next = applied(apply_event(&current, &event, Utc::now()));

        assert_eq!(next.progress.percent, 40);
        assert_eq!(next.progress.phase.as_deref(), Some("detection"));
        assert_eq!(next.progress.message.as_deref(), Some("loading"));
        assert_eq!(next.progress.current_frame, Some(360));
        assert_eq!(next.progress.total_frames, Some(900));
        assert_eq!(next.revision, current.revision + 1);
    }

    #[test]
    fn test_progress_never_lowers_percent() {
        let mut current = running();
        current.progress.percent = 60;

        let event = JobEvent::Progress(ProgressUpdate {
            job_id: "j1".into(),
            percent: Some(20),
            message: Some("late".into()),
            ..Default::default()
        });
        let next = applied(apply_event(&current, &event, Utc::now()));
        assert_eq!(next.progress.percent, 60);
        assert_eq!(next.progress.message.as_deref(), Some("late"));

        assert_eq!(apply_event(&next, &progress(Some(10)), Utc::now()), Merge::Unchanged);
    }

    #[test]
    fn test_progress_promotes_queued_job() {
        let current = job();
        let now = current.created_at + Duration::seconds(3);
        let next = applied(apply_event(&current, &progress(Some(5)), now));
        assert_eq!(next.status, JobStatus::Running);
        assert_eq!(next.started_at, Some(now));
    }

    #[test]
    fn test_steps_append_without_repeats() {
        let step = |name: &str| {
            JobEvent::Progress(ProgressUpdate {
                job_id: "j1".into(),
                step: Some(name.into()),
                ..Default::default()
            })
        };
        let now = Utc::now();
        let a = applied(apply_event(&running(), &step("Loading video"), now));
        let b = applied(apply_event(&a, &step("Running detector"), now));
        assert_eq!(apply_event(&b, &step("Running detector"), now), Merge::Unchanged);
        let messages: Vec<_> = b.progress.steps.iter().map(|s| s.message.as_str()).collect();
        assert_eq!(messages, ["Loading video", "Running detector"]);
    }

    #[test]
    fn test_log_appends_and_stamps() {
        let now = Utc::now();
        let event = JobEvent::Log(LogEntry {
            job_id: "j1".into(),
            timestamp: None,
            level: LogLevel::Warning,
            message: "dropped frame".into(),
        });
        let next = applied(apply_event(&running(), &event, now));
        assert_eq!(next.logs.len(), 1);
        assert_eq!(next.logs[0].timestamp, now);
        assert_eq!(next.logs[0].level, LogLevel::Warning);
    }

    #[test]
    fn test_chunk_ratio_drives_percent() {
        let next = applied(apply_event(&running(), &chunks(3, 10), Utc::now()));
        assert_eq!(next.progress.percent, 30);
        assert_eq!(next.chunks_completed, Some(3));

        // Once chunks are known, progress percentages are ignored.
        assert_eq!(
            apply_event(&next, &progress(Some(90)), Utc::now()),
            Merge::Unchanged
        );
    }

    #[test]
    fn test_out_of_order_chunks_keep_highest() {
        let now = Utc::now();
        let three = applied(apply_event(&running(), &chunks(3, 10), now));
        assert_eq!(apply_event(&three, &chunks(2, 10), now), Merge::Unchanged);
        assert_eq!(three.chunks_completed, Some(3));
        assert_eq!(three.progress.percent, 30);
    }

    #[test]
    fn test_zero_chunk_count_leaves_percent_to_progress() {
        let current = running();
        assert_eq!(apply_event(&current, &chunks(0, 0), Utc::now()), Merge::Unchanged);

        // A backend record that already reports zero chunks.
        let mut zero = running();
        zero.chunk_count = Some(0);
        let next = applied(apply_event(&zero, &progress(Some(35)), Utc::now()));
        assert_eq!(next.progress.percent, 35);
    }

    #[test]
    fn test_chunk_round_half_up() {
        let next = applied(apply_event(&running(), &chunks(1, 8), Utc::now()));
        assert_eq!(next.progress.percent, 13);
    }

    #[test]
    fn test_complete_sets_result_and_percent() {
        let current = running();
        let now = Utc::now();
        let event = JobEvent::Complete(JobCompleted {
            job_id: "j1".into(),
            result: Some(json!({ "clips": [ { "start": 0.0, "end": 2.0 } ] })),
        });
        let next = applied(apply_event(&current, &event, now));
        assert_eq!(next.status, JobStatus::Completed);
        assert_eq!(next.progress.percent, 100);
        assert_eq!(next.completed_at, Some(now));
        assert!(matches!(next.result, Some(JobResult::Clip(ref r)) if r.clips.len() == 1));
    }

    #[test]
    fn test_complete_with_wrong_result_shape() {
        let event = JobEvent::Complete(JobCompleted {
            job_id: "j1".into(),
            result: Some(json!({ "clips": 7 })),
        });
        let next = applied(apply_event(&running(), &event, Utc::now()));
        assert_eq!(next.status, JobStatus::Completed);
        assert!(next.result.is_none());
    }

    #[test]
    fn test_error_leaves_progress_alone() {
        let current = job();
        let event = JobEvent::Error(JobFailed {
            job_id: "j1".into(),
            error: JobError::new("x"),
        });
        let next = applied(apply_event(&current, &event, Utc::now()));
        assert_eq!(next.status, JobStatus::Failed);
        assert_eq!(next.error.as_ref().map(|e| e.message.as_str()), Some("x"));
        assert!(next.completed_at.is_some());
        assert_eq!(next.progress, current.progress);
    }

    #[test]
    fn test_terminal_absorbs_every_event() {
        let mut done = running();
        done.status = JobStatus::Cancelled;
        done.completed_at = Some(Utc::now());

        let events = [
            progress(Some(80)),
            chunks(5, 10),
            status(JobStatus::Running),
            status(JobStatus::Queued),
            JobEvent::Log(LogEntry {
                job_id: "j1".into(),
                timestamp: None,
                level: LogLevel::Info,
                message: "late".into(),
            }),
        ];
        for event in &events {
            assert_eq!(
                apply_event(&done, event, Utc::now()),
                Merge::Rejected(Rejection::Terminal {
                    status: JobStatus::Cancelled
                })
            );
        }
    }

    #[test]
    fn test_status_change_rules() {
        let queued = job();
        let now = Utc::now();
        let started = applied(apply_event(&queued, &status(JobStatus::Running), now));
        assert_eq!(started.started_at, Some(now));

        assert_eq!(
            apply_event(&started, &status(JobStatus::Running), now),
            Merge::Unchanged
        );
        assert_eq!(
            apply_event(&started, &status(JobStatus::Queued), now),
            Merge::Rejected(Rejection::IllegalTransition {
                from: JobStatus::Running,
                to: JobStatus::Queued,
            })
        );

        let cancelled = applied(apply_event(&started, &status(JobStatus::Cancelled), now));
        assert_eq!(cancelled.completed_at, Some(now));
    }

    #[test]
    fn test_timestamps_stay_ordered() {
        let current = running();
        let earlier = current.created_at - Duration::seconds(30);
        let next = applied(apply_event(&current, &status(JobStatus::Failed), earlier));
        assert!(next.completed_at.unwrap() >= next.started_at.unwrap());
    }

    #[test]
    fn test_terminal_snapshot_keeps_timestamps_ordered() {
        let mut local = running();
        let now = local.created_at + Duration::seconds(60);
        local.started_at = Some(now - Duration::seconds(10));

        let mut snapshot = local.clone();
        snapshot.status = JobStatus::Completed;
        snapshot.started_at = None;
        snapshot.completed_at = Some(now - Duration::seconds(30));

        let next = applied(reconcile(&local, &snapshot, now));
        let started = next.started_at.unwrap();
        assert_eq!(started, now - Duration::seconds(10));
        assert!(next.completed_at.unwrap() >= started);
    }

    #[test]
    fn test_running_snapshot_start_not_before_creation() {
        let local = job();
        let mut snapshot = local.clone();
        snapshot.status = JobStatus::Running;
        snapshot.started_at = Some(local.created_at - Duration::seconds(45));

        let next = applied(reconcile(&local, &snapshot, Utc::now()));
        assert_eq!(next.started_at, Some(local.created_at));
    }

    #[test]
    fn test_reconcile_terminal_snapshot_wins() {
        let mut local = running();
        local.progress.percent = 40;
        local.logs.push(JobLog {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: "only here".into(),
        });

        let mut snapshot = local.clone();
        snapshot.logs.clear();
        snapshot.status = JobStatus::Completed;
        snapshot.progress.percent = 97;
        snapshot.result = Some(JobResult::Clip(Default::default()));

        let next = applied(reconcile(&local, &snapshot, Utc::now()));
        assert_eq!(next.status, JobStatus::Completed);
        assert_eq!(next.progress.percent, 100);
        assert_eq!(next.logs.len(), 1);
        assert!(next.completed_at.is_some());
        assert!(next.result.is_some());
    }

    #[test]
    fn test_reconcile_never_reverts_terminal() {
        let mut local = job();
        local.status = JobStatus::Cancelled;
        local.completed_at = Some(Utc::now());

        let snapshot = job();
        assert_eq!(
            reconcile(&local, &snapshot, Utc::now()),
            Merge::Rejected(Rejection::Terminal {
                status: JobStatus::Cancelled
            })
        );

        let mut same = local.clone();
        same.logs.push(JobLog {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: "ack".into(),
        });
        assert_eq!(reconcile(&local, &same, Utc::now()), Merge::Unchanged);
    }

    #[test]
    fn test_reconcile_active_does_not_regress() {
        let mut local = running();
        local.progress.percent = 70;
        local.progress.message = Some("fresh".into());

        let mut snapshot = running();
        snapshot.progress.percent = 50;
        snapshot.progress.message = Some("stale".into());
        snapshot.progress.total_frames = Some(1000);

        let next = applied(reconcile(&local, &snapshot, Utc::now()));
        assert_eq!(next.progress.percent, 70);
        assert_eq!(next.progress.message.as_deref(), Some("fresh"));
        assert_eq!(next.progress.total_frames, Some(1000));
    }

    #[test]
    fn test_reconcile_active_takes_newer_progress() {
        let local = running();
        let mut snapshot = running();
        snapshot.progress.percent = 55;
        snapshot.progress.phase = Some("clipping".into());

        let next = applied(reconcile(&local, &snapshot, Utc::now()));
        assert_eq!(next.progress.percent, 55);
        assert_eq!(next.progress.phase.as_deref(), Some("clipping"));
    }

    #[test]
    fn test_reconcile_promotes_queued() {
        let local = job();
        let mut snapshot = job();
        snapshot.status = JobStatus::Running;
        let started = local.created_at + Duration::seconds(1);
        snapshot.started_at = Some(started);

        let next = applied(reconcile(&local, &snapshot, Utc::now()));
        assert_eq!(next.status, JobStatus::Running);
        assert_eq!(next.started_at, Some(started));
    }

    #[test]
    fn test_reconcile_keeps_running_over_queued_snapshot() {
        let local = running();
        let snapshot = job();
        assert_eq!(reconcile(&local, &snapshot, Utc::now()), Merge::Unchanged);
    }

    #[test]
    fn test_reconcile_logs_longer_wins() {
        let local = running();
        let mut snapshot = running();
        snapshot.logs.push(JobLog {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: "from poll".into(),
        });
        let next = applied(reconcile(&local, &snapshot, Utc::now()));
        assert_eq!(next.logs.len(), 1);

        let shorter = running();
        assert_eq!(reconcile(&next, &shorter, Utc::now()), Merge::Unchanged);
    }

    #[test]
    fn test_reconcile_chunks_max_merge() {
        let local = applied(apply_event(&running(), &chunks(6, 10), Utc::now()));
        let mut snapshot = running();
        snapshot.chunk_count = Some(10);
        snapshot.chunks_completed = Some(4);
        assert_eq!(reconcile(&local, &snapshot, Utc::now()), Merge::Unchanged);

        snapshot.chunks_completed = Some(8);
        let next = applied(reconcile(&local, &snapshot, Utc::now()));
        assert_eq!(next.chunks_completed, Some(8));
        assert_eq!(next.progress.percent, 80);
    }
}
