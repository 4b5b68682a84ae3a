use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use job_sync::*;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stand-in for the real processing backend: keeps jobs in memory and
/// simulates work by pushing events.
#[derive(Clone, Default)]
struct SimulatedBackend {
    jobs: Arc<Mutex<HashMap<JobId, Job>>>,
}

impl SimulatedBackend {
    fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
        job.status = status;
        Ok(())
    }
}

impl SimulatedBackend {
    fn finish(&self, job_id: &str, result: serde_json::Value) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| TrackerError::NotFound(job_id.to_string()))?;
        job.result = Some(JobResult::decode(job.kind(), result)?);
        job.status = JobStatus::Completed;
        Ok(())
    }
}

/// Wait until the store reports a job update matching `done`.
async fn wait_for(
    changes: &mut broadcast::Receiver<StoreChange>,
    done: impl Fn(&Job) -> bool,
) -> Option<Arc<Job>> {
    loop {
        match changes.recv().await {
            Ok(StoreChange::JobUpdated(job)) if done(&job) => return Some(job),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

impl JobBackend for SimulatedBackend {
    async fn create_job(&self, spec: &JobSpec) -> Result<JobId, TrackerError> {
        let job = Job::new(spec.clone());
        let job_id = job.id.clone();
        self.jobs.lock().unwrap().insert(job_id.clone(), job);
        Ok(job_id)
    }

    async fn start_job(&self, job_id: &str) -> Result<(), TrackerError> {
        self.set_status(job_id, JobStatus::Running)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), TrackerError> {
        self.set_status(job_id, JobStatus::Cancelled)
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), TrackerError> {
        self.jobs.lock().unwrap().remove(job_id);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, TrackerError> {
        Ok(self.jobs.lock().unwrap().get(job_id).cloned())
    }

    async fn get_jobs(&self, filter: Option<&JobFilter>) -> Result<Vec<Job>, TrackerError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|job| filter.map_or(true, |f| f.matches(job)))
            .cloned()
            .collect())
    }

    async fn get_job_statistics(&self) -> Result<JobStatistics, TrackerError> {
        Ok(JobStatistics::from_jobs(self.jobs.lock().unwrap().values()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "job_sync=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let backend = SimulatedBackend::default();
    let config = TrackerConfig::builder()
        .with_poll_interval(Duration::from_millis(500))
        .build();
    let store = JobStore::new(backend.clone(), config);

    let (events, events_rx) = event_channel(store.config());
    let _subscription = store.subscribe(events_rx);
    let reconciler = store.spawn_reconciler();

    let job_id = store
        .create_job(JobSpec::Clip(ClipConfig {
            video_path: "/videos/match.mp4".into(),
            clipper: Some("yolo_pose".into()),
            options: Default::default(),
        }))
        .await?;
    store.start_job(&job_id).await?;
    reconciler.focus(Some(job_id.clone()));

    let mut changes = store.changes();

    // Simulate a worker processing the video in chunks.
    for done in 1..=4 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        events
            .send(JobEvent::ChunkComplete(ChunkComplete {
                job_id: job_id.clone(),
                chunk_count: 4,
                chunks_completed: done,
                chunk_index: Some(done - 1),
                message: Some(format!("Chunk {} of 4 processed", done)),
            }))
            .await?;
        if let Some(job) = wait_for(&mut changes, |job| job.chunks_completed >= Some(done)).await {
            println!("{} {:>3}% {:?}", job.status, job.progress.percent, job.progress.message);
        }
    }

    // The backend finishes without pushing an event; a forced poll picks it up.
    backend.finish(&job_id, serde_json::json!({
        "clips": [{ "path": "/clips/rally-1.mp4", "start": 12.0, "end": 19.5 }]
    }))?;
    reconciler.reconcile_now();
    wait_for(&mut changes, |job| job.is_terminal()).await;

    let stats = store.statistics();
    println!(
        "Total: {}, completed: {}, active job: {:?}",
        stats.total,
        stats.completed,
        store.active_job()
    );
    if let Some(JobResult::Clip(result)) = store.job(&job_id).and_then(|job| job.result.clone()) {
        println!("Clips: {}", result.clips.len());
    }

    reconciler.shutdown().await;
    Ok(())
}
