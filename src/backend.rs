use std::collections::HashSet;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stats::JobStatistics;
use crate::types::{Job, JobId, JobKind, JobSpec, JobStatus};

/// Narrows a job listing. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statuses: Option<HashSet<JobStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<JobKind>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only jobs in one of the given statuses (builder pattern).
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        self.statuses = Some(statuses.into_iter().collect());
        self
    }

    /// Only jobs of the given kind (builder pattern).
    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Queued or running jobs.
    pub fn active() -> Self {
        Self::new().with_statuses([JobStatus::Queued, JobStatus::Running])
    }

    pub fn matches(&self, job: &Job) -> bool {
        let status_ok = self
            .statuses
            .as_ref()
            .map_or(true, |set| set.contains(&job.status));
        let kind_ok = self.kind.map_or(true, |kind| job.kind() == kind);
        status_ok && kind_ok
    }
}

/// Request/response interface of the external execution backend.
///
/// Implement this over whatever transport reaches the backend (IPC, HTTP,
/// a child process). Each call is one round trip: no retries, and a
/// failure comes back as an error for the caller to surface.
///
/// # Example
///
/// ```ignore
/// use job_sync::*;
///
/// struct HttpBackend { /* client */ }
///
/// impl JobBackend for HttpBackend {
///     async fn create_job(&self, spec: &JobSpec) -> Result<JobId, TrackerError> {
///         // POST /jobs
///     }
///     // ...
/// }
/// ```
pub trait JobBackend: Send + Sync + 'static {
    /// Register a new job. Returns the backend-assigned ID.
    fn create_job(
        &self,
        spec: &JobSpec,
    ) -> impl Future<Output = Result<JobId>> + Send;

    /// Ask the backend to begin executing a job.
    fn start_job(&self, job_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Ask the backend to stop a job.
    fn cancel_job(&self, job_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove a job from the backend's records.
    fn delete_job(&self, job_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a full snapshot of one job. `None` if the backend does not know it.
    fn get_job(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<Job>>> + Send;

    /// Fetch full snapshots of all jobs matching `filter`.
    fn get_jobs(
        &self,
        filter: Option<&JobFilter>,
    ) -> impl Future<Output = Result<Vec<Job>>> + Send;

    /// The backend's own view of job counts.
    fn get_job_statistics(
        &self,
    ) -> impl Future<Output = Result<JobStatistics>> + Send;
}
