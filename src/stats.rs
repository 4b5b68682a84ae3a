use serde::{Deserialize, Serialize};

use crate::types::{Job, JobStatus};

/// Job counts per status.
///
/// Always recomputed from a job set; never kept as running counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatistics {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStatistics {
    pub fn from_jobs<'a, I>(jobs: I) -> Self
    where
        I: IntoIterator<Item = &'a Job>,
    {
        jobs.into_iter()
            .fold(Self::default(), |mut stats, job| {
                stats.record(job.status);
                stats
            })
    }

    fn record(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    /// Jobs still queued or running.
    pub fn active(&self) -> usize {
        self.queued + self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClipConfig, JobSpec};
    use serde_json::Map;

    fn job_with(status: JobStatus) -> Job {
        let mut job = Job::new(JobSpec::Clip(ClipConfig {
            video_path: "/v.mp4".into(),
            clipper: None,
            options: Map::new(),
        }));
        job.status = status;
        job
    }

    #[test]
    fn test_empty() {
        let stats = JobStatistics::from_jobs(std::iter::empty());
        assert_eq!(stats, JobStatistics::default());
    }

    #[test]
    fn test_counts_match_naive_count() {
        let statuses = [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Cancelled,
            JobStatus::Completed,
        ];
        let jobs: Vec<Job> = statuses.iter().map(|s| job_with(*s)).collect();
        let stats = JobStatistics::from_jobs(&jobs);

        for status in JobStatus::ALL {
            let naive = jobs.iter().filter(|j| j.status == status).count();
            assert_eq!(stats.count(status), naive);
        }
        assert_eq!(
            stats.total,
            stats.queued + stats.running + stats.completed + stats.failed + stats.cancelled
        );
        assert_eq!(stats.total, jobs.len());
        assert_eq!(stats.active(), 3);
    }
}
