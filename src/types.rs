use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::TrackerError;

/// Backend-assigned job identifier.
pub type JobId = String;

/// Job status lifecycle: Queued -> Running -> Completed/Failed/Cancelled.
///
/// The three terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Queued or running: the job still needs watching.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` is a legal state-machine step.
    ///
    /// Same-status moves are not transitions and return `false`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (JobStatus::Queued, JobStatus::Running) => true,
            (_, to) => to.is_terminal(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag selecting the config/result shape of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    /// Detect segments in a video and extract them as clips.
    Clip,
    /// Run several detection models over one video and compare them.
    Comparison,
    /// Re-cut the clips of an earlier job with new parameters.
    Reclip,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Clip => "clip",
            JobKind::Comparison => "comparison",
            JobKind::Reclip => "reclip",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Config for a clip-extraction job. Detector parameters are opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipConfig {
    pub video_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clipper: Option<String>,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// Config for a multi-model comparison job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonConfig {
    pub video_path: PathBuf,
    pub models: Vec<String>,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// Config for re-clipping the output of an earlier job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclipConfig {
    pub source_job_id: JobId,
    pub video_path: PathBuf,
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

/// What a job does, tagged by kind. Serialized as `{"type": .., "config": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "kebab-case")]
pub enum JobSpec {
    Clip(ClipConfig),
    Comparison(ComparisonConfig),
    Reclip(ReclipConfig),
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            JobSpec::Clip(_) => JobKind::Clip,
            JobSpec::Comparison(_) => JobKind::Comparison,
            JobSpec::Reclip(_) => JobKind::Reclip,
        }
    }

    /// The video the job operates on.
    pub fn video_path(&self) -> &Path {
        match self {
            JobSpec::Clip(c) => &c.video_path,
            JobSpec::Comparison(c) => &c.video_path,
            JobSpec::Reclip(c) => &c.video_path,
        }
    }

    /// Rebuild a spec from a kind tag and its raw config.
    pub fn from_parts(kind: JobKind, config: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            JobKind::Clip => JobSpec::Clip(serde_json::from_value(config)?),
            JobKind::Comparison => JobSpec::Comparison(serde_json::from_value(config)?),
            JobKind::Reclip => JobSpec::Reclip(serde_json::from_value(config)?),
        })
    }
}

/// One extracted clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipSegment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub start: f64,
    pub end: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Output of clip and re-clip jobs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipResult {
    #[serde(default)]
    pub clips: Vec<ClipSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-model figures from a comparison job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReport {
    pub model: String,
    #[serde(default)]
    pub detections: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Output of a comparison job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    #[serde(default)]
    pub models: Vec<ModelReport>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of a completed job. The variant always matches the job's kind.
///
/// The backend sends results untagged, so decoding goes through
/// [`JobResult::decode`] with the kind of the job the result belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobResult {
    Clip(ClipResult),
    Comparison(ComparisonResult),
    Reclip(ClipResult),
}

impl JobResult {
    pub fn decode(kind: JobKind, value: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            JobKind::Clip => JobResult::Clip(serde_json::from_value(value)?),
            JobKind::Comparison => JobResult::Comparison(serde_json::from_value(value)?),
            JobKind::Reclip => JobResult::Reclip(serde_json::from_value(value)?),
        })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobResult::Clip(_) => JobKind::Clip,
            JobResult::Comparison(_) => JobKind::Comparison,
            JobResult::Reclip(_) => JobKind::Reclip,
        }
    }
}

/// A named processing step, in the order the backend reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    /// Whole percent, 0 to 100.
    #[serde(default, deserialize_with = "de_percent")]
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_frame: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
    #[serde(default)]
    pub steps: Vec<ProgressStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warning),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Failure details reported by the backend for a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
        }
    }
}

/// One tracked unit of backend work.
///
/// On the wire the [`JobSpec`] is flattened into `type` + `config`, and `result`
/// is decoded against that `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawJob")]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub spec: JobSpec,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub logs: Vec<JobLog>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks_completed: Option<u32>,
    /// Local change counter, bumped on every applied mutation.
    pub revision: u64,
}

impl Job {
    /// Create a queued job with a generated UUID.
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            spec,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: JobProgress::default(),
            logs: Vec::new(),
            result: None,
            error: None,
            chunk_count: None,
            chunks_completed: None,
            revision: 0,
        }
    }

    /// Set a custom ID for this job (builder pattern).
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the creation time (builder pattern).
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.spec.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Decode a backend job snapshot.
    pub fn from_json(value: Value) -> Result<Self, TrackerError> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Wire shape of a job before the config and result are checked against
/// the kind tag.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJob {
    id: JobId,
    #[serde(rename = "type")]
    kind: JobKind,
    #[serde(default)]
    config: Value,
    status: JobStatus,
    created_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    progress: JobProgress,
    #[serde(default)]
    logs: Vec<JobLog>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JobError>,
    #[serde(default)]
    chunk_count: Option<u32>,
    #[serde(default)]
    chunks_completed: Option<u32>,
    #[serde(default)]
    revision: u64,
}

impl TryFrom<RawJob> for Job {
    type Error = String;

    fn try_from(raw: RawJob) -> Result<Self, Self::Error> {
        let spec = JobSpec::from_parts(raw.kind, raw.config)
            .map_err(|e| format!("invalid {} config for job {}: {}", raw.kind, raw.id, e))?;

        let result = match (raw.status, raw.result) {
            (JobStatus::Completed, Some(value)) if !value.is_null() => Some(
                JobResult::decode(raw.kind, value)
                    .map_err(|e| format!("invalid {} result for job {}: {}", raw.kind, raw.id, e))?,
            ),
            _ => None,
        };
        let error = if raw.status == JobStatus::Failed {
            raw.error
        } else {
            None
        };

        Ok(Job {
            id: raw.id,
            spec,
            status: raw.status,
            created_at: raw.created_at,
            started_at: raw.started_at,
            completed_at: raw.completed_at,
            progress: raw.progress,
            logs: raw.logs,
            result,
            error,
            chunk_count: raw.chunk_count,
            chunks_completed: raw.chunks_completed,
            revision: raw.revision,
        })
    }
}

/// Round and clamp a raw percentage into 0..=100.
pub fn clamp_percent(raw: f64) -> u8 {
    if raw.is_nan() {
        0
    } else {
        raw.round().clamp(0.0, 100.0) as u8
    }
}

fn de_percent<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(clamp_percent(f64::deserialize(deserializer)?))
}

pub(crate) fn de_opt_percent<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.map(clamp_percent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clip_spec() -> JobSpec {
        JobSpec::Clip(ClipConfig {
            video_path: PathBuf::from("/videos/match.mp4"),
            clipper: Some("yolo_pose".into()),
            options: Map::new(),
        })
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));

        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_parse() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("pending"), None);
    }

    #[test]
    fn test_clamp_percent() {
        assert_eq!(clamp_percent(-5.0), 0);
        assert_eq!(clamp_percent(39.6), 40);
        assert_eq!(clamp_percent(250.0), 100);
        assert_eq!(clamp_percent(f64::NAN), 0);
    }

    #[test]
    fn test_decode_snapshot() {
        let job = Job::from_json(json!({
            "id": "job-1",
            "type": "clip",
            "config": { "videoPath": "/videos/match.mp4", "clipper": "yolo_pose", "minDuration": 2.5 },
            "status": "completed",
            "createdAt": "2024-05-01T10:00:00Z",
            "startedAt": "2024-05-01T10:00:05Z",
            "completedAt": "2024-05-01T10:02:00Z",
            "progress": { "percent": 99.6, "phase": "clipping", "steps": [] },
            "logs": [
                { "timestamp": "2024-05-01T10:00:06Z", "level": "warn", "message": "low light" }
            ],
            "result": { "clips": [ { "start": 1.0, "end": 4.5, "path": "/out/c1.mp4" } ] }
        }))
        .unwrap();

        assert_eq!(job.kind(), JobKind::Clip);
        assert_eq!(job.progress.percent, 100);
        assert_eq!(job.logs[0].level, LogLevel::Warning);
        match &job.spec {
            JobSpec::Clip(config) => {
                assert_eq!(config.clipper.as_deref(), Some("yolo_pose"));
                assert_eq!(config.options["minDuration"], json!(2.5));
            }
            other => panic!("unexpected spec {:?}", other),
        }
        match job.result {
            Some(JobResult::Clip(result)) => assert_eq!(result.clips.len(), 1),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_decode_drops_result_before_completion() {
        let job = Job::from_json(json!({
            "id": "job-2",
            "type": "comparison",
            "config": { "videoPath": "/v.mp4", "models": ["movenet", "openpose"] },
            "status": "running",
            "createdAt": "2024-05-01T10:00:00Z",
            "result": { "models": [] },
            "error": { "message": "not yet" }
        }))
        .unwrap();

        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert_eq!(job.progress, JobProgress::default());
    }

    #[test]
    fn test_decode_rejects_mismatched_config() {
        let err = Job::from_json(json!({
            "id": "job-3",
            "type": "reclip",
            "config": { "videoPath": "/v.mp4" },
            "status": "queued",
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("reclip"));
    }

    #[test]
    fn test_serialize_flattens_spec() {
        let job = Job::new(clip_spec()).with_id("abc");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "clip");
        assert_eq!(value["config"]["videoPath"], "/videos/match.mp4");
        assert_eq!(value["status"], "queued");

        let back = Job::from_json(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_result_decode_uses_kind() {
        let value = json!({ "models": [ { "model": "movenet", "detections": 12 } ] });
        let result = JobResult::decode(JobKind::Comparison, value).unwrap();
        assert_eq!(result.kind(), JobKind::Comparison);
        assert!(JobResult::decode(JobKind::Clip, json!({ "clips": "nope" })).is_err());
    }
}
