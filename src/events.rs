use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TrackerError};
use crate::types::{de_opt_percent, JobError, JobId, JobStatus, LogLevel};

pub const PROGRESS_CHANNEL: &str = "job-progress";
pub const LOG_CHANNEL: &str = "job-log";
pub const CHUNK_COMPLETE_CHANNEL: &str = "job-chunk-complete";
pub const COMPLETE_CHANNEL: &str = "job-complete";
pub const ERROR_CHANNEL: &str = "job-error";
pub const STATUS_CHANGE_CHANNEL: &str = "job-status-change";

/// Partial progress report. Only the fields that are set get merged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub job_id: JobId,
    #[serde(
        default,
        deserialize_with = "de_opt_percent",
        skip_serializing_if = "Option::is_none"
    )]
    pub percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, alias = "current", alias = "frame", skip_serializing_if = "Option::is_none")]
    pub current_frame: Option<u64>,
    #[serde(default, alias = "total", skip_serializing_if = "Option::is_none")]
    pub total_frames: Option<u64>,
    /// A processing step to append to the job's step list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// One log line. A missing timestamp is filled in when the entry is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkComplete {
    pub job_id: JobId,
    pub chunk_count: u32,
    pub chunks_completed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The job finished. `result` is still raw; it is decoded against the
/// target job's kind when applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompleted {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailed {
    pub job_id: JobId,
    pub error: JobError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanged {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A push event from the backend, correlated by job ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum JobEvent {
    Progress(ProgressUpdate),
    Log(LogEntry),
    ChunkComplete(ChunkComplete),
    Complete(JobCompleted),
    Error(JobFailed),
    StatusChange(StatusChanged),
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Progress(e) => &e.job_id,
            JobEvent::Log(e) => &e.job_id,
            JobEvent::ChunkComplete(e) => &e.job_id,
            JobEvent::Complete(e) => &e.job_id,
            JobEvent::Error(e) => &e.job_id,
            JobEvent::StatusChange(e) => &e.job_id,
        }
    }

    /// The channel name this event travels on.
    pub fn channel(&self) -> &'static str {
        match self {
            JobEvent::Progress(_) => PROGRESS_CHANNEL,
            JobEvent::Log(_) => LOG_CHANNEL,
            JobEvent::ChunkComplete(_) => CHUNK_COMPLETE_CHANNEL,
            JobEvent::Complete(_) => COMPLETE_CHANNEL,
            JobEvent::Error(_) => ERROR_CHANNEL,
            JobEvent::StatusChange(_) => STATUS_CHANGE_CHANNEL,
        }
    }

    /// Decode a payload received on a named backend channel.
    pub fn decode(channel: &str, payload: Value) -> Result<Self> {
        Ok(match channel {
            PROGRESS_CHANNEL => JobEvent::Progress(serde_json::from_value(payload)?),
            LOG_CHANNEL => JobEvent::Log(serde_json::from_value(payload)?),
            CHUNK_COMPLETE_CHANNEL => JobEvent::ChunkComplete(serde_json::from_value(payload)?),
            COMPLETE_CHANNEL => JobEvent::Complete(serde_json::from_value(payload)?),
            ERROR_CHANNEL => JobEvent::Error(serde_json::from_value(payload)?),
            STATUS_CHANGE_CHANNEL => JobEvent::StatusChange(serde_json::from_value(payload)?),
            other => return Err(TrackerError::UnknownEvent(other.to_string())),
        })
    }

    /// Whether applying this event would move the job into a terminal state.
    pub fn is_terminal(&self) -> bool {
        match self {
            JobEvent::Complete(_) | JobEvent::Error(_) => true,
            JobEvent::StatusChange(e) => e.status.is_terminal(),
            _ => false,
        }
    }
}
