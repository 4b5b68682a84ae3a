use thiserror::Error;

/// Errors surfaced by the job tracker.
///
/// Only command failures reach callers. Events for unknown jobs and illegal
/// transitions are recovered inside the store and never show up here.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend rejected {operation} for job {job_id}: {reason}")]
    Rejected {
        operation: &'static str,
        job_id: String,
        reason: String,
    },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown event channel: {0}")]
    UnknownEvent(String),

    #[error("Event emission failed: {0}")]
    Event(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for TrackerError {
    fn from(err: anyhow::Error) -> Self {
        TrackerError::Other(err.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anyhow_converts_to_other() {
        let err: TrackerError = anyhow::anyhow!("transport closed").into();
        assert!(matches!(err, TrackerError::Other(ref msg) if msg == "transport closed"));
        assert_eq!(err.to_string(), "transport closed");
    }

    #[test]
    fn test_result_alias_propagates() {
        fn parse(raw: &str) -> Result<serde_json::Value> {
            Ok(serde_json::from_str(raw)?)
        }
        assert!(parse("{}").is_ok());
        assert!(matches!(parse("{"), Err(TrackerError::Serialization(_))));
    }
}
