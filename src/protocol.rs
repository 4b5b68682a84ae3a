//! Decoding of the line-oriented progress protocol that processing
//! backends write to stdout.
//!
//! ```text
//! [STEP] Splitting video into chunks...
//! [PROGRESS] {"phase": "chunking", "percent": 12, "current": 3, "total": 25}
//! [WARNING] low confidence on frame 812
//! [LOG] {"level": "error", "message": "decoder stalled"}
//! ```

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

use crate::events::{JobEvent, LogEntry, ProgressUpdate};
use crate::types::LogLevel;

const PROGRESS_TAG: &str = "[PROGRESS]";
const STEP_TAG: &str = "[STEP]";
const LOG_TAG: &str = "[LOG]";

/// Turn one output line from a backend process into an event for `job_id`.
///
/// Returns `None` for blank lines. Text that does not carry a known tag is
/// kept as an info log line, so nothing the backend prints is lost.
pub fn decode_line(job_id: &str, line: &str) -> Option<JobEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some(rest) = line.strip_prefix(PROGRESS_TAG) {
        return Some(match tagged_json::<ProgressUpdate>(job_id, rest) {
            Some(update) => JobEvent::Progress(update),
            None => {
                tracing::debug!(job_id = %job_id, "Malformed progress line kept as log");
                log_event(job_id, LogLevel::Info, line)
            }
        });
    }

    if let Some(rest) = line.strip_prefix(STEP_TAG) {
        let step = rest.trim();
        if step.is_empty() {
            return None;
        }
        return Some(JobEvent::Progress(ProgressUpdate {
            job_id: job_id.to_string(),
            step: Some(step.to_string()),
            ..Default::default()
        }));
    }

    if let Some(rest) = line.strip_prefix(LOG_TAG) {
        return Some(match tagged_json::<LogEntry>(job_id, rest) {
            Some(entry) => JobEvent::Log(entry),
            None => log_event(job_id, LogLevel::Info, rest.trim()),
        });
    }

    if let Some((level, rest)) = level_tag(line) {
        let message = json_message(rest).unwrap_or_else(|| rest.to_string());
        return Some(log_event(job_id, level, &message));
    }

    Some(log_event(job_id, LogLevel::Info, line))
}

/// Read lines from a backend's output until EOF and forward the decoded
/// events. Returns the number of events sent.
///
/// Stops early, without error, if the receiving side has gone away.
pub async fn pump_lines<R>(
    job_id: &str,
    reader: R,
    events: &mpsc::Sender<JobEvent>,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut sent = 0;

    while let Some(line) = lines.next_line().await? {
        let Some(event) = decode_line(job_id, &line) else {
            continue;
        };
        if events.send(event).await.is_err() {
            tracing::debug!(job_id = %job_id, "Event receiver closed, stopped reading backend output");
            break;
        }
        sent += 1;
    }

    Ok(sent)
}

/// `[INFO] text`, `[WARNING] text`, `[ERROR] text`, `[DEBUG] text`.
fn level_tag(line: &str) -> Option<(LogLevel, &str)> {
    let rest = line.strip_prefix('[')?;
    let (tag, rest) = rest.split_once(']')?;
    let level = LogLevel::parse(tag)?;
    Some((level, rest.trim()))
}

/// Parse the JSON body of a tagged line, filling in the job ID.
fn tagged_json<T>(job_id: &str, body: &str) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    let mut object: Map<String, Value> = serde_json::from_str(body.trim()).ok()?;
    object.insert("jobId".into(), Value::String(job_id.to_string()));
    serde_json::from_value(Value::Object(object)).ok()
}

fn json_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    match value.get("message")? {
        Value::String(message) => Some(message.clone()),
        _ => None,
    }
}

fn log_event(job_id: &str, level: LogLevel, message: &str) -> JobEvent {
    JobEvent::Log(LogEntry {
        job_id: job_id.to_string(),
        timestamp: None,
        level,
        message: message.to_string(),
    })
}
