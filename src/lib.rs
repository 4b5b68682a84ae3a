//! # Job Sync
//!
//! Client-side job lifecycle tracking for desktop front-ends that drive a
//! long-running processing backend (video clipping, model comparison).
//!
//! ## Features
//!
//! - One store of job records, updated only through a single reducer
//! - Push events and polled snapshots merged without regressing state
//! - Terminal states that stick, whatever order updates arrive in
//! - Adaptive polling that runs only while jobs are queued or running
//! - Buffering of events that arrive before their job is known
//! - Optional forwarding of store changes to a Tauri webview (`tauri` feature)
//!
//! ## Quick Start
//!
//! 1. Implement [`JobBackend`] over your transport
//! 2. Create a [`JobStore`] with a [`TrackerConfig`]
//! 3. Feed push events with [`event_channel()`] and [`JobStore::subscribe()`]
//! 4. Spawn the poller with [`JobStore::spawn_reconciler()`]
//!
//! See the `demos/` directory for complete usage examples.

pub mod backend;
#[cfg(feature = "tauri")]
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod merge;
pub mod protocol;
pub mod reconciler;
pub mod reducer;
pub mod stats;
pub mod store;
pub mod subscription;
pub mod types;

pub use backend::{JobBackend, JobFilter};
pub use config::{TrackerConfig, TrackerConfigBuilder};
pub use error::TrackerError;
pub use events::{
    ChunkComplete, JobCompleted, JobEvent, JobFailed, LogEntry, ProgressUpdate, StatusChanged,
};
pub use protocol::{decode_line, pump_lines};
pub use reconciler::ReconcilerHandle;
pub use reducer::{StoreChange, StoreMessage};
pub use stats::JobStatistics;
pub use store::{JobStore, StoreView};
pub use subscription::{event_channel, EventSubscription};
pub use types::{
    ClipConfig, ClipResult, ClipSegment, ComparisonConfig, ComparisonResult, Job, JobError,
    JobId, JobKind, JobLog, JobProgress, JobResult, JobSpec, JobStatus, LogLevel, ModelReport,
    ProgressStep, ReclipConfig,
};
