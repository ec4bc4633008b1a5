//! Core domain types for the fine-tuning job orchestrator.
//!
//! This crate contains shared types used across all packages:
//! - JobRecord, JobSnapshot and the JobStatus state machine
//! - JobQueue, the FIFO of waiting jobs with arbitrary removal
//! - ProgressReport and MetricPoint, the worker's progress-file contract
//! - Events for real-time updates

mod error;
mod events;
mod job;
mod progress;
mod queue;

pub use error::{JobFailure, TransitionError, ValidationError};
pub use events::JobEvent;
pub use job::{JobId, JobRecord, JobSnapshot, JobStatus, Submission, generate_token};
pub use progress::{
    JobProgress, MetricPoint, ProgressMarker, ProgressReport, ResourceUsage, WorkerPhase,
};
pub use queue::{JobQueue, QueueEntry, QueueStats, QueueView, QueuedJob};
