//! Client-facing API of the fine-tuning orchestrator.
//!
//! This crate wires the actor system together and exposes:
//! - Job management (submit, status, cancel, pause, resume, force start)
//! - Queue inspection
//! - Worker logs (offset reads and streaming)
//! - Real-time events (per-job subscriptions and SSE formatting)

mod error;
mod init;
mod jobs;
mod logs;
mod realtime;

pub use error::ApiError;
pub use init::*;
pub use jobs::*;
pub use logs::{LogChunk, read_log_chunk};
pub use realtime::*;

// Re-export core types for convenience
pub use actors::{OrchestratorConfig, StoreConfig, SubmitReceipt};
pub use queue_core::{
    JobEvent, JobId, JobSnapshot, JobStatus, MetricPoint, QueueStats, QueueView, QueuedJob,
};
