//! Message types for actor communication.

use std::path::PathBuf;

use queue_core::{
    JobFailure, JobId, JobRecord, JobSnapshot, JobStatus, MetricPoint, ProgressReport, QueueView,
    Submission, TransitionError, ValidationError,
};
use ractor::RpcReplyPort;
use serde::{Deserialize, Serialize};

use crate::process::WorkerProcess;

/// Returned to the submitter of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    /// 1-based position in the queue.
    pub queue_position: usize,
}

/// Why a monitor is asked to stop its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Cancel,
    Pause,
}

/// How a monitored run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Failed(JobFailure),
    Cancelled,
    Paused,
}

/// Messages for the Orchestrator.
#[derive(Debug)]
pub enum OrchestratorMessage {
    /// Accept a new job.
    Submit {
        submission: Submission,
        reply: RpcReplyPort<Result<SubmitReceipt, ActorError>>,
    },

    /// Public snapshot of a job.
    GetJob {
        job_id: JobId,
        reply: RpcReplyPort<Option<JobSnapshot>>,
    },

    /// Metric history held in memory, `None` if the job is not loaded.
    GetMetrics {
        job_id: JobId,
        reply: RpcReplyPort<Option<Vec<MetricPoint>>>,
    },

    /// Waiting jobs and the active one.
    ListQueue { reply: RpcReplyPort<QueueView> },

    /// Cancel a job. Replies with the status the job had.
    Cancel {
        job_id: JobId,
        reply: RpcReplyPort<Result<JobStatus, ActorError>>,
    },

    /// Pause a running job.
    Pause {
        job_id: JobId,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },

    /// Re-queue a paused job from a checkpoint.
    Resume {
        job_id: JobId,
        checkpoint: Option<PathBuf>,
        reply: RpcReplyPort<Result<SubmitReceipt, ActorError>>,
    },

    /// Launch a queued job now, or relaunch a stuck pending one.
    ForceStart {
        job_id: JobId,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },

    /// Request the next job for the dispatcher.
    ///
    /// Replies `None` while a job holds the accelerator.
    RequestJob { reply: RpcReplyPort<Option<JobRecord>> },

    /// A worker process was started for a pending job.
    Started {
        job_id: JobId,
        execution_id: String,
        process: WorkerProcess,
    },

    /// Starting the worker failed.
    SpawnFailed { job_id: JobId, error: String },

    /// A worker started for a job that no longer wanted it has been stopped.
    Discarded { job_id: JobId },

    /// Progress read by a job's monitor.
    Progress {
        job_id: JobId,
        seq: u64,
        report: Box<ProgressReport>,
    },

    /// A job's monitor finished.
    Finished {
        job_id: JobId,
        seq: u64,
        outcome: JobOutcome,
    },

    /// Adopt a worker that survived a restart.
    Attach {
        record: Box<JobRecord>,
        pid: u32,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },

    /// Load a record found at restart; queued records are enqueued.
    Restore {
        record: Box<JobRecord>,
        reply: RpcReplyPort<Option<usize>>,
    },

    /// Periodic check for workers the monitors missed.
    HealthCheck,

    /// Periodic eviction of old jobs and artifacts.
    Cleanup,

    /// Stop accepting work, detach monitors and flush persistence.
    Shutdown { reply: RpcReplyPort<()> },
}

/// Messages for a job's progress monitor.
#[derive(Debug)]
pub enum MonitorMessage {
    /// Poll tick.
    Poll,

    /// Stop the worker and finish.
    Stop { kind: StopKind },

    /// Stop monitoring and leave the worker running.
    Detach,
}

/// Messages for the Dispatcher.
#[derive(Debug)]
pub enum DispatcherMessage {
    /// Dispatch tick.
    Tick,

    /// Stop dispatching.
    Shutdown,
}

/// Result type for internal operations.
pub type ActorResult<T> = Result<T, ActorError>;

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Accelerator busy with job {0}")]
    ResourceBusy(JobId),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Process error: {0}")]
    Process(String),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Timeout")]
    Timeout,
}
