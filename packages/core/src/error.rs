//! Error and failure taxonomy shared by all packages.

use thiserror::Error;

use crate::job::JobStatus;

/// A submission rejected before it was queued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("owner id must not be empty")]
    MissingOwner,
    #[error("config must be a JSON object")]
    ConfigNotObject,
    #[error("config is {size} bytes, limit is {limit}")]
    ConfigTooLarge { size: usize, limit: usize },
    #[error("checkpoint {0} does not exist")]
    MissingCheckpoint(String),
}

/// An attempted status change that is not an edge of the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id}: invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Why a job ended up FAILED. The display form is what users see.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobFailure {
    #[error("failed to start worker: {0}")]
    Spawn(String),

    #[error("worker exited with code {code}{}", suffix(.detail))]
    ExitCode { code: i32, detail: Option<String> },

    #[error("worker killed by signal {signal}{}", suffix(.detail))]
    Signal { signal: i32, detail: Option<String> },

    #[error("no progress for {stale_secs}s, timeout is {timeout_secs}s")]
    Timeout { stale_secs: u64, timeout_secs: u64 },

    #[error("progress file unreadable after {attempts} attempts: {detail}")]
    CorruptProgressFile { attempts: u32, detail: String },

    #[error("worker reported failure: {0}")]
    Reported(String),

    #[error("worker process exited without reporting a result")]
    Lost,

    #[error("stale {status} record found at restart")]
    StaleAtRestart { status: JobStatus },
}

impl JobFailure {
    /// Whether the failure looks like the worker ran out of resources.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, JobFailure::Signal { signal: 9, .. })
    }
}

fn suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}
