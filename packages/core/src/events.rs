//! Event types for real-time updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, JobSnapshot, JobStatus};

/// Messages pushed to live subscribers of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Latest state of the job.
    Snapshot {
        job: Box<JobSnapshot>,
        timestamp: DateTime<Utc>,
    },
    /// The job's status changed.
    StatusChanged {
        job_id: JobId,
        old_status: JobStatus,
        new_status: JobStatus,
        timestamp: DateTime<Utc>,
    },
    /// The job reached a terminal state; no further events follow.
    Complete {
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn snapshot(job: JobSnapshot) -> Self {
        JobEvent::Snapshot {
            job: Box::new(job),
            timestamp: Utc::now(),
        }
    }

    pub fn complete(job_id: JobId, status: JobStatus, error: Option<String>) -> Self {
        JobEvent::Complete {
            job_id,
            status,
            error,
            timestamp: Utc::now(),
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::Snapshot { timestamp, .. } => *timestamp,
            JobEvent::StatusChanged { timestamp, .. } => *timestamp,
            JobEvent::Complete { timestamp, .. } => *timestamp,
        }
    }

    /// Get the job ID associated with this event.
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Snapshot { job, .. } => job.id,
            JobEvent::StatusChanged { job_id, .. } => *job_id,
            JobEvent::Complete { job_id, .. } => *job_id,
        }
    }

    /// Whether this is the last event of the stream.
    pub fn is_final(&self) -> bool {
        matches!(self, JobEvent::Complete { .. })
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::Snapshot { job, .. } => format!(
                "Job {} {} at step {} ({:.1}%)",
                job.id, job.status, job.progress.step, job.progress.progress_percent
            ),
            JobEvent::StatusChanged {
                job_id,
                old_status,
                new_status,
                ..
            } => format!("Job {} {} -> {}", job_id, old_status, new_status),
            JobEvent::Complete {
                job_id,
                status,
                error,
                ..
            } => match error {
                Some(error) => format!("Job {} {}: {}", job_id, status, error),
                None => format!("Job {} {}", job_id, status),
            },
        }
    }
}
