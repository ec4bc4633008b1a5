//! The FIFO of waiting jobs.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobStatus};

/// A queued job id plus its insertion sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub seq: u64,
}

/// FIFO queue of job ids that also supports removing an arbitrary entry.
///
/// Positions are 1-based: position 1 is the next job to run.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job, returning its position. Enqueuing a job that is
    /// already queued leaves it where it is.
    pub fn enqueue(&mut self, job_id: JobId) -> usize {
        if let Some(position) = self.position(job_id) {
            return position;
        }
        self.next_seq += 1;
        self.entries.push_back(QueueEntry {
            job_id,
            seq: self.next_seq,
        });
        self.entries.len()
    }

    /// Pop the oldest entry.
    pub fn dequeue(&mut self) -> Option<JobId> {
        self.entries.pop_front().map(|entry| entry.job_id)
    }

    /// Remove `job_id` wherever it sits, preserving the order of the rest.
    ///
    /// Drains the queue and re-pushes every other entry.
    pub fn remove(&mut self, job_id: JobId) -> bool {
        let before = self.entries.len();
        let drained: Vec<QueueEntry> = self.entries.drain(..).collect();
        for entry in drained {
            if entry.job_id != job_id {
                self.entries.push_back(entry);
            }
        }
        self.entries.len() != before
    }

    pub fn position(&self, job_id: JobId) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.job_id == job_id)
            .map(|index| index + 1)
    }

    /// Every queued job with its current position.
    pub fn positions(&self) -> impl Iterator<Item = (JobId, usize)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.job_id, index + 1))
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.entries.iter().any(|entry| entry.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counts of jobs per status held in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    pub queued: u64,
    pub pending: u64,
    pub running: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl QueueStats {
    pub fn record(&mut self, status: JobStatus) {
        let counter = match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Paused => &mut self.paused,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *counter += 1;
    }
}

/// One line of the queue listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub owner_id: String,
    pub position: usize,
    pub created_at: DateTime<Utc>,
}

/// The queue as shown to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueView {
    /// Job currently holding the accelerator, if any.
    pub active: Option<JobId>,
    pub entries: Vec<QueuedJob>,
    pub stats: QueueStats,
}
