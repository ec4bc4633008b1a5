//! Job domain types: identity, status state machine and the live record.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{JobFailure, TransitionError, ValidationError};
use crate::progress::{JobProgress, MetricPoint, ProgressReport};

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generate a per-job bearer token (32 random bytes, hex encoded).
pub fn generate_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in the queue.
    #[default]
    Queued,
    /// Job was dequeued and its worker is being spawned.
    Pending,
    /// Worker process is alive and reporting progress.
    Running,
    /// Worker was stopped after saving a checkpoint; can be resumed.
    Paused,
    /// Worker exited with code 0.
    Completed,
    /// Spawn error, nonzero exit, timeout or corrupt progress file.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if the job holds the compute resource.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether `self -> next` is an edge of the job state machine.
    ///
    /// `Queued -> Failed` is only taken by restart recovery, for durable
    /// records that sat in the queue past the recovery threshold.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Pending)
                | (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Pending, Cancelled)
                | (Queued, Cancelled)
                | (Paused, Queued)
                | (Queued, Failed)
        )
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown job status: {s}"))
    }
}

/// A job submission as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Owner of the job.
    pub owner_id: String,
    /// Opaque training configuration forwarded to the worker.
    pub config: serde_json::Value,
}

impl Submission {
    /// Largest serialized config accepted.
    pub const MAX_CONFIG_BYTES: usize = 1024 * 1024;

    pub fn new(owner_id: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            owner_id: owner_id.into(),
            config,
        }
    }

    /// Structural checks only; the config contents are never interpreted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.owner_id.trim().is_empty() {
            return Err(ValidationError::MissingOwner);
        }
        if !self.config.is_object() {
            return Err(ValidationError::ConfigNotObject);
        }
        let size = serde_json::to_vec(&self.config)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        if size > Self::MAX_CONFIG_BYTES {
            return Err(ValidationError::ConfigTooLarge {
                size,
                limit: Self::MAX_CONFIG_BYTES,
            });
        }
        Ok(())
    }
}

/// Durable and broadcastable view of a job.
///
/// This is the payload upserted into the remote store and pushed to live
/// subscribers. The bearer token is only present in the durable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_checkpoint: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic per-job sequence number; higher always wins.
    #[serde(default)]
    pub version: u64,
}

/// The live, in-memory state of one orchestrated job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Owner that submitted the job.
    pub owner_id: String,
    /// Bearer token the worker uses to submit metrics.
    pub token: String,
    /// Current status.
    pub status: JobStatus,
    /// 1-based position in the queue while queued.
    pub queue_position: Option<usize>,
    /// Latest progress copied from the worker's progress file.
    pub progress: JobProgress,
    /// Metric points reported so far, ordered by step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics_history: Vec<MetricPoint>,
    /// Opaque training configuration.
    pub config: serde_json::Value,
    /// Checkpoint the next run resumes from.
    pub resume_checkpoint: Option<PathBuf>,
    /// OS process id of the worker, if one is alive.
    pub pid: Option<u32>,
    /// Identifier of the current execution attempt.
    pub execution_id: Option<String>,
    /// Most specific known failure cause.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every accepted mutation.
    pub version: u64,
    /// Last monitor sequence number applied to this record.
    #[serde(skip)]
    pub monitor_seq: u64,
}

impl JobRecord {
    /// Create a new queued job from a validated submission.
    pub fn new(submission: Submission) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            owner_id: submission.owner_id,
            token: generate_token(),
            status: JobStatus::Queued,
            queue_position: None,
            progress: JobProgress::default(),
            metrics_history: Vec::new(),
            config: submission.config,
            resume_checkpoint: None,
            pid: None,
            execution_id: None,
            error: None,
            created_at: now,
            started_at: None,
            paused_at: None,
            completed_at: None,
            updated_at: now,
            version: 1,
            monitor_seq: 0,
        }
    }

    /// Rebuild a record from a durable snapshot.
    ///
    /// Snapshots without a token (public views) get a fresh one.
    pub fn from_snapshot(snapshot: JobSnapshot) -> Self {
        Self {
            id: snapshot.id,
            owner_id: snapshot.owner_id,
            token: snapshot.token.unwrap_or_else(generate_token),
            status: snapshot.status,
            queue_position: snapshot.queue_position,
            progress: snapshot.progress,
            metrics_history: Vec::new(),
            config: snapshot.config,
            resume_checkpoint: snapshot.resume_checkpoint,
            pid: snapshot.pid,
            execution_id: snapshot.execution_id,
            error: snapshot.error,
            created_at: snapshot.created_at,
            started_at: snapshot.started_at,
            paused_at: snapshot.paused_at,
            completed_at: snapshot.completed_at,
            updated_at: snapshot.updated_at,
            version: snapshot.version,
            monitor_seq: 0,
        }
    }

    /// Durable snapshot, including the bearer token.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            owner_id: self.owner_id.clone(),
            token: Some(self.token.clone()),
            status: self.status,
            queue_position: self.queue_position,
            progress: self.progress.clone(),
            config: self.config.clone(),
            resume_checkpoint: self.resume_checkpoint.clone(),
            pid: self.pid,
            execution_id: self.execution_id.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            paused_at: self.paused_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }

    /// Snapshot safe to hand to observers: no token, no config.
    pub fn public_snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            token: None,
            config: serde_json::Value::Null,
            ..self.snapshot()
        }
    }

    /// Move to `next`, stamping the matching timestamp.
    ///
    /// Returns the previous status, or an error if the edge does not exist.
    pub fn transition(&mut self, next: JobStatus) -> Result<JobStatus, TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                job_id: self.id.to_string(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        let previous = self.status;
        self.status = next;
        match next {
            JobStatus::Running => {
                self.started_at = Some(now);
                self.error = None;
            }
            JobStatus::Paused => self.paused_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            JobStatus::Queued | JobStatus::Pending => {}
        }
        if next != JobStatus::Queued {
            self.queue_position = None;
        }
        if !next.is_active() {
            self.pid = None;
        }
        self.touch();
        Ok(previous)
    }

    /// Transition to FAILED and record the cause.
    pub fn fail(&mut self, failure: &JobFailure) -> Result<JobStatus, TransitionError> {
        let previous = self.transition(JobStatus::Failed)?;
        self.error = Some(failure.to_string());
        Ok(previous)
    }

    /// Copy progress fields from a parsed progress file.
    pub fn apply_progress(&mut self, report: &ProgressReport) {
        report.copy_into(&mut self.progress);
        MetricPoint::merge_batch(&mut self.metrics_history, &report.metrics_history);
        self.touch();
    }

    /// Mark the record as changed.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> JobRecord {
        JobRecord::new(Submission::new("owner-1", json!({ "model": "tiny" })))
    }

    #[test]
    fn only_listed_edges_are_valid() {
        use JobStatus::*;
        let valid = [
            (Queued, Pending),
            (Pending, Running),
            (Pending, Failed),
            (Running, Completed),
            (Running, Failed),
            (Running, Paused),
            (Running, Cancelled),
            (Pending, Cancelled),
            (Queued, Cancelled),
            (Paused, Queued),
            (Queued, Failed),
        ];
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    valid.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for status in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            assert!(JobStatus::ALL.iter().all(|next| !status.can_transition_to(*next)));
        }
    }

    #[test]
    fn pausing_a_completed_job_is_rejected() {
        let mut job = record();
        job.transition(JobStatus::Pending).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        let version = job.version;

        let err = job.transition(JobStatus::Paused).unwrap_err();
        assert_eq!(err.from, JobStatus::Completed);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.version, version);
    }

    #[test]
    fn transitions_stamp_timestamps_and_bump_version() {
        let mut job = record();
        let v0 = job.version;
        job.queue_position = Some(3);
        job.transition(JobStatus::Pending).unwrap();
        assert_eq!(job.queue_position, None);
        job.pid = Some(42);
        job.transition(JobStatus::Running).unwrap();
        assert!(job.started_at.is_some());
        assert_eq!(job.pid, Some(42));
        job.fail(&JobFailure::ExitCode { code: 3, detail: None }).unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(job.pid, None);
        assert_eq!(job.error.as_deref(), Some("worker exited with code 3"));
        assert_eq!(job.version, v0 + 3);
    }

    #[test]
    fn public_snapshot_hides_secrets() {
        let job = record();
        let public = job.public_snapshot();
        assert!(public.token.is_none());
        assert!(public.config.is_null());
        assert_eq!(job.snapshot().token.as_deref(), Some(job.token.as_str()));
    }

    #[test]
    fn snapshot_round_trips_into_record() {
        let job = record();
        let restored = JobRecord::from_snapshot(job.snapshot());
        assert_eq!(restored.token, job.token);
        assert_eq!(restored.version, job.version);
        assert_eq!(restored.config, job.config);
    }

    #[test]
    fn submission_validation() {
        assert!(Submission::new("a", json!({})).validate().is_ok());
        assert!(matches!(
            Submission::new("  ", json!({})).validate(),
            Err(ValidationError::MissingOwner)
        ));
        assert!(matches!(
            Submission::new("a", json!([1, 2])).validate(),
            Err(ValidationError::ConfigNotObject)
        ));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("RUNNING".parse::<JobStatus>(), Ok(JobStatus::Running));
        assert!("sleeping".parse::<JobStatus>().is_err());
    }

    #[test]
    fn tokens_are_unique_hex() {
        let a = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, generate_token());
    }
}
