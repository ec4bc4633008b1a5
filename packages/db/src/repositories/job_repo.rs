//! Job repository: snapshot upserts and status queries.

use chrono::SecondsFormat;
use queue_core::{JobId, JobSnapshot, JobStatus};
use serde::{Deserialize, Serialize};

use crate::{Database, DbError};

/// Repository for job persistence operations.
pub struct JobRepository;

/// Stored form of a job snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobDocument {
    job_id: String,
    owner_id: String,
    status: String,
    token: Option<String>,
    version: u64,
    created_at: String,
    updated_at: String,
    snapshot: String,
}

impl JobDocument {
    fn from_snapshot(snapshot: &JobSnapshot) -> Result<Self, DbError> {
        Ok(Self {
            job_id: snapshot.id.to_string(),
            owner_id: snapshot.owner_id.clone(),
            status: snapshot.status.as_str().to_string(),
            token: snapshot.token.clone(),
            version: snapshot.version,
            created_at: snapshot
                .created_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            updated_at: snapshot
                .updated_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            snapshot: serde_json::to_string(snapshot)?,
        })
    }

    fn into_snapshot(self) -> Result<JobSnapshot, DbError> {
        Ok(serde_json::from_str(&self.snapshot)?)
    }
}

#[derive(Debug, Deserialize)]
struct VersionRow {
    version: u64,
}

#[derive(Debug, Deserialize)]
struct TokenRow {
    token: Option<String>,
}

impl JobRepository {
    /// Insert or replace a job snapshot.
    ///
    /// A snapshot with a lower version than the stored one is ignored and
    /// `false` is returned.
    pub async fn upsert(db: &Database, snapshot: &JobSnapshot) -> Result<bool, DbError> {
        let job_id = snapshot.id.to_string();

        let mut result = db
            .query("SELECT version FROM type::thing('job', $id)")
            .bind(("id", job_id.clone()))
            .await?;
        let existing: Vec<VersionRow> = result.take(0)?;
        if let Some(row) = existing.first()
            && row.version > snapshot.version
        {
            tracing::debug!(
                "Ignoring stale snapshot for job {} (v{} < v{})",
                job_id,
                snapshot.version,
                row.version
            );
            return Ok(false);
        }

        let document = JobDocument::from_snapshot(snapshot)?;
        let _: Option<JobDocument> = db.upsert(("job", job_id)).content(document).await?;

        Ok(true)
    }

    /// Get a job snapshot by ID.
    pub async fn get(db: &Database, id: JobId) -> Result<Option<JobSnapshot>, DbError> {
        let record: Option<JobDocument> = db.select(("job", id.to_string())).await?;

        record.map(JobDocument::into_snapshot).transpose()
    }

    /// List jobs whose status is one of `statuses`, oldest first.
    pub async fn list_by_status(
        db: &Database,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobSnapshot>, DbError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        let mut result = db
            .query("SELECT * FROM job WHERE status IN $statuses ORDER BY created_at ASC")
            .bind(("statuses", statuses))
            .await?;

        let records: Vec<JobDocument> = result.take(0)?;

        records.into_iter().map(JobDocument::into_snapshot).collect()
    }

    /// Bearer token stored for a job, if the job exists.
    pub async fn token(db: &Database, id: JobId) -> Result<Option<String>, DbError> {
        let mut result = db
            .query("SELECT token FROM type::thing('job', $id)")
            .bind(("id", id.to_string()))
            .await?;
        let rows: Vec<TokenRow> = result.take(0)?;

        match rows.into_iter().next() {
            Some(row) => Ok(row.token),
            None => Err(DbError::NotFound(format!("Job not found: {}", id))),
        }
    }
}
