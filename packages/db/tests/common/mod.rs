use chrono::Utc;
use db::{Database, DbConfig, DbError};
use queue_core::{JobRecord, JobSnapshot, JobStatus, Submission};
use serde_json::json;

/// A fresh in-memory database with the schema applied.
pub async fn setup_db() -> Result<Database, DbError> {
    db::init(DbConfig::memory()).await
}

pub fn snapshot(status: JobStatus) -> JobSnapshot {
    let mut record = JobRecord::new(Submission::new("owner-1", json!({ "lr": 0.001 })));
    record.status = status;
    record.updated_at = Utc::now();
    record.snapshot()
}
