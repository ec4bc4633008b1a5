//! Metric repository: idempotent merge of metric points by step.

use queue_core::{JobId, MetricPoint};
use serde_json::Value;

use crate::repositories::JobRepository;
use crate::{Database, DbError};

/// Repository for metric points.
pub struct MetricRepository;

impl MetricRepository {
    /// Merge a batch of metric points for a job.
    ///
    /// Each point is keyed by `(job, step)`; only its non-null fields are
    /// written, so a later point for the same step fills in fields rather
    /// than replacing the record. The batch is rejected unless `token`
    /// matches the job's bearer token.
    pub async fn merge_batch(
        db: &Database,
        job_id: JobId,
        token: &str,
        batch: &[MetricPoint],
    ) -> Result<usize, DbError> {
        match JobRepository::token(db, job_id).await? {
            Some(expected) if expected == token => {}
            _ => {
                return Err(DbError::Unauthorized(format!(
                    "invalid metrics token for job {}",
                    job_id
                )));
            }
        }

        for point in batch {
            let mut patch = point.to_patch();
            patch.insert("job_id".to_string(), Value::String(job_id.to_string()));

            db.query("UPSERT type::thing('metric', $key) MERGE $patch RETURN NONE")
                .bind(("key", format!("{}_{}", job_id, point.step)))
                .bind(("patch", Value::Object(patch)))
                .await?
                .check()?;
        }

        tracing::debug!("Merged {} metric points for job {}", batch.len(), job_id);
        Ok(batch.len())
    }

    /// All metric points of a job ordered by step.
    pub async fn list(db: &Database, job_id: JobId) -> Result<Vec<MetricPoint>, DbError> {
        let mut result = db
            .query("SELECT * OMIT id FROM metric WHERE job_id = $job_id ORDER BY step ASC")
            .bind(("job_id", job_id.to_string()))
            .await?;

        let mut points: Vec<MetricPoint> = result.take(0)?;
        for point in &mut points {
            point.extra.remove("job_id");
        }

        Ok(points)
    }
}
