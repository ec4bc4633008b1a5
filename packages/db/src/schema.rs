//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// This creates all necessary tables and indexes.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(METRIC_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema.
///
/// The snapshot itself is stored as JSON text; the other fields are copies
/// used for filtering and ordering.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_status ON job FIELDS status;
DEFINE INDEX IF NOT EXISTS job_owner ON job FIELDS owner_id;
DEFINE INDEX IF NOT EXISTS job_created ON job FIELDS created_at;
"#;

/// Metric table schema. One record per (job, step).
const METRIC_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS metric SCHEMALESS;

DEFINE INDEX IF NOT EXISTS metric_job_step ON metric FIELDS job_id, step UNIQUE;
"#;
