//! Repository implementations for database operations.

mod job_repo;
mod metric_repo;

pub use job_repo::JobRepository;
pub use metric_repo::MetricRepository;
