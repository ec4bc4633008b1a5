#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;

use queue_core::{JobId, JobStatus, MetricPoint};

use db::DbError;
use db::repositories::{JobRepository, MetricRepository};

#[tokio::test]
async fn test_job_snapshots() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;

    // upsert + get
    let mut job = common::snapshot(JobStatus::Queued);
    assert!(JobRepository::upsert(&db, &job).await?);
    let loaded = JobRepository::get(&db, job.id).await?.expect("job stored");
    assert_eq!(loaded, job);

    // newer version replaces
    job.status = JobStatus::Running;
    job.version += 1;
    assert!(JobRepository::upsert(&db, &job).await?);
    let loaded = JobRepository::get(&db, job.id).await?.expect("job stored");
    assert_eq!(loaded.status, JobStatus::Running);

    // older version is ignored
    let mut stale = job.clone();
    stale.status = JobStatus::Queued;
    stale.version -= 1;
    assert!(!JobRepository::upsert(&db, &stale).await?);
    let loaded = JobRepository::get(&db, job.id).await?.expect("job stored");
    assert_eq!(loaded.status, JobStatus::Running);

    // missing
    assert!(JobRepository::get(&db, JobId::new()).await?.is_none());

    // list by status
    let queued = common::snapshot(JobStatus::Queued);
    let failed = common::snapshot(JobStatus::Failed);
    JobRepository::upsert(&db, &queued).await?;
    JobRepository::upsert(&db, &failed).await?;

    let active =
        JobRepository::list_by_status(&db, &[JobStatus::Queued, JobStatus::Running]).await?;
    let ids: Vec<JobId> = active.iter().map(|s| s.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&job.id));
    assert!(ids.contains(&queued.id));
    assert!(!ids.contains(&failed.id));

    Ok(())
}

#[tokio::test]
async fn test_metric_merge_is_idempotent() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let job = common::snapshot(JobStatus::Running);
    JobRepository::upsert(&db, &job).await?;
    let token = job.token.clone().expect("durable snapshot carries token");

    MetricRepository::merge_batch(
        &db,
        job.id,
        &token,
        &[MetricPoint::new(1000).with_train_loss(0.75)],
    )
    .await?;
    MetricRepository::merge_batch(
        &db,
        job.id,
        &token,
        &[MetricPoint::new(1000).with_eval_loss(0.9)],
    )
    .await?;

    // resending the first batch changes nothing
    MetricRepository::merge_batch(
        &db,
        job.id,
        &token,
        &[MetricPoint::new(1000).with_train_loss(0.75)],
    )
    .await?;

    let points = MetricRepository::list(&db, job.id).await?;
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].step, 1000);
    assert_eq!(points[0].train_loss, Some(0.75));
    assert_eq!(points[0].eval_loss, Some(0.9));
    assert!(points[0].extra.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_metrics_require_job_token() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let job = common::snapshot(JobStatus::Running);
    JobRepository::upsert(&db, &job).await?;

    let result =
        MetricRepository::merge_batch(&db, job.id, "not-the-token", &[MetricPoint::new(1)]).await;
    assert!(matches!(result, Err(DbError::Unauthorized(_))));

    let unknown = MetricRepository::merge_batch(&db, JobId::new(), "x", &[MetricPoint::new(1)]).await;
    assert!(matches!(unknown, Err(DbError::NotFound(_))));

    assert!(MetricRepository::list(&db, job.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_metrics_are_ordered_by_step() -> Result<(), Box<dyn Error>> {
    let db = common::setup_db().await?;
    let job = common::snapshot(JobStatus::Running);
    JobRepository::upsert(&db, &job).await?;
    let token = job.token.clone().expect("token");

    let batch = [
        MetricPoint::new(30).with_train_loss(0.3),
        MetricPoint::new(10).with_train_loss(0.1),
        MetricPoint::new(20).with_train_loss(0.2),
    ];
    MetricRepository::merge_batch(&db, job.id, &token, &batch).await?;

    let steps: Vec<u64> = MetricRepository::list(&db, job.id)
        .await?
        .iter()
        .map(|p| p.step)
        .collect();
    assert_eq!(steps, vec![10, 20, 30]);
    Ok(())
}
