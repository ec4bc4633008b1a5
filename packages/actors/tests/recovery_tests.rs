#![allow(clippy::disallowed_methods)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use actors::{OrchestratorMessage, ProcessSupervisor, Services, process};
use chrono::Utc;
use common::*;
use queue_core::{JobRecord, JobStatus, Submission};
use serde_json::json;

fn record(status: JobStatus, age: chrono::Duration) -> JobRecord {
    let mut record = JobRecord::new(Submission::new("owner-1", json!({ "model": "tiny" })));
    record.status = status;
    record.created_at = Utc::now() - age;
    record.updated_at = Utc::now() - age;
    record
}

#[tokio::test]
async fn test_fresh_running_worker_is_reattached() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), RUNNING_WORKER);
    let store = FakeStore::new();

    // A worker left behind by a previous orchestrator.
    let mut job = record(JobStatus::Running, chrono::Duration::seconds(5));
    job.execution_id = Some("exec-old".into());
    let worker = ProcessSupervisor::from_config(&config)
        .spawn(&job, "exec-old")
        .await
        .unwrap();
    let pid = worker.pid;
    drop(worker);
    job.pid = Some(pid);
    store.insert(job.snapshot());

    let services = Arc::new(Services::new(config.clone(), store.clone()));
    let paths = services.layout.job(job.id);
    eventually(|| paths.progress.exists()).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (orchestrator, _) = actors::start_orchestrator(services.clone()).await.unwrap();
    let report = actors::recover(&services, &orchestrator).await;
    assert_eq!(report.reattached, 1);
    assert_eq!(report.orphans_killed, 0);

    let recovered = get_job(&orchestrator, job.id).await;
    assert_eq!(recovered.status, JobStatus::Running);
    assert_eq!(recovered.pid, Some(pid));
    assert!(recovered.progress.step > 0, "last known progress is kept");
    assert!(process::is_alive(pid), "the worker was not restarted");

    // The adopted worker can still be cancelled.
    let _ = ask(&orchestrator, |reply| OrchestratorMessage::Cancel {
        job_id: job.id,
        reply,
    })
    .await
    .unwrap();
    wait_for(&orchestrator, job.id, JobStatus::Cancelled).await;
    assert!(!process::is_alive(pid));
}

#[tokio::test]
async fn test_unmatched_worker_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), RUNNING_WORKER);
    let store = FakeStore::new();

    // Running worker whose job the store does not know.
    let job = record(JobStatus::Running, chrono::Duration::seconds(5));
    let worker = ProcessSupervisor::from_config(&config)
        .spawn(&job, "exec-old")
        .await
        .unwrap();
    let pid = worker.pid;
    drop(worker);

    let services = Arc::new(Services::new(config, store));
    let paths = services.layout.job(job.id);
    eventually(|| paths.progress.exists()).await;

    let (orchestrator, _) = actors::start_orchestrator(services.clone()).await.unwrap();
    let report = actors::recover(&services, &orchestrator).await;
    assert_eq!(report.reattached, 0);
    assert_eq!(report.orphans_killed, 1);
    eventually(|| !process::is_alive(pid)).await;
}

#[tokio::test]
async fn test_stale_records_are_failed() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), RUNNING_WORKER);
    let store = FakeStore::new();

    let stale_queued = record(JobStatus::Queued, chrono::Duration::hours(2));
    let older_fresh = record(JobStatus::Queued, chrono::Duration::seconds(30));
    let newer_fresh = record(JobStatus::Queued, chrono::Duration::seconds(10));
    let mut lost = record(JobStatus::Running, chrono::Duration::seconds(10));
    lost.pid = Some(i32::MAX as u32);
    let done = record(JobStatus::Completed, chrono::Duration::hours(2));
    for job in [&stale_queued, &newer_fresh, &older_fresh, &lost, &done] {
        store.insert(job.snapshot());
    }

    let services = Arc::new(Services::new(config, store.clone()));
    let (orchestrator, _) = actors::start_orchestrator(services.clone()).await.unwrap();
    let report = actors::recover(&services, &orchestrator).await;
    assert_eq!(report.requeued, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(report.reattached, 0);

    let failed = get_job(&orchestrator, stale_queued.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("stale"));
    assert_eq!(get_job(&orchestrator, lost.id).await.status, JobStatus::Failed);

    // Fresh queued jobs keep their creation order.
    let view = ask(&orchestrator, |reply| OrchestratorMessage::ListQueue { reply }).await;
    let queued: Vec<_> = view.entries.iter().map(|e| (e.job_id, e.position)).collect();
    assert_eq!(queued, vec![(older_fresh.id, 1), (newer_fresh.id, 2)]);

    // Completed records are left alone.
    let missing = ask(&orchestrator, |reply| OrchestratorMessage::GetJob {
        job_id: done.id,
        reply,
    })
    .await;
    assert!(missing.is_none());

    eventually(|| {
        store
            .job(stale_queued.id)
            .is_some_and(|job| job.status == JobStatus::Failed)
    })
    .await;
}

#[tokio::test]
async fn test_paused_job_can_be_resumed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), RUNNING_WORKER);
    config.artifact_retention = Duration::ZERO;
    let store = FakeStore::new();

    let mut paused = record(JobStatus::Paused, chrono::Duration::hours(3));
    paused.paused_at = Some(paused.updated_at);
    store.insert(paused.snapshot());

    let services = Arc::new(Services::new(config, store.clone()));
    let checkpoint = services.layout.job(paused.id).checkpoint(100);
    std::fs::create_dir_all(&checkpoint).unwrap();

    let (orchestrator, _) = actors::start_orchestrator(services.clone()).await.unwrap();
    let report = actors::recover(&services, &orchestrator).await;
    assert_eq!(report.paused, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(get_job(&orchestrator, paused.id).await.status, JobStatus::Paused);

    // Housekeeping keeps the checkpoints of a paused job.
    orchestrator
        .send_message(OrchestratorMessage::Cleanup)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(checkpoint.exists());

    let receipt = ask(&orchestrator, |reply| OrchestratorMessage::Resume {
        job_id: paused.id,
        checkpoint: None,
        reply,
    })
    .await
    .unwrap();
    assert_eq!(receipt.queue_position, 1);

    let resumed = get_job(&orchestrator, paused.id).await;
    assert_eq!(resumed.status, JobStatus::Queued);
    assert_eq!(resumed.resume_checkpoint, Some(checkpoint));
}
