//! Startup recovery: adopt surviving workers, reload paused jobs and settle
//! durable records left behind by the previous run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_core::{JobFailure, JobId, JobRecord, JobStatus, ProgressReport, WorkerPhase};
use ractor::ActorRef;
use ractor::rpc::CallResult;

use crate::messages::{ActorError, OrchestratorMessage};
use crate::orchestrator::Services;
use crate::process::{self, WorkerInfo};

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// What recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Running workers adopted with a new monitor.
    pub reattached: usize,
    /// Queued jobs put back in the queue.
    pub requeued: usize,
    /// Paused jobs loaded back so they can be resumed.
    pub paused: usize,
    /// Records marked FAILED.
    pub failed: usize,
    /// Worker processes killed because no job could be matched.
    pub orphans_killed: usize,
}

/// Scan for surviving workers and stale records. Runs once, before the
/// dispatcher starts.
pub async fn recover(
    services: &Arc<Services>,
    orchestrator: &ActorRef<OrchestratorMessage>,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let mut recovered = HashSet::new();
    let threshold = chrono::Duration::from_std(services.config.recovery_threshold)
        .unwrap_or(chrono::Duration::MAX);
    let now = Utc::now();

    let workers = match process::find_worker_processes() {
        Ok(workers) => workers,
        Err(e) => {
            tracing::error!("Cannot scan for surviving workers: {}", e);
            Vec::new()
        }
    };

    for worker in workers {
        // Workers of other data directories are not ours to touch.
        let paths = services.layout.job(worker.job_id);
        if !tokio::fs::try_exists(&paths.config).await.unwrap_or(false) {
            continue;
        }

        if !recovered.contains(&worker.job_id)
            && let Some(record) = adoptable(services, &worker, threshold, now).await
        {
            match ask(orchestrator, |reply| OrchestratorMessage::Attach {
                record: Box::new(record),
                pid: worker.pid,
                reply,
            })
            .await
            {
                Ok(Ok(())) => {
                    tracing::info!("Re-attached job {} (pid {})", worker.job_id, worker.pid);
                    recovered.insert(worker.job_id);
                    report.reattached += 1;
                    continue;
                }
                Ok(Err(e)) | Err(e) => {
                    tracing::warn!("Cannot re-attach job {}: {}", worker.job_id, e);
                }
            }
        }

        tracing::warn!(
            "Killing orphan worker {} of job {}",
            worker.pid,
            worker.job_id
        );
        match services.processes.kill_by_pid(worker.pid) {
            Ok(()) => report.orphans_killed += 1,
            Err(e) => tracing::error!("Cannot kill orphan {}: {}", worker.pid, e),
        }
    }

    let store = services.store();

    match store.list_jobs(&[JobStatus::Queued]).await {
        Ok(mut queued) => {
            queued.sort_by_key(|job| job.created_at);
            for snapshot in queued {
                if recovered.contains(&snapshot.id) {
                    continue;
                }
                let mut record = JobRecord::from_snapshot(snapshot);
                let age = now.signed_duration_since(record.updated_at);
                if age > threshold {
                    tracing::warn!(
                        "Queued job {} is {}s old, failing it",
                        record.id,
                        age.num_seconds()
                    );
                    if fail_record(&mut record, JobStatus::Queued) {
                        report.failed += 1;
                    }
                } else {
                    report.requeued += 1;
                }
                recovered.insert(record.id);
                restore(orchestrator, record).await;
            }
        }
        Err(e) => tracing::error!("Cannot list queued jobs: {}", e),
    }

    match store.list_jobs(&[JobStatus::Paused]).await {
        Ok(paused) => {
            for snapshot in paused {
                if recovered.contains(&snapshot.id) {
                    continue;
                }
                let record = JobRecord::from_snapshot(snapshot);
                recovered.insert(record.id);
                report.paused += 1;
                restore(orchestrator, record).await;
            }
        }
        Err(e) => tracing::error!("Cannot list paused jobs: {}", e),
    }

    match store
        .list_jobs(&[JobStatus::Pending, JobStatus::Running, JobStatus::Queued])
        .await
    {
        Ok(leftovers) => {
            for snapshot in leftovers {
                if recovered.contains(&snapshot.id) {
                    continue;
                }
                let status = snapshot.status;
                let mut record = JobRecord::from_snapshot(snapshot);
                tracing::warn!("Job {} was {} at shutdown, failing it", record.id, status);
                if fail_record(&mut record, status) {
                    report.failed += 1;
                }
                recovered.insert(record.id);
                restore(orchestrator, record).await;
            }
        }
        Err(e) => tracing::error!("Cannot list unfinished jobs: {}", e),
    }

    tracing::info!(
        "Recovery: {} re-attached, {} re-queued, {} paused, {} failed, {} orphans killed",
        report.reattached,
        report.requeued,
        report.paused,
        report.failed,
        report.orphans_killed
    );
    report
}

/// The record to re-attach `worker` to, if its progress file says it is
/// running and was updated recently.
async fn adoptable(
    services: &Services,
    worker: &WorkerInfo,
    threshold: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<JobRecord> {
    let job_id = worker.job_id;
    let bytes = services.layout.job(job_id).read_progress().await.ok()??;
    let progress = ProgressReport::parse(&bytes).ok()?;

    let in_flight = matches!(
        progress.status,
        WorkerPhase::Initializing | WorkerPhase::Running | WorkerPhase::Saving
    );
    let fresh = progress
        .updated_at
        .is_some_and(|at| now.signed_duration_since(at) < threshold);
    if !in_flight || !fresh {
        tracing::info!("Worker of job {} is not resumable ({:?})", job_id, progress.status);
        return None;
    }

    let snapshot = match services.store().get_job(job_id).await {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) => {
            tracing::warn!("No durable record for running job {}", job_id);
            return None;
        }
        Err(e) => {
            tracing::warn!("Cannot load job {}: {}", job_id, e);
            return None;
        }
    };

    let mut record = JobRecord::from_snapshot(snapshot);
    if record.status == JobStatus::Pending {
        record.transition(JobStatus::Running).ok()?;
    }
    if record.status != JobStatus::Running {
        return None;
    }
    record.apply_progress(&progress);
    Some(record)
}

fn fail_record(record: &mut JobRecord, status: JobStatus) -> bool {
    match record.fail(&JobFailure::StaleAtRestart { status }) {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("{}", e);
            false
        }
    }
}

async fn restore(orchestrator: &ActorRef<OrchestratorMessage>, record: JobRecord) {
    let job_id = record.id;
    if let Err(e) = ask(orchestrator, |reply| OrchestratorMessage::Restore {
        record: Box::new(record),
        reply,
    })
    .await
    {
        tracing::error!("Cannot restore job {}: {}", job_id, e);
    }
}

async fn ask<T, F>(orchestrator: &ActorRef<OrchestratorMessage>, message: F) -> Result<T, ActorError>
where
    T: Send + 'static,
    F: FnOnce(ractor::RpcReplyPort<T>) -> OrchestratorMessage,
{
    match ractor::rpc::call(orchestrator, message, Some(CALL_TIMEOUT)).await {
        Ok(CallResult::Success(value)) => Ok(value),
        Ok(CallResult::Timeout) => Err(ActorError::Timeout),
        Ok(CallResult::SenderError) => Err(ActorError::Actor("orchestrator dropped the reply".into())),
        Err(e) => Err(ActorError::Actor(e.to_string())),
    }
}
