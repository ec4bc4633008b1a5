//! Eviction of old jobs from memory and old artifacts from disk.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use queue_core::{JobId, JobRecord};
use tokio::fs;

use crate::layout::DataLayout;

/// Terminal jobs that finished more than `retention` before `now`.
pub fn expired_jobs<'a>(
    jobs: impl IntoIterator<Item = &'a JobRecord>,
    retention: Duration,
    now: DateTime<Utc>,
) -> Vec<JobId> {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    jobs.into_iter()
        .filter(|job| job.status.is_terminal())
        .filter(|job| {
            let finished = job.completed_at.unwrap_or(job.updated_at);
            now.signed_duration_since(finished) > retention
        })
        .map(|job| job.id)
        .collect()
}

/// Remove the artifacts of every job not in `keep` whose newest file is
/// older than `retention`. Returns the number of jobs cleaned.
pub async fn sweep_artifacts(
    layout: &DataLayout,
    retention: Duration,
    keep: &HashSet<JobId>,
) -> io::Result<usize> {
    let mut candidates: HashSet<JobId> = layout.output_job_ids().await?.into_iter().collect();
    candidates.extend(job_ids_in(&layout.logs_dir(), "log").await?);
    candidates.extend(job_ids_in(&layout.configs_dir(), "json").await?);

    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = 0;

    for job_id in candidates.difference(keep) {
        let paths = layout.job(*job_id);
        let newest = [&paths.log, &paths.config, &paths.progress, &paths.output_dir]
            .into_iter()
            .filter_map(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok())
            .max();

        if newest.is_some_and(|t| t < cutoff) {
            tracing::info!("Removing artifacts of job {}", job_id);
            paths.remove_all().await?;
            removed += 1;
        }
    }

    Ok(removed)
}

async fn job_ids_in(dir: &Path, extension: &str) -> io::Result<Vec<JobId>> {
    let mut ids = Vec::new();
    if !fs::try_exists(dir).await? {
        return Ok(ids);
    }

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == extension)
            && let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| JobId::parse(s).ok())
        {
            ids.push(id);
        }
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::{JobStatus, Submission};

    fn job(status: JobStatus, finished_ago: chrono::Duration) -> JobRecord {
        let mut job = JobRecord::new(Submission::new("o", serde_json::json!({})));
        job.status = status;
        job.completed_at = Some(Utc::now() - finished_ago);
        job
    }

    #[test]
    fn test_expired_jobs_only_terminal_and_old() {
        let old_done = job(JobStatus::Completed, chrono::Duration::hours(3));
        let new_done = job(JobStatus::Failed, chrono::Duration::minutes(1));
        let old_paused = job(JobStatus::Paused, chrono::Duration::hours(3));

        let expired = expired_jobs(
            [&old_done, &new_done, &old_paused],
            Duration::from_secs(3600),
            Utc::now(),
        );
        assert_eq!(expired, vec![old_done.id]);
    }

    #[tokio::test]
    async fn test_sweep_artifacts_respects_keep_set() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        layout.init().await.unwrap();

        let (kept, dropped) = (JobId::new(), JobId::new());
        for id in [kept, dropped] {
            let paths = layout.job(id);
            fs::create_dir_all(&paths.output_dir).await.unwrap();
            fs::write(&paths.log, b"line\n").await.unwrap();
        }

        let keep: HashSet<JobId> = [kept].into_iter().collect();
        let removed = sweep_artifacts(&layout, Duration::ZERO, &keep).await.unwrap();

        assert_eq!(removed, 1);
        assert!(layout.job(kept).log.exists());
        assert!(!layout.job(dropped).log.exists());
        assert!(!layout.job(dropped).output_dir.exists());
    }
}
