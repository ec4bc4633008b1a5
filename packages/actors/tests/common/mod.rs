#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actors::{
    ActorRef, Alert, AlertKind, AlertSink, OrchestratorConfig, OrchestratorMessage,
    PersistenceConfig, RemoteStore, Services, StoreError, StoreFuture, SubmitReceipt,
    WorkerCommand, alerts::AlertFuture,
};
use queue_core::{JobId, JobSnapshot, JobStatus, MetricPoint, Submission};
use ractor::rpc::CallResult;
use serde_json::json;

/// In-memory store that records every call and can be told to fail.
#[derive(Default)]
pub struct FakeStore {
    failures: Mutex<VecDeque<StoreError>>,
    jobs: Mutex<HashMap<JobId, JobSnapshot>>,
    metrics: Mutex<HashMap<JobId, Vec<MetricPoint>>>,
    upserts: Mutex<Vec<(JobId, u64, JobStatus)>>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` calls as if the store were down.
    pub fn fail_next(&self, n: usize) {
        let mut failures = self.failures.lock().unwrap();
        for _ in 0..n {
            failures.push_back(StoreError::Unavailable("connection refused".into()));
        }
    }

    pub fn reject_next(&self) {
        self.failures.lock().unwrap().push_back(StoreError::Rejected {
            status: 422,
            message: "bad payload".into(),
        });
    }

    pub fn insert(&self, snapshot: JobSnapshot) {
        self.jobs.lock().unwrap().insert(snapshot.id, snapshot);
    }

    pub fn job(&self, job_id: JobId) -> Option<JobSnapshot> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    pub fn metrics(&self, job_id: JobId) -> Vec<MetricPoint> {
        self.metrics
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Versions of every snapshot delivered for `job_id`, in order.
    pub fn versions(&self, job_id: JobId) -> Vec<u64> {
        self.upserts
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == job_id)
            .map(|(_, version, _)| *version)
            .collect()
    }

    /// Statuses delivered for `job_id`, consecutive repeats collapsed.
    pub fn statuses(&self, job_id: JobId) -> Vec<JobStatus> {
        let mut statuses: Vec<JobStatus> = self
            .upserts
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == job_id)
            .map(|(_, _, status)| *status)
            .collect();
        statuses.dedup();
        statuses
    }

    fn check(&self) -> Result<(), StoreError> {
        match self.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl RemoteStore for FakeStore {
    fn upsert_job<'a>(&'a self, snapshot: &'a JobSnapshot) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.upserts
                .lock()
                .unwrap()
                .push((snapshot.id, snapshot.version, snapshot.status));
            let mut jobs = self.jobs.lock().unwrap();
            let newer = jobs
                .get(&snapshot.id)
                .is_none_or(|existing| existing.version <= snapshot.version);
            if newer {
                jobs.insert(snapshot.id, snapshot.clone());
            }
            Ok(())
        })
    }

    fn append_metrics<'a>(
        &'a self,
        job_id: JobId,
        token: &'a str,
        batch: &'a [MetricPoint],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            let expected = self.job(job_id).and_then(|job| job.token);
            if expected.as_deref() != Some(token) {
                return Err(StoreError::Unauthorized("bad job token".into()));
            }
            let mut metrics = self.metrics.lock().unwrap();
            MetricPoint::merge_batch(metrics.entry(job_id).or_default(), batch);
            Ok(())
        })
    }

    fn get_job(&self, job_id: JobId) -> StoreFuture<'_, Option<JobSnapshot>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.job(job_id))
        })
    }

    fn list_jobs<'a>(&'a self, statuses: &'a [JobStatus]) -> StoreFuture<'a, Vec<JobSnapshot>> {
        Box::pin(async move {
            self.check()?;
            let mut jobs: Vec<JobSnapshot> = self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|job| statuses.contains(&job.status))
                .cloned()
                .collect();
            jobs.sort_by_key(|job| job.created_at);
            Ok(jobs)
        })
    }

    fn list_metrics(&self, job_id: JobId) -> StoreFuture<'_, Vec<MetricPoint>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.metrics(job_id))
        })
    }
}

/// Writes progress once per tick until killed.
pub const RUNNING_WORKER: &str = r#"
step=0
while true; do
  step=$((step + 1))
  printf '{"status":"running","step":%d,"total_steps":1000,"updated_at":"%s"}' \
    "$step" "$(date -u +%Y-%m-%dT%H:%M:%SZ)" > "$PROGRESS_FILE.tmp"
  mv "$PROGRESS_FILE.tmp" "$PROGRESS_FILE"
  sleep 0.1
done
"#;

/// Reports two metric points and exits cleanly.
pub const COMPLETING_WORKER: &str = r#"
printf '{"status":"completed","step":10,"total_steps":10,"loss":0.5,"metrics_history":[{"step":5,"train_loss":0.9},{"step":10,"train_loss":0.5}],"updated_at":"%s"}' \
  "$(date -u +%Y-%m-%dT%H:%M:%SZ)" > "$PROGRESS_FILE"
sleep 0.2
exit 0
"#;

/// Leaves a truncated progress file behind.
pub const CORRUPT_WORKER: &str = r#"
printf '{"status":' > "$PROGRESS_FILE"
sleep 60
"#;

/// Dies of SIGKILL, as when the kernel runs out of memory.
pub const KILLED_WORKER: &str = "sleep 0.2\nkill -9 $$\n";

/// Never writes progress.
pub const SILENT_WORKER: &str = "sleep 60\n";

/// Exits with an error right away.
pub const FAILING_WORKER: &str = "echo 'CUDA error' >&2\nexit 3\n";

/// Records its arguments, leaves two checkpoints, then runs.
pub const CHECKPOINTING_WORKER: &str = r#"
echo "$@" >> "$OUTPUT_DIR/invocations.txt"
mkdir -p "$OUTPUT_DIR/checkpoint-900" "$OUTPUT_DIR/checkpoint-1000"
while true; do
  printf '{"status":"running","step":1000,"updated_at":"%s"}' \
    "$(date -u +%Y-%m-%dT%H:%M:%SZ)" > "$PROGRESS_FILE"
  sleep 0.1
done
"#;

pub fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("worker.sh");
    std::fs::write(&path, body).unwrap();
    path
}

/// Fast timings for tests, with a `/bin/sh` worker.
pub fn test_config(dir: &Path, script: &str) -> OrchestratorConfig {
    let script = write_script(dir, script);
    OrchestratorConfig::new(dir.join("data"))
        .with_worker(WorkerCommand::new("/bin/sh").with_args([script.display().to_string()]))
        .with_poll_interval(Duration::from_millis(50))
        .with_dispatch_interval(Duration::from_millis(50))
        .with_grace(Duration::from_secs(2), Duration::from_secs(2))
        .with_persistence(PersistenceConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            cache_capacity: 16,
            sweep_interval: Duration::from_secs(60),
        })
}

/// Alert sink that keeps every alert.
#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn kinds(&self, job_id: JobId) -> Vec<AlertKind> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|alert| alert.job_id == job_id)
            .map(|alert| alert.kind)
            .collect()
    }
}

impl AlertSink for RecordingAlerts {
    fn send(&self, alert: Alert) -> AlertFuture {
        self.alerts.lock().unwrap().push(alert);
        Box::pin(async {})
    }
}

/// Orchestrator plus dispatcher.
pub async fn start(
    config: OrchestratorConfig,
    store: Arc<FakeStore>,
) -> (Arc<Services>, ActorRef<OrchestratorMessage>) {
    start_services(Services::new(config, store)).await
}

/// Orchestrator plus dispatcher on prepared services.
pub async fn start_services(services: Services) -> (Arc<Services>, ActorRef<OrchestratorMessage>) {
    let services = Arc::new(services);
    let (orchestrator, _) = actors::start_orchestrator(services.clone()).await.unwrap();
    actors::start_dispatcher(orchestrator.clone(), services.clone())
        .await
        .unwrap();
    (services, orchestrator)
}

pub async fn ask<T, F>(orchestrator: &ActorRef<OrchestratorMessage>, message: F) -> T
where
    T: Send + 'static,
    F: FnOnce(ractor::RpcReplyPort<T>) -> OrchestratorMessage,
{
    match ractor::rpc::call(orchestrator, message, Some(Duration::from_secs(10))).await {
        Ok(CallResult::Success(value)) => value,
        _ => panic!("orchestrator did not answer"),
    }
}

pub async fn submit(orchestrator: &ActorRef<OrchestratorMessage>) -> SubmitReceipt {
    let submission = Submission::new("owner-1", json!({ "model": "tiny", "epochs": 1 }));
    ask(orchestrator, |reply| OrchestratorMessage::Submit { submission, reply })
        .await
        .unwrap()
}

pub async fn get_job(orchestrator: &ActorRef<OrchestratorMessage>, job_id: JobId) -> JobSnapshot {
    ask(orchestrator, |reply| OrchestratorMessage::GetJob { job_id, reply })
        .await
        .expect("job known")
}

/// Poll until the job reaches `status`.
pub async fn wait_for(
    orchestrator: &ActorRef<OrchestratorMessage>,
    job_id: JobId,
    status: JobStatus,
) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let job = get_job(orchestrator, job_id).await;
        if job.status == status {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            job_id,
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until `check` holds.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
