//! Job management.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actors::{
    ActorRef, DispatcherMessage, OrchestratorMessage, RpcReplyPort, Services, SubmitReceipt,
};
use futures_util::Stream;
use futures_util::stream;
use queue_core::{JobEvent, JobId, JobSnapshot, JobStatus, MetricPoint, QueueView, Submission};
use ractor::rpc::CallResult;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::ApiError;
use crate::logs::{self, LogChunk};
use crate::realtime::format_sse_event;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest log chunk returned by one streaming read.
pub const LOG_CHUNK_BYTES: usize = 64 * 1024;

/// Handle to a running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct JobService {
    services: Arc<Services>,
    orchestrator: ActorRef<OrchestratorMessage>,
    dispatcher: ActorRef<DispatcherMessage>,
    sweeper: Arc<AbortHandle>,
}

/// Parse a job ID received as text.
pub fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    JobId::parse(id.trim()).map_err(|e| ApiError::InvalidJobId(format!("{}: {}", id, e)))
}

impl JobService {
    pub fn new(
        services: Arc<Services>,
        orchestrator: ActorRef<OrchestratorMessage>,
        dispatcher: ActorRef<DispatcherMessage>,
        sweeper: AbortHandle,
    ) -> Self {
        Self {
            services,
            orchestrator,
            dispatcher,
            sweeper: Arc::new(sweeper),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    async fn call<T, F>(&self, message: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(RpcReplyPort<T>) -> OrchestratorMessage,
    {
        match ractor::rpc::call(&self.orchestrator, message, Some(CALL_TIMEOUT)).await {
            Ok(CallResult::Success(value)) => Ok(value),
            Ok(CallResult::Timeout) => Err(ApiError::Unavailable("request timed out".into())),
            Ok(CallResult::SenderError) => {
                Err(ApiError::Unavailable("orchestrator dropped the request".into()))
            }
            Err(e) => Err(ApiError::Unavailable(e.to_string())),
        }
    }

    /// Submit a job. Returns its ID and 1-based queue position.
    pub async fn submit(
        &self,
        owner_id: impl Into<String>,
        config: JsonValue,
    ) -> Result<SubmitReceipt, ApiError> {
        let submission = Submission::new(owner_id, config);
        Ok(self
            .call(|reply| OrchestratorMessage::Submit { submission, reply })
            .await??)
    }

    /// Current state of a job.
    ///
    /// Jobs already evicted from memory are read from the remote store.
    pub async fn status(&self, job_id: JobId) -> Result<JobSnapshot, ApiError> {
        let live = self
            .call(|reply| OrchestratorMessage::GetJob { job_id, reply })
            .await?;
        if let Some(job) = live {
            return Ok(job);
        }

        match self.services.store().get_job(job_id).await? {
            Some(job) => Ok(JobSnapshot {
                token: None,
                config: JsonValue::Null,
                ..job
            }),
            None => Err(ApiError::NotFound(job_id)),
        }
    }

    /// Metric history of a job, ordered by step.
    pub async fn metrics_history(&self, job_id: JobId) -> Result<Vec<MetricPoint>, ApiError> {
        let live = self
            .call(|reply| OrchestratorMessage::GetMetrics { job_id, reply })
            .await?;
        match live {
            Some(history) => Ok(history),
            None => Ok(self.services.store().list_metrics(job_id).await?),
        }
    }

    /// Read up to `max_bytes` of a job's log starting at `offset`.
    pub async fn read_logs(
        &self,
        job_id: JobId,
        offset: u64,
        max_bytes: usize,
    ) -> Result<LogChunk, ApiError> {
        let path = self.services.layout.job(job_id).log;
        Ok(logs::read_log_chunk(&path, offset, max_bytes).await?)
    }

    /// Follow a job's log until the job is terminal and the log is drained.
    pub fn stream_logs(
        &self,
        job_id: JobId,
    ) -> impl Stream<Item = Result<LogChunk, ApiError>> + Send + 'static {
        let service = self.clone();
        let poll = self.services.config.poll_interval;

        stream::unfold(Some(0u64), move |state| {
            let service = service.clone();
            async move {
                let mut offset = state?;
                loop {
                    // Status first: data written before the job ended is
                    // still read below.
                    let terminal = match service.status(job_id).await {
                        Ok(job) => job.status.is_terminal(),
                        Err(e) => return Some((Err(e), None)),
                    };

                    let chunk = match service.read_logs(job_id, offset, LOG_CHUNK_BYTES).await {
                        Ok(chunk) => chunk,
                        Err(e) => return Some((Err(e), None)),
                    };
                    if !chunk.data.is_empty() {
                        offset = chunk.next_offset;
                        return Some((Ok(chunk), Some(offset)));
                    }
                    if terminal {
                        return None;
                    }
                    tokio::time::sleep(poll).await;
                }
            }
        })
    }

    /// Cancel a job. Returns the status the job had.
    ///
    /// For a running job this returns once the stop signal was sent; the
    /// CANCELLED status follows when the worker is gone.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, ApiError> {
        Ok(self
            .call(|reply| OrchestratorMessage::Cancel { job_id, reply })
            .await??)
    }

    pub async fn pause(&self, job_id: JobId) -> Result<(), ApiError> {
        Ok(self
            .call(|reply| OrchestratorMessage::Pause { job_id, reply })
            .await??)
    }

    /// Re-queue a paused job, by default from its highest-numbered
    /// checkpoint.
    pub async fn resume(
        &self,
        job_id: JobId,
        checkpoint: Option<PathBuf>,
    ) -> Result<SubmitReceipt, ApiError> {
        Ok(self
            .call(|reply| OrchestratorMessage::Resume {
                job_id,
                checkpoint,
                reply,
            })
            .await??)
    }

    /// Start a queued job now if the accelerator is free.
    pub async fn force_start(&self, job_id: JobId) -> Result<(), ApiError> {
        Ok(self
            .call(|reply| OrchestratorMessage::ForceStart { job_id, reply })
            .await??)
    }

    pub async fn list_queue(&self) -> Result<QueueView, ApiError> {
        self.call(|reply| OrchestratorMessage::ListQueue { reply })
            .await
    }

    /// Live events of a job, starting with its current snapshot.
    ///
    /// For a job that already finished the stream holds the snapshot and
    /// the final event only.
    pub async fn subscribe(&self, job_id: JobId) -> Result<mpsc::Receiver<JobEvent>, ApiError> {
        let hub = &self.services.hub;
        let (tx, rx) = mpsc::channel(actors::hub::SUBSCRIBER_BUFFER);
        let id = hub.connect(job_id, tx.clone()).await;

        let job = match self.status(job_id).await {
            Ok(job) => job,
            Err(e) => {
                hub.disconnect(job_id, id).await;
                return Err(e);
            }
        };

        if job.status.is_terminal() {
            hub.disconnect(job_id, id).await;
            return Ok(finished_stream(job));
        }

        let _ = tx.try_send(JobEvent::snapshot(job));
        Ok(rx)
    }

    /// Live events of a job as Server-Sent Event frames.
    pub async fn sse_stream(
        &self,
        job_id: JobId,
    ) -> Result<impl Stream<Item = String> + Send + 'static, ApiError> {
        let rx = self.subscribe(job_id).await?;
        Ok(stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((format_sse_event(&event), rx))
        }))
    }

    /// Stop dispatching, detach monitors and flush pending writes. Running
    /// workers keep going and are re-attached at the next start.
    pub async fn shutdown(&self) -> Result<(), ApiError> {
        tracing::info!("Shutting down job service");
        let _ = self.dispatcher.send_message(DispatcherMessage::Shutdown);
        self.call(|reply| OrchestratorMessage::Shutdown { reply })
            .await?;
        self.sweeper.abort();
        Ok(())
    }
}

fn finished_stream(job: JobSnapshot) -> mpsc::Receiver<JobEvent> {
    let (tx, rx) = mpsc::channel(2);
    let complete = JobEvent::complete(job.id, job.status, job.error.clone());
    let _ = tx.try_send(JobEvent::snapshot(job));
    let _ = tx.try_send(complete);
    rx
}
