//! Orchestrator actor: owns the job registry and the queue.
//!
//! Every status change goes through this actor's mailbox. Monitors report
//! progress and outcomes here; API calls and the dispatcher ask here.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_core::{
    JobEvent, JobFailure, JobId, JobQueue, JobRecord, JobStatus, QueueStats, QueueView, QueuedJob,
    TransitionError, ValidationError,
};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};

use crate::alerts::{self, Alert, AlertKind, AlertSink, TracingAlerts};
use crate::config::OrchestratorConfig;
use crate::dispatcher::launch;
use crate::gateway::PersistenceGateway;
use crate::housekeeping;
use crate::hub::BroadcastHub;
use crate::layout::DataLayout;
use crate::messages::{
    ActorError, ActorResult, JobOutcome, MonitorMessage, OrchestratorMessage, StopKind,
    SubmitReceipt,
};
use crate::monitor::{MonitorActor, MonitorArgs, MonitorTarget};
use crate::process::{self, ProcessSupervisor};
use crate::remote::RemoteStore;

/// Collaborators shared by the orchestrator, dispatcher and monitors.
pub struct Services {
    pub config: OrchestratorConfig,
    pub layout: DataLayout,
    pub processes: ProcessSupervisor,
    pub gateway: PersistenceGateway,
    pub hub: Arc<BroadcastHub>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Services {
    pub fn new(config: OrchestratorConfig, store: Arc<dyn RemoteStore>) -> Self {
        Self {
            layout: DataLayout::new(&config.data_dir),
            processes: ProcessSupervisor::from_config(&config),
            gateway: PersistenceGateway::new(store, config.persistence.clone()),
            hub: Arc::new(BroadcastHub::new()),
            alerts: Arc::new(TracingAlerts),
            config,
        }
    }

    pub fn with_alerts(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        self.gateway.store()
    }
}

/// State for the orchestrator actor.
pub struct OrchestratorState {
    services: Arc<Services>,
    jobs: HashMap<JobId, JobRecord>,
    queue: JobQueue,
    monitors: HashMap<JobId, ActorRef<MonitorMessage>>,
    /// Job whose worker launch has not reported back yet.
    launching: Option<(JobId, DateTime<Utc>)>,
    accepting: bool,
}

impl OrchestratorState {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            jobs: HashMap::new(),
            queue: JobQueue::new(),
            monitors: HashMap::new(),
            launching: None,
            accepting: true,
        }
    }

    /// The job holding the accelerator. PENDING counts: its worker is
    /// about to start.
    fn active_job(&self) -> Option<JobId> {
        self.jobs
            .values()
            .find(|job| job.status.is_active())
            .map(|job| job.id)
    }

    /// The job the accelerator is reserved for. A launch still in flight
    /// holds it even if its job was cancelled meanwhile.
    fn reserved_by(&self) -> Option<JobId> {
        self.active_job()
            .or(self.launching.map(|(job_id, _)| job_id))
    }

    fn begin_launch(&mut self, job_id: JobId) {
        self.launching = Some((job_id, Utc::now()));
    }

    fn end_launch(&mut self, job_id: JobId) {
        if self.launching.is_some_and(|(id, _)| id == job_id) {
            self.launching = None;
        }
    }

    fn record_mut(&mut self, job_id: JobId) -> ActorResult<&mut JobRecord> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(ActorError::JobNotFound(job_id))
    }

    fn refresh_positions(&mut self) {
        for (job_id, position) in self.queue.positions() {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.queue_position = Some(position);
            }
        }
    }

    /// Apply `change` to a job, then persist and broadcast the result.
    async fn apply<F>(&mut self, job_id: JobId, change: F) -> ActorResult<JobStatus>
    where
        F: FnOnce(&mut JobRecord) -> Result<JobStatus, TransitionError>,
    {
        let record = self.record_mut(job_id)?;
        let previous = change(record).inspect_err(|e| tracing::warn!("{}", e))?;
        self.publish(job_id, Some(previous)).await;
        Ok(previous)
    }

    async fn transition(&mut self, job_id: JobId, next: JobStatus) -> ActorResult<JobStatus> {
        self.apply(job_id, |job| job.transition(next)).await
    }

    /// Persist the job and push it to subscribers. A status change also
    /// raises alerts, and a terminal status ends the subscriber streams.
    async fn publish(&self, job_id: JobId, previous: Option<JobStatus>) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let services = &self.services;

        services.gateway.persist_job(job.snapshot());

        let changed = previous.filter(|p| *p != job.status);
        if let Some(old_status) = changed {
            tracing::info!("Job {} {} -> {}", job_id, old_status, job.status);
            services
                .hub
                .broadcast(
                    job_id,
                    JobEvent::StatusChanged {
                        job_id,
                        old_status,
                        new_status: job.status,
                        timestamp: Utc::now(),
                    },
                )
                .await;
            if let Some(kind) = AlertKind::for_status(job.status) {
                self.alert(job, kind);
            }
        }

        services
            .hub
            .broadcast(job_id, JobEvent::snapshot(job.public_snapshot()))
            .await;

        if changed.is_some() && job.status.is_terminal() {
            services
                .hub
                .complete(
                    job_id,
                    JobEvent::complete(job_id, job.status, job.error.clone()),
                )
                .await;
        }
    }

    fn alert(&self, job: &JobRecord, kind: AlertKind) {
        alerts::dispatch(
            &self.services.alerts,
            Alert {
                kind,
                job_id: job.id,
                owner_id: job.owner_id.clone(),
                message: job.error.clone(),
            },
        );
    }

    async fn spawn_monitor(
        &mut self,
        myself: &ActorRef<OrchestratorMessage>,
        job_id: JobId,
        target: MonitorTarget,
    ) -> ActorResult<()> {
        let record = self.record_mut(job_id)?;
        record.monitor_seq = 0;
        let execution = record.execution_id.clone().unwrap_or_default();
        let token = record.token.clone();
        let pid = target.pid();

        let args = MonitorArgs {
            job_id,
            token,
            target,
            orchestrator: myself.clone(),
            services: self.services.clone(),
        };
        let name = format!("monitor-{}-{}", job_id, execution);
        match Actor::spawn_linked(Some(name), MonitorActor, args, myself.get_cell()).await {
            Ok((monitor, _)) => {
                self.monitors.insert(job_id, monitor);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Cannot monitor job {}: {}", job_id, e);
                if let Err(e) = self.services.processes.kill_by_pid(pid) {
                    tracing::error!("Cannot kill unmonitored worker {}: {}", pid, e);
                }
                Err(ActorError::Actor(e.to_string()))
            }
        }
    }

    /// Stop a worker that has no monitor, in the background.
    fn terminate_detached(&self, pid: u32, grace: Duration) {
        let services = self.services.clone();
        tokio::spawn(async move {
            services.processes.terminate_pid(pid, grace).await;
        });
    }

    fn queue_view(&self) -> QueueView {
        let entries = self
            .queue
            .positions()
            .filter_map(|(job_id, position)| {
                self.jobs.get(&job_id).map(|job| QueuedJob {
                    job_id,
                    owner_id: job.owner_id.clone(),
                    position,
                    created_at: job.created_at,
                })
            })
            .collect();

        let mut stats = QueueStats::default();
        for job in self.jobs.values() {
            stats.record(job.status);
        }

        QueueView {
            active: self.active_job(),
            entries,
            stats,
        }
    }

    async fn cancel(&mut self, job_id: JobId) -> ActorResult<JobStatus> {
        let status = self.record_mut(job_id)?.status;
        match status {
            JobStatus::Queued => {
                self.queue.remove(job_id);
                self.refresh_positions();
                self.transition(job_id, JobStatus::Cancelled).await
            }
            // The worker may be starting; `Started` terminates it.
            JobStatus::Pending => self.transition(job_id, JobStatus::Cancelled).await,
            JobStatus::Running => self.stop_running(job_id, StopKind::Cancel).await,
            other => Err(TransitionError {
                job_id: job_id.to_string(),
                from: other,
                to: JobStatus::Cancelled,
            }
            .into()),
        }
    }

    async fn pause(&mut self, job_id: JobId) -> ActorResult<()> {
        let status = self.record_mut(job_id)?.status;
        if status != JobStatus::Running {
            return Err(TransitionError {
                job_id: job_id.to_string(),
                from: status,
                to: JobStatus::Paused,
            }
            .into());
        }
        self.stop_running(job_id, StopKind::Pause).await?;
        Ok(())
    }

    /// Ask the monitor of a running job to stop its worker. Without a
    /// monitor the worker is signalled directly.
    async fn stop_running(&mut self, job_id: JobId, kind: StopKind) -> ActorResult<JobStatus> {
        if let Some(monitor) = self.monitors.get(&job_id)
            && monitor.send_message(MonitorMessage::Stop { kind }).is_ok()
        {
            return Ok(JobStatus::Running);
        }

        let config = &self.services.config;
        let (grace, next) = match kind {
            StopKind::Cancel => (config.cancel_grace, JobStatus::Cancelled),
            StopKind::Pause => (config.pause_grace, JobStatus::Paused),
        };
        if let Some(pid) = self.record_mut(job_id)?.pid {
            self.terminate_detached(pid, grace);
        }
        self.transition(job_id, next).await
    }

    async fn resume(
        &mut self,
        job_id: JobId,
        checkpoint: Option<PathBuf>,
    ) -> ActorResult<SubmitReceipt> {
        let status = self.record_mut(job_id)?.status;
        if !status.can_transition_to(JobStatus::Queued) {
            return Err(TransitionError {
                job_id: job_id.to_string(),
                from: status,
                to: JobStatus::Queued,
            }
            .into());
        }

        let paths = self.services.layout.job(job_id);
        let checkpoint = match checkpoint {
            Some(path) => {
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Err(ValidationError::MissingCheckpoint(path.display().to_string()).into());
                }
                path
            }
            None => match paths.latest_checkpoint().await {
                Ok(Some(path)) => path,
                Ok(None) => {
                    return Err(ValidationError::MissingCheckpoint(format!(
                        "no checkpoint under {}",
                        paths.output_dir.display()
                    ))
                    .into());
                }
                Err(e) => return Err(ActorError::Process(e.to_string())),
            },
        };

        tracing::info!("Resuming job {} from {}", job_id, checkpoint.display());
        let queue_position = self.queue.enqueue(job_id);
        self.apply(job_id, |job| {
            job.resume_checkpoint = Some(checkpoint);
            job.queue_position = Some(queue_position);
            job.transition(JobStatus::Queued)
        })
        .await?;

        Ok(SubmitReceipt {
            job_id,
            queue_position,
        })
    }

    async fn force_start(
        &mut self,
        myself: &ActorRef<OrchestratorMessage>,
        job_id: JobId,
    ) -> ActorResult<()> {
        let (status, updated_at) = {
            let record = self.record_mut(job_id)?;
            (record.status, record.updated_at)
        };
        match status {
            JobStatus::Queued => {
                if let Some(active) = self.reserved_by() {
                    return Err(ActorError::ResourceBusy(active));
                }
                tracing::warn!("Force-starting queued job {}", job_id);
                self.queue.remove(job_id);
                self.refresh_positions();
                self.transition(job_id, JobStatus::Pending).await?;
            }
            JobStatus::Pending => {
                let waited = Utc::now().signed_duration_since(updated_at);
                let limit = chrono::Duration::from_std(self.services.config.dequeue_wait)
                    .unwrap_or(chrono::Duration::MAX);
                if waited < limit {
                    return Err(ActorError::ResourceBusy(job_id));
                }
                tracing::warn!("Relaunching job {}, pending for {}s", job_id, waited.num_seconds());
            }
            other => {
                return Err(TransitionError {
                    job_id: job_id.to_string(),
                    from: other,
                    to: JobStatus::Pending,
                }
                .into());
            }
        }

        let Some(record) = self.jobs.get(&job_id).cloned() else {
            return Err(ActorError::JobNotFound(job_id));
        };
        self.begin_launch(job_id);
        let services = self.services.clone();
        let orchestrator = myself.clone();
        tokio::spawn(async move { launch(&services, &orchestrator, record).await });
        Ok(())
    }

    async fn finish(&mut self, job_id: JobId, outcome: JobOutcome) {
        self.monitors.remove(&job_id);
        let Some(record) = self.jobs.get(&job_id) else {
            return;
        };
        if record.status != JobStatus::Running {
            tracing::debug!("Ignoring outcome of job {} in status {}", job_id, record.status);
            return;
        }

        let result = match &outcome {
            JobOutcome::Completed => self.transition(job_id, JobStatus::Completed).await,
            JobOutcome::Cancelled => self.transition(job_id, JobStatus::Cancelled).await,
            JobOutcome::Paused => self.transition(job_id, JobStatus::Paused).await,
            JobOutcome::Failed(failure) => self.apply(job_id, |job| job.fail(failure)).await,
        };
        if result.is_err() {
            return;
        }

        if let JobOutcome::Failed(failure) = &outcome
            && failure.is_resource_exhausted()
            && let Some(job) = self.jobs.get(&job_id)
        {
            self.alert(job, AlertKind::ResourceExhausted);
        }
    }

    async fn health_check(&mut self, myself: &ActorRef<OrchestratorMessage>) {
        let now = Utc::now();
        let pending_limit = chrono::Duration::from_std(self.services.config.health_interval * 2)
            .unwrap_or(chrono::Duration::MAX);

        let mut lost = Vec::new();
        let mut orphaned = Vec::new();
        let mut stuck = Vec::new();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Running if !self.monitors.contains_key(&job.id) => match job.pid {
                    Some(pid) if process::is_alive(pid) => orphaned.push((job.id, pid)),
                    _ => lost.push(job.id),
                },
                JobStatus::Pending if now.signed_duration_since(job.updated_at) > pending_limit => {
                    stuck.push(job.id);
                }
                _ => {}
            }
        }

        for (job_id, pid) in orphaned {
            tracing::warn!("Job {} has no monitor, re-attaching to pid {}", job_id, pid);
            if let Err(e) = self.spawn_monitor(myself, job_id, MonitorTarget::Pid(pid)).await {
                tracing::error!("Re-attach of job {} failed: {}", job_id, e);
            }
        }
        for job_id in lost {
            tracing::warn!("Worker of job {} is gone", job_id);
            let _ = self.apply(job_id, |job| job.fail(&JobFailure::Lost)).await;
        }
        if let Some((job_id, since)) = self.launching
            && now.signed_duration_since(since) > pending_limit
        {
            tracing::warn!("Launch of job {} never reported back, releasing", job_id);
            self.launching = None;
        }
        for job_id in stuck {
            tracing::warn!("Job {} never confirmed its worker start", job_id);
            let failure = JobFailure::Spawn("worker start was never confirmed".into());
            let _ = self.apply(job_id, |job| job.fail(&failure)).await;
        }
    }

    fn cleanup(&mut self) {
        let config = &self.services.config;
        let expired =
            housekeeping::expired_jobs(self.jobs.values(), config.terminal_retention, Utc::now());
        for job_id in &expired {
            self.jobs.remove(job_id);
            self.services.gateway.forget(*job_id);
            self.services.hub.forget(*job_id);
        }
        if !expired.is_empty() {
            tracing::info!("Evicted {} finished jobs from memory", expired.len());
        }

        let keep: HashSet<JobId> = self.jobs.keys().copied().collect();
        let services = self.services.clone();
        tokio::spawn(async move {
            let retention = services.config.artifact_retention;
            match housekeeping::sweep_artifacts(&services.layout, retention, &keep).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Removed artifacts of {} jobs", n),
                Err(e) => tracing::warn!("Artifact cleanup failed: {}", e),
            }
        });
    }
}

/// Orchestrator actor.
pub struct Orchestrator;

impl Actor for Orchestrator {
    type Msg = OrchestratorMessage;
    type State = OrchestratorState;
    type Arguments = Arc<Services>;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        services: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting orchestrator");

        services.layout.init().await?;

        spawn_ticker(
            myself.clone(),
            services.config.health_interval,
            || OrchestratorMessage::HealthCheck,
        );
        spawn_ticker(
            myself.clone(),
            services.config.cleanup_interval,
            || OrchestratorMessage::Cleanup,
        );

        Ok(OrchestratorState::new(services))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            OrchestratorMessage::Submit { submission, reply } => {
                if !state.accepting {
                    let _ = reply.send(Err(ActorError::ShuttingDown));
                    return Ok(());
                }
                if let Err(e) = submission.validate() {
                    let _ = reply.send(Err(e.into()));
                    return Ok(());
                }

                let mut job = JobRecord::new(submission);
                let job_id = job.id;
                let queue_position = state.queue.enqueue(job_id);
                job.queue_position = Some(queue_position);
                state.services.gateway.persist_job(job.snapshot());
                state.jobs.insert(job_id, job);
                tracing::info!("Job {} queued at position {}", job_id, queue_position);

                let _ = reply.send(Ok(SubmitReceipt {
                    job_id,
                    queue_position,
                }));
            }

            OrchestratorMessage::GetJob { job_id, reply } => {
                let _ = reply.send(state.jobs.get(&job_id).map(JobRecord::public_snapshot));
            }

            OrchestratorMessage::GetMetrics { job_id, reply } => {
                let _ = reply.send(state.jobs.get(&job_id).map(|j| j.metrics_history.clone()));
            }

            OrchestratorMessage::ListQueue { reply } => {
                let _ = reply.send(state.queue_view());
            }

            OrchestratorMessage::Cancel { job_id, reply } => {
                let _ = reply.send(state.cancel(job_id).await);
            }

            OrchestratorMessage::Pause { job_id, reply } => {
                let _ = reply.send(state.pause(job_id).await);
            }

            OrchestratorMessage::Resume {
                job_id,
                checkpoint,
                reply,
            } => {
                let _ = reply.send(state.resume(job_id, checkpoint).await);
            }

            OrchestratorMessage::ForceStart { job_id, reply } => {
                let _ = reply.send(state.force_start(&myself, job_id).await);
            }

            OrchestratorMessage::RequestJob { reply } => {
                if !state.accepting || reply.is_closed() || state.reserved_by().is_some() {
                    let _ = reply.send(None);
                    return Ok(());
                }

                while let Some(job_id) = state.queue.dequeue() {
                    let queued = state
                        .jobs
                        .get(&job_id)
                        .is_some_and(|job| job.status == JobStatus::Queued);
                    if !queued {
                        tracing::warn!("Dropping stale queue entry {}", job_id);
                        continue;
                    }

                    state.refresh_positions();
                    if state.transition(job_id, JobStatus::Pending).await.is_err() {
                        continue;
                    }
                    let Some(record) = state.jobs.get(&job_id).cloned() else {
                        continue;
                    };
                    state.begin_launch(job_id);
                    if reply.send(Some(record.clone())).is_err() {
                        tracing::warn!("Dispatcher gave up on job {}, launching it here", job_id);
                        let services = state.services.clone();
                        let orchestrator = myself.clone();
                        tokio::spawn(async move { launch(&services, &orchestrator, record).await });
                    }
                    return Ok(());
                }
                let _ = reply.send(None);
            }

            OrchestratorMessage::Started {
                job_id,
                execution_id,
                mut process,
            } => {
                let status = state.jobs.get(&job_id).map(|job| job.status);
                if status != Some(JobStatus::Pending) {
                    tracing::warn!(
                        "Worker {} started for job {} in status {:?}, terminating it",
                        process.pid,
                        job_id,
                        status
                    );
                    // The accelerator stays reserved until the worker is gone.
                    let services = state.services.clone();
                    let orchestrator = myself.clone();
                    tokio::spawn(async move {
                        let grace = services.config.cancel_grace;
                        services.processes.terminate(&mut process, grace).await;
                        let _ = orchestrator.send_message(OrchestratorMessage::Discarded { job_id });
                    });
                    return Ok(());
                }

                state.end_launch(job_id);

                let pid = process.pid;
                let started = state
                    .apply(job_id, |job| {
                        job.pid = Some(pid);
                        job.execution_id = Some(execution_id);
                        job.transition(JobStatus::Running)
                    })
                    .await;
                if started.is_ok()
                    && let Err(e) = state
                        .spawn_monitor(&myself, job_id, MonitorTarget::Child(process))
                        .await
                {
                    let failure = JobFailure::Spawn(format!("monitor failed to start: {}", e));
                    let _ = state.apply(job_id, |job| job.fail(&failure)).await;
                }
            }

            OrchestratorMessage::SpawnFailed { job_id, error } => {
                state.end_launch(job_id);
                if state.jobs.get(&job_id).is_some_and(|job| job.status == JobStatus::Pending) {
                    let failure = JobFailure::Spawn(error);
                    let _ = state.apply(job_id, |job| job.fail(&failure)).await;
                }
            }

            OrchestratorMessage::Discarded { job_id } => {
                tracing::info!("Discarded worker of job {} stopped", job_id);
                state.end_launch(job_id);
            }

            OrchestratorMessage::Progress {
                job_id,
                seq,
                report,
            } => {
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    return Ok(());
                };
                if job.status.is_terminal() || seq <= job.monitor_seq {
                    tracing::debug!("Discarding progress #{} of job {}", seq, job_id);
                    return Ok(());
                }
                job.monitor_seq = seq;
                job.apply_progress(&report);
                state.publish(job_id, None).await;
            }

            OrchestratorMessage::Finished {
                job_id,
                seq,
                outcome,
            } => {
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.monitor_seq = job.monitor_seq.max(seq);
                }
                state.finish(job_id, outcome).await;
            }

            OrchestratorMessage::Attach { record, pid, reply } => {
                let mut record = *record;
                let job_id = record.id;
                if let Some(active) = state.active_job().filter(|id| *id != job_id) {
                    let _ = reply.send(Err(ActorError::ResourceBusy(active)));
                    return Ok(());
                }
                if record.status != JobStatus::Running {
                    let _ = reply.send(Err(TransitionError {
                        job_id: job_id.to_string(),
                        from: record.status,
                        to: JobStatus::Running,
                    }
                    .into()));
                    return Ok(());
                }

                record.pid = Some(pid);
                record.queue_position = None;
                record.touch();
                state.jobs.insert(job_id, record);
                state.publish(job_id, None).await;

                let result = state
                    .spawn_monitor(&myself, job_id, MonitorTarget::Pid(pid))
                    .await;
                let _ = reply.send(result);
            }

            OrchestratorMessage::Restore { record, reply } => {
                let mut record = *record;
                let job_id = record.id;
                let position = if record.status == JobStatus::Queued {
                    let position = state.queue.enqueue(job_id);
                    record.queue_position = Some(position);
                    Some(position)
                } else {
                    None
                };
                state.jobs.insert(job_id, record);
                state.publish(job_id, None).await;
                let _ = reply.send(position);
            }

            OrchestratorMessage::HealthCheck => {
                if state.accepting {
                    state.health_check(&myself).await;
                }
            }

            OrchestratorMessage::Cleanup => {
                state.cleanup();
            }

            OrchestratorMessage::Shutdown { reply } => {
                tracing::info!("Shutting down orchestrator");
                state.accepting = false;
                for (_, monitor) in state.monitors.drain() {
                    let _ = monitor.send_message(MonitorMessage::Detach);
                }

                let report = state.services.gateway.sweep().await;
                if report.still_cached > 0 {
                    tracing::warn!(
                        "{} jobs still have undelivered payloads at shutdown",
                        report.still_cached
                    );
                }

                let _ = reply.send(());
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, reason) = match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => (cell, reason),
            SupervisionEvent::ActorFailed(cell, error) => (cell, Some(error.to_string())),
            _ => return Ok(()),
        };

        let job_id = state
            .monitors
            .iter()
            .find(|(_, monitor)| monitor.get_id() == cell.get_id())
            .map(|(job_id, _)| *job_id);
        if let Some(job_id) = job_id {
            state.monitors.remove(&job_id);
            tracing::warn!(
                "Monitor of job {} stopped unexpectedly: {:?}",
                job_id,
                reason
            );
            // Finished, if sent, is already queued ahead of this check.
            if state.accepting {
                let _ = myself.send_message(OrchestratorMessage::HealthCheck);
            }
        }
        Ok(())
    }
}

fn spawn_ticker<F>(actor: ActorRef<OrchestratorMessage>, period: Duration, message: F)
where
    F: Fn() -> OrchestratorMessage + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            if actor.send_message(message()).is_err() {
                break;
            }
        }
    });
}

/// Start the orchestrator.
pub async fn start_orchestrator(
    services: Arc<Services>,
) -> Result<(ActorRef<OrchestratorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    Actor::spawn(None, Orchestrator, services).await
}
