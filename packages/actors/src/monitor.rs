//! Progress monitor actor, one per active job.
//!
//! Polls the worker's progress file, forwards progress to the orchestrator
//! and metric deltas to the persistence gateway, detects exit and
//! staleness, and carries out cancel and pause requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use queue_core::{JobFailure, JobId, ProgressMarker, ProgressReport, WorkerPhase};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::layout::JobPaths;
use crate::messages::{JobOutcome, MonitorMessage, OrchestratorMessage, StopKind};
use crate::orchestrator::Services;
use crate::process::{self, TerminationOutcome, WorkerProcess};

/// What the monitor watches.
#[derive(Debug)]
pub enum MonitorTarget {
    /// A worker started by this orchestrator.
    Child(WorkerProcess),
    /// A worker adopted after a restart, known only by PID.
    Pid(u32),
}

impl MonitorTarget {
    pub fn pid(&self) -> u32 {
        match self {
            MonitorTarget::Child(process) => process.pid,
            MonitorTarget::Pid(pid) => *pid,
        }
    }
}

/// Monitor actor arguments.
pub struct MonitorArgs {
    pub job_id: JobId,
    pub token: String,
    pub target: MonitorTarget,
    pub orchestrator: ActorRef<OrchestratorMessage>,
    pub services: Arc<Services>,
}

/// State for the monitor actor.
pub struct MonitorState {
    job_id: JobId,
    token: String,
    paths: JobPaths,
    target: MonitorTarget,
    orchestrator: ActorRef<OrchestratorMessage>,
    services: Arc<Services>,
    /// Sequence number of the last message sent to the orchestrator.
    seq: u64,
    last_marker: Option<ProgressMarker>,
    last_change: Instant,
    parse_failures: u32,
    /// Metric history entries already handed to the gateway.
    last_sent: usize,
    last_report: Option<ProgressReport>,
    finished: bool,
}

impl MonitorState {
    fn new(args: MonitorArgs) -> Self {
        let paths = args.services.layout.job(args.job_id);
        Self {
            job_id: args.job_id,
            token: args.token,
            paths,
            target: args.target,
            orchestrator: args.orchestrator,
            services: args.services,
            seq: 0,
            last_marker: None,
            last_change: Instant::now(),
            parse_failures: 0,
            last_sent: 0,
            last_report: None,
            finished: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Read the progress file once. Returns a failure once the file has been
    /// unreadable too many times in a row.
    async fn read_progress(&mut self) -> Result<(), JobFailure> {
        let bytes = match self.paths.read_progress().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(()),
            Err(e) => {
                tracing::warn!("Cannot read progress of job {}: {}", self.job_id, e);
                return Ok(());
            }
        };

        match ProgressReport::parse(&bytes) {
            Ok(report) => {
                self.parse_failures = 0;
                self.apply(report);
                Ok(())
            }
            Err(e) => {
                self.parse_failures += 1;
                tracing::warn!(
                    "Unparseable progress file for job {} ({} in a row): {}",
                    self.job_id,
                    self.parse_failures,
                    e
                );
                let max = self.services.config.max_parse_failures;
                if self.parse_failures >= max {
                    Err(JobFailure::CorruptProgressFile {
                        attempts: self.parse_failures,
                        detail: e.to_string(),
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    fn apply(&mut self, mut report: ProgressReport) {
        let marker = report.marker();
        if self.last_marker == Some(marker) {
            return;
        }
        self.last_marker = Some(marker);
        self.last_change = Instant::now();

        // A shorter history means the worker started over.
        if report.metrics_history.len() < self.last_sent {
            self.last_sent = 0;
        }
        let delta = report.metrics_history.split_off(self.last_sent);
        self.last_sent += delta.len();

        if !delta.is_empty() {
            self.services
                .gateway
                .persist_metrics(self.job_id, self.token.clone(), delta.clone());
        }

        let seq = self.next_seq();
        self.last_report = Some(ProgressReport {
            metrics_history: Vec::new(),
            ..report.clone()
        });
        report.metrics_history = delta;
        if let Err(e) = self.orchestrator.send_message(OrchestratorMessage::Progress {
            job_id: self.job_id,
            seq,
            report: Box::new(report),
        }) {
            tracing::warn!("Cannot forward progress of job {}: {}", self.job_id, e);
        }
    }

    /// The outcome if the worker has exited.
    fn exit_outcome(&mut self) -> Option<JobOutcome> {
        let detail = self.last_report.as_ref().and_then(|r| r.error.clone());
        match &mut self.target {
            MonitorTarget::Child(process) => match process.try_wait() {
                Ok(Some(status)) => Some(match process::exit_failure(status, detail) {
                    None => JobOutcome::Completed,
                    Some(failure) => JobOutcome::Failed(failure),
                }),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("Cannot poll worker of job {}: {}", self.job_id, e);
                    None
                }
            },
            MonitorTarget::Pid(pid) => {
                if process::is_alive(*pid) {
                    return None;
                }
                let phase = self.last_report.as_ref().map(|r| r.status);
                Some(match phase {
                    Some(WorkerPhase::Completed) => JobOutcome::Completed,
                    Some(WorkerPhase::Failed) => JobOutcome::Failed(JobFailure::Reported(
                        detail.unwrap_or_else(|| "no detail".into()),
                    )),
                    _ => JobOutcome::Failed(JobFailure::Lost),
                })
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        let processes = &self.services.processes;
        let outcome = match &mut self.target {
            MonitorTarget::Child(process) => processes.terminate(process, grace).await,
            MonitorTarget::Pid(pid) => processes.terminate_pid(*pid, grace).await,
        };
        if let TerminationOutcome::Failed(_) = outcome
            && let Err(e) = processes.kill_by_command_line(self.job_id)
        {
            tracing::error!("Last-resort kill for job {} failed: {}", self.job_id, e);
        }
    }

    /// Final read, then report the outcome and stop.
    async fn finalize(&mut self, myself: &ActorRef<MonitorMessage>, outcome: JobOutcome) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Err(failure) = self.read_progress().await {
            tracing::debug!("Final progress read for job {} failed: {}", self.job_id, failure);
        }

        tracing::info!("Job {} finished: {:?}", self.job_id, outcome);
        let seq = self.next_seq();
        if let Err(e) = self.orchestrator.send_message(OrchestratorMessage::Finished {
            job_id: self.job_id,
            seq,
            outcome,
        }) {
            tracing::error!("Cannot report outcome of job {}: {}", self.job_id, e);
        }
        myself.stop(None);
    }
}

/// Monitor actor.
pub struct MonitorActor;

impl Actor for MonitorActor {
    type Msg = MonitorMessage;
    type State = MonitorState;
    type Arguments = MonitorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Monitoring job {} (pid {})",
            args.job_id,
            args.target.pid()
        );

        let interval = args.services.config.poll_interval;
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if myself_clone.send_message(MonitorMessage::Poll).is_err() {
                    break;
                }
            }
        });

        Ok(MonitorState::new(args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if state.finished {
            return Ok(());
        }

        match message {
            MonitorMessage::Poll => {
                if let Err(failure) = state.read_progress().await {
                    state.terminate(state.services.config.cancel_grace).await;
                    state.finalize(&myself, JobOutcome::Failed(failure)).await;
                    return Ok(());
                }

                if let Some(outcome) = state.exit_outcome() {
                    state.finalize(&myself, outcome).await;
                    return Ok(());
                }

                let stale = state.last_change.elapsed();
                let timeout = state.services.config.stale_timeout;
                if stale > timeout {
                    tracing::warn!(
                        "Job {} made no progress for {:?}, terminating",
                        state.job_id,
                        stale
                    );
                    state.terminate(state.services.config.cancel_grace).await;
                    let failure = JobFailure::Timeout {
                        stale_secs: stale.as_secs(),
                        timeout_secs: timeout.as_secs(),
                    };
                    state.finalize(&myself, JobOutcome::Failed(failure)).await;
                }
            }

            MonitorMessage::Stop { kind } => {
                let (grace, outcome) = match kind {
                    StopKind::Cancel => (state.services.config.cancel_grace, JobOutcome::Cancelled),
                    StopKind::Pause => (state.services.config.pause_grace, JobOutcome::Paused),
                };
                tracing::info!("Stopping job {} ({:?})", state.job_id, kind);
                state.terminate(grace).await;
                state.finalize(&myself, outcome).await;
            }

            MonitorMessage::Detach => {
                tracing::info!(
                    "Detaching from job {}, worker {} keeps running",
                    state.job_id,
                    state.target.pid()
                );
                state.finished = true;
                myself.stop(None);
            }
        }

        Ok(())
    }
}
