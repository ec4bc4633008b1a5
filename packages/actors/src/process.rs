//! Worker process supervision.
//!
//! Each worker runs in its own session, so the whole process group can be
//! signalled without touching the orchestrator, and a worker survives an
//! orchestrator restart.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use queue_core::{JobFailure, JobId, JobRecord};
use tokio::fs;
use tokio::process::{Child, Command};

use crate::config::{OrchestratorConfig, WorkerCommand};
use crate::layout::{DataLayout, JobPaths};

/// Time allowed for a process to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Liveness poll step while waiting on a bare PID.
const PID_POLL: Duration = Duration::from_millis(100);
const RESET_TIMEOUT: Duration = Duration::from_secs(60);

/// Process errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to write worker config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Failed to signal process {pid}: {source}")]
    Signal { pid: u32, source: nix::Error },

    #[error("Failed to scan processes: {0}")]
    Scan(String),
}

/// A worker process started by this orchestrator.
#[derive(Debug)]
pub struct WorkerProcess {
    pub child: Child,
    pub pid: u32,
}

impl WorkerProcess {
    /// Exit status if the process has exited.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }
}

/// How a termination request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process was already gone.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Forced,
    /// Still alive after every escalation step.
    Failed(String),
}

impl TerminationOutcome {
    /// Whether the process is known to be gone.
    pub fn is_stopped(&self) -> bool {
        !matches!(self, TerminationOutcome::Failed(_))
    }
}

/// A worker found in the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub pid: u32,
    pub job_id: JobId,
}

/// Spawns, signals and finds worker processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    layout: DataLayout,
    worker: WorkerCommand,
    metrics_url: Option<String>,
    accelerator_reset: Option<Vec<String>>,
}

impl ProcessSupervisor {
    pub fn new(layout: DataLayout, worker: WorkerCommand) -> Self {
        Self {
            layout,
            worker,
            metrics_url: None,
            accelerator_reset: None,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            layout: DataLayout::new(&config.data_dir),
            worker: config.worker.clone(),
            metrics_url: config.metrics_url.clone(),
            accelerator_reset: config.accelerator_reset.clone(),
        }
    }

    pub fn with_metrics_url(mut self, url: impl Into<String>) -> Self {
        self.metrics_url = Some(url.into());
        self
    }

    pub fn with_accelerator_reset(mut self, command: Vec<String>) -> Self {
        self.accelerator_reset = Some(command);
        self
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Start the worker for `job`.
    ///
    /// Writes the job config, then launches the worker in a new session with
    /// stdout and stderr appended to the job log.
    pub async fn spawn(
        &self,
        job: &JobRecord,
        execution_id: &str,
    ) -> Result<WorkerProcess, ProcessError> {
        let paths = self.layout.job(job.id);
        fs::create_dir_all(&paths.output_dir).await?;
        fs::create_dir_all(self.layout.logs_dir()).await?;
        fs::create_dir_all(self.layout.configs_dir()).await?;
        write_atomic(&paths.config, &serde_json::to_vec_pretty(&job.config)?).await?;

        let mut command = self.command(job, execution_id, &paths)?;
        let child = command
            .spawn()
            .map_err(|e| ProcessError::Spawn(format!("{}: {}", self.worker.program.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Spawn("worker exited before reporting a PID".into()))?;

        tracing::info!(
            "Spawned worker for job {} (pid {}, execution {})",
            job.id,
            pid,
            execution_id
        );

        Ok(WorkerProcess { child, pid })
    }

    fn command(
        &self,
        job: &JobRecord,
        execution_id: &str,
        paths: &JobPaths,
    ) -> Result<Command, ProcessError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.log)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&self.worker.program);
        command
            .args(&self.worker.args)
            .arg("--config")
            .arg(&paths.config)
            .arg("--job-id")
            .arg(job.id.to_string())
            .arg("--execution-id")
            .arg(execution_id);
        if let Some(checkpoint) = &job.resume_checkpoint {
            command.arg("--resume-from").arg(checkpoint);
            command.env("RESUME_FROM_CHECKPOINT", checkpoint);
        }

        command
            .env("JOB_ID", job.id.to_string())
            .env("OWNER_ID", &job.owner_id)
            .env("JOB_TOKEN", &job.token)
            .env("OUTPUT_DIR", &paths.output_dir)
            .env("PROGRESS_FILE", &paths.progress);
        if let Some(url) = &self.metrics_url {
            command.env("METRICS_URL", url);
        }

        command
            .current_dir(&paths.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // New session: the worker leads its own process group and is not
        // signalled together with the orchestrator.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                Ok(())
            });
        }

        Ok(command)
    }

    /// Stop a worker we hold a handle to.
    ///
    /// SIGTERM to the process group, wait up to `grace`, then SIGKILL the
    /// group and finally the PID itself.
    pub async fn terminate(&self, process: &mut WorkerProcess, grace: Duration) -> TerminationOutcome {
        let outcome = terminate_child(process, grace).await;
        self.after_termination(process.pid, &outcome).await;
        outcome
    }

    /// Stop a worker known only by PID.
    pub async fn terminate_pid(&self, pid: u32, grace: Duration) -> TerminationOutcome {
        let outcome = terminate_bare_pid(pid, grace).await;
        self.after_termination(pid, &outcome).await;
        outcome
    }

    async fn after_termination(&self, pid: u32, outcome: &TerminationOutcome) {
        match outcome {
            TerminationOutcome::Failed(reason) => {
                tracing::error!("Could not terminate worker {}: {}", pid, reason);
            }
            other => tracing::info!("Worker {} terminated: {:?}", pid, other),
        }
        self.reset_accelerator().await;
    }

    /// Last-resort SIGKILL to a PID and its group.
    pub fn kill_by_pid(&self, pid: u32) -> Result<(), ProcessError> {
        let target = Pid::from_raw(pid as i32);
        let _ = signal::killpg(target, Signal::SIGKILL);
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }

    /// Kill every worker process whose command line names `job_id`.
    ///
    /// Returns the PIDs that were signalled.
    pub fn kill_by_command_line(&self, job_id: JobId) -> Result<Vec<u32>, ProcessError> {
        let mut killed = Vec::new();
        for worker in find_worker_processes()? {
            if worker.job_id == job_id {
                tracing::warn!("Killing worker {} of job {} by command line", worker.pid, job_id);
                self.kill_by_pid(worker.pid)?;
                killed.push(worker.pid);
            }
        }
        Ok(killed)
    }

    /// Run the configured accelerator reset command, if any.
    pub async fn reset_accelerator(&self) {
        let Some((program, args)) = self
            .accelerator_reset
            .as_ref()
            .and_then(|c| c.split_first())
        else {
            return;
        };

        let run = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        match tokio::time::timeout(RESET_TIMEOUT, run).await {
            Ok(Ok(output)) if output.status.success() => {
                tracing::debug!("Accelerator reset completed");
            }
            Ok(Ok(output)) => tracing::warn!(
                "Accelerator reset exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Ok(Err(e)) => tracing::warn!("Accelerator reset failed to start: {}", e),
            Err(_) => tracing::warn!("Accelerator reset timed out"),
        }
    }
}

async fn terminate_child(process: &mut WorkerProcess, grace: Duration) -> TerminationOutcome {
    match process.child.try_wait() {
        Ok(Some(_)) => return TerminationOutcome::AlreadyExited,
        Ok(None) => {}
        Err(e) => tracing::warn!("Cannot poll worker {}: {}", process.pid, e),
    }

    signal_group(process.pid, Signal::SIGTERM);
    if tokio::time::timeout(grace, process.child.wait()).await.is_ok() {
        return TerminationOutcome::Graceful;
    }

    tracing::warn!(
        "Worker {} ignored SIGTERM for {:?}, sending SIGKILL",
        process.pid,
        grace
    );
    signal_group(process.pid, Signal::SIGKILL);
    if tokio::time::timeout(KILL_WAIT, process.child.wait()).await.is_ok() {
        return TerminationOutcome::Forced;
    }

    if let Err(e) = process.child.start_kill() {
        return TerminationOutcome::Failed(format!("kill failed: {}", e));
    }
    match tokio::time::timeout(KILL_WAIT, process.child.wait()).await {
        Ok(_) => TerminationOutcome::Forced,
        Err(_) => TerminationOutcome::Failed("process survived SIGKILL".into()),
    }
}

async fn terminate_bare_pid(pid: u32, grace: Duration) -> TerminationOutcome {
    if !is_alive(pid) {
        return TerminationOutcome::AlreadyExited;
    }

    signal_group(pid, Signal::SIGTERM);
    if wait_for_exit(pid, grace).await {
        return TerminationOutcome::Graceful;
    }

    signal_group(pid, Signal::SIGKILL);
    if wait_for_exit(pid, KILL_WAIT).await {
        return TerminationOutcome::Forced;
    }

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::Error::ESRCH) => {}
        Err(e) => return TerminationOutcome::Failed(format!("kill failed: {}", e)),
    }
    if wait_for_exit(pid, KILL_WAIT).await {
        TerminationOutcome::Forced
    } else {
        TerminationOutcome::Failed("process survived SIGKILL".into())
    }
}

/// Signal the process group led by `pid`, falling back to the PID alone.
fn signal_group(pid: u32, sig: Signal) {
    let target = Pid::from_raw(pid as i32);
    let pgid = nix::unistd::getpgid(Some(target)).unwrap_or(target);
    if let Err(e) = signal::killpg(pgid, sig) {
        tracing::debug!("Cannot send {} to group {}: {}", sig, pgid, e);
        if let Err(e) = signal::kill(target, sig) {
            tracing::debug!("Cannot send {} to {}: {}", sig, pid, e);
        }
    }
}

async fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PID_POLL).await;
    }
}

/// Whether `pid` names a live, non-zombie process.
pub fn is_alive(pid: u32) -> bool {
    if signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match psutil::process::Process::new(pid).and_then(|p| p.status()) {
        Ok(psutil::process::Status::Zombie) | Ok(psutil::process::Status::Dead) => false,
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Worker invocations currently in the process table.
///
/// A worker is any process whose arguments contain `--job-id <ulid>`.
pub fn find_worker_processes() -> Result<Vec<WorkerInfo>, ProcessError> {
    let own_pid = std::process::id();
    let processes =
        psutil::process::processes().map_err(|e| ProcessError::Scan(e.to_string()))?;

    let mut workers = Vec::new();
    for process in processes.into_iter().flatten() {
        if process.pid() == own_pid {
            continue;
        }
        let Ok(Some(args)) = process.cmdline_vec() else {
            continue;
        };
        if let Some(job_id) = job_id_from_args(&args) {
            workers.push(WorkerInfo {
                pid: process.pid(),
                job_id,
            });
        }
    }

    Ok(workers)
}

fn job_id_from_args(args: &[String]) -> Option<JobId> {
    args.windows(2)
        .find(|pair| pair[0] == "--job-id")
        .and_then(|pair| JobId::parse(&pair[1]).ok())
}

/// Failure described by a worker exit status, `None` for a clean exit.
pub fn exit_failure(status: ExitStatus, detail: Option<String>) -> Option<JobFailure> {
    if status.success() {
        return None;
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Some(JobFailure::ExitCode { code, detail }),
        (None, Some(signal)) => Some(JobFailure::Signal { signal, detail }),
        (None, None) => Some(JobFailure::Lost),
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut temp = PathBuf::from(path);
    temp.set_extension("json.tmp");
    fs::write(&temp, contents).await?;
    fs::rename(&temp, path).await
}
