#![allow(clippy::disallowed_methods)]

mod common;

use std::time::Duration;

use actors::process::{self, find_worker_processes};
use actors::{DataLayout, ProcessSupervisor, TerminationOutcome, WorkerCommand};
use common::*;
use queue_core::{JobRecord, Submission};
use serde_json::json;

fn supervisor(dir: &std::path::Path, body: &str) -> ProcessSupervisor {
    let script = write_script(dir, body);
    ProcessSupervisor::new(
        DataLayout::new(dir.join("data")),
        WorkerCommand::new("/bin/sh").with_args([script.display().to_string()]),
    )
}

fn record() -> JobRecord {
    JobRecord::new(Submission::new("owner-1", json!({ "model": "tiny" })))
}

#[tokio::test]
async fn test_spawn_passes_job_context() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"
echo "$@" > "$OUTPUT_DIR/args.txt"
echo "$JOB_ID $OWNER_ID $JOB_TOKEN $METRICS_URL" > "$OUTPUT_DIR/env.txt"
pwd > "$OUTPUT_DIR/cwd.txt"
"#;
    let supervisor =
        supervisor(dir.path(), body).with_metrics_url("http://127.0.0.1:9000/metrics");
    let job = record();

    let mut worker = supervisor.spawn(&job, "exec-1").await.unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(status) = worker.try_wait().unwrap() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert!(status.success());

    let paths = supervisor.layout().job(job.id);
    let config: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&paths.config).unwrap()).unwrap();
    assert_eq!(config, job.config);

    let args = std::fs::read_to_string(paths.output_dir.join("args.txt")).unwrap();
    assert!(args.contains(&format!("--job-id {}", job.id)));
    assert!(args.contains("--execution-id exec-1"));
    assert!(!args.contains("--resume-from"));

    let env = std::fs::read_to_string(paths.output_dir.join("env.txt")).unwrap();
    assert_eq!(
        env.trim(),
        format!("{} owner-1 {} http://127.0.0.1:9000/metrics", job.id, job.token)
    );

    let cwd = std::fs::read_to_string(paths.output_dir.join("cwd.txt")).unwrap();
    assert!(cwd.trim().ends_with(&job.id.to_string()));
}

#[tokio::test]
async fn test_terminate_running_worker() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(dir.path(), RUNNING_WORKER);
    let job = record();

    let mut worker = supervisor.spawn(&job, "exec-1").await.unwrap();
    let pid = worker.pid;
    assert!(process::is_alive(pid));

    let found = find_worker_processes().unwrap();
    assert!(found.iter().any(|w| w.pid == pid && w.job_id == job.id));

    let outcome = supervisor.terminate(&mut worker, Duration::from_secs(2)).await;
    assert_eq!(outcome, TerminationOutcome::Graceful);
    assert!(!process::is_alive(pid));

    let outcome = supervisor.terminate(&mut worker, Duration::from_secs(2)).await;
    assert_eq!(outcome, TerminationOutcome::AlreadyExited);
}

#[tokio::test]
async fn test_worker_ignoring_sigterm_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let body = "trap '' TERM\nwhile true; do sleep 0.1; done\n";
    let marker = dir.path().join("reset.txt");
    let supervisor = supervisor(dir.path(), body).with_accelerator_reset(vec![
        "/bin/sh".into(),
        "-c".into(),
        format!("touch {}", marker.display()),
    ]);
    let job = record();

    let mut worker = supervisor.spawn(&job, "exec-1").await.unwrap();
    let pid = worker.pid;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = supervisor
        .terminate(&mut worker, Duration::from_millis(300))
        .await;
    assert_eq!(outcome, TerminationOutcome::Forced);
    assert!(!process::is_alive(pid));
    assert!(marker.exists());
}

#[tokio::test]
async fn test_terminate_by_pid() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(dir.path(), RUNNING_WORKER);
    let job = record();

    let worker = supervisor.spawn(&job, "exec-1").await.unwrap();
    let pid = worker.pid;
    // Without the handle only the PID is left.
    drop(worker);

    let outcome = supervisor.terminate_pid(pid, Duration::from_secs(2)).await;
    assert!(outcome.is_stopped(), "{outcome:?}");
    assert!(!process::is_alive(pid));
}

#[tokio::test]
async fn test_kill_by_command_line() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = supervisor(dir.path(), RUNNING_WORKER);
    let job = record();

    let worker = supervisor.spawn(&job, "exec-1").await.unwrap();
    let pid = worker.pid;
    drop(worker);

    let killed = supervisor.kill_by_command_line(job.id).unwrap();
    assert_eq!(killed, vec![pid]);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while process::is_alive(pid) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
