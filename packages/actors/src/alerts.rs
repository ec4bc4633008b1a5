//! Alert notifications for job lifecycle events.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use queue_core::{JobId, JobStatus};

/// Future type for alert delivery.
pub type AlertFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Kinds of alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Started,
    Completed,
    Failed,
    Cancelled,
    /// The worker was killed by the system, usually out of memory.
    ResourceExhausted,
}

impl AlertKind {
    /// Alert for a job reaching `status`, if that status is alerted on.
    pub fn for_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Running => Some(AlertKind::Started),
            JobStatus::Completed => Some(AlertKind::Completed),
            JobStatus::Failed => Some(AlertKind::Failed),
            JobStatus::Cancelled => Some(AlertKind::Cancelled),
            _ => None,
        }
    }
}

/// One alert.
#[derive(Debug, Clone)]
pub struct Alert {
    pub kind: AlertKind,
    pub job_id: JobId,
    pub owner_id: String,
    pub message: Option<String>,
}

/// Receives alerts. Delivery is fire-and-forget.
pub trait AlertSink: Send + Sync + 'static {
    fn send(&self, alert: Alert) -> AlertFuture;
}

/// Alert sink that only logs.
#[derive(Debug, Default, Clone)]
pub struct TracingAlerts;

impl AlertSink for TracingAlerts {
    fn send(&self, alert: Alert) -> AlertFuture {
        Box::pin(async move {
            match alert.kind {
                AlertKind::Failed | AlertKind::ResourceExhausted => tracing::warn!(
                    "Alert {:?} for job {} (owner {}): {}",
                    alert.kind,
                    alert.job_id,
                    alert.owner_id,
                    alert.message.as_deref().unwrap_or("-")
                ),
                _ => tracing::info!(
                    "Alert {:?} for job {} (owner {})",
                    alert.kind,
                    alert.job_id,
                    alert.owner_id
                ),
            }
        })
    }
}

/// Deliver `alert` on a spawned task.
pub fn dispatch(sink: &Arc<dyn AlertSink>, alert: Alert) {
    let sink = sink.clone();
    tokio::spawn(async move { sink.send(alert).await });
}
