//! Live event fan-out to per-job subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use queue_core::{JobEvent, JobId};
use tokio::sync::{Mutex, mpsc};

/// Buffer of each subscriber channel.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Identifies one subscription.
pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<JobEvent>,
}

type SubscriberSet = Arc<Mutex<Vec<Subscriber>>>;

/// Fans job events out to live subscribers.
///
/// A subscriber whose channel is full or closed is dropped on the next
/// broadcast; slow consumers lose their stream rather than stall others.
#[derive(Default)]
pub struct BroadcastHub {
    jobs: RwLock<HashMap<JobId, SubscriberSet>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, job_id: JobId) -> Option<SubscriberSet> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job_id)
            .cloned()
    }

    fn set_or_insert(&self, job_id: JobId) -> SubscriberSet {
        if let Some(set) = self.set(job_id) {
            return set;
        }
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id)
            .or_default()
            .clone()
    }

    /// Register an existing sender for `job_id`.
    pub async fn connect(&self, job_id: JobId, tx: mpsc::Sender<JobEvent>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.set_or_insert(job_id)
            .lock()
            .await
            .push(Subscriber { id, tx });
        tracing::debug!("Subscriber {} connected to job {}", id, job_id);
        id
    }

    /// Open a new subscription channel for `job_id`.
    pub async fn subscribe(&self, job_id: JobId) -> (SubscriberId, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.connect(job_id, tx).await;
        (id, rx)
    }

    pub async fn disconnect(&self, job_id: JobId, id: SubscriberId) {
        let Some(set) = self.set(job_id) else {
            return;
        };
        set.lock().await.retain(|s| s.id != id);
    }

    /// Send `event` to every subscriber of `job_id`.
    ///
    /// Returns the number of subscribers that received it.
    pub async fn broadcast(&self, job_id: JobId, event: JobEvent) -> usize {
        let Some(set) = self.set(job_id) else {
            return 0;
        };

        let targets: Vec<(SubscriberId, mpsc::Sender<JobEvent>)> = set
            .lock()
            .await
            .iter()
            .map(|s| (s.id, s.tx.clone()))
            .collect();

        let mut failed = Vec::new();
        for (id, tx) in &targets {
            if tx.try_send(event.clone()).is_err() {
                failed.push(*id);
            }
        }

        if !failed.is_empty() {
            tracing::debug!(
                "Dropping {} subscribers of job {} after failed send",
                failed.len(),
                job_id
            );
            set.lock().await.retain(|s| !failed.contains(&s.id));
        }

        targets.len() - failed.len()
    }

    /// Send the final event of a job and end every stream.
    pub async fn complete(&self, job_id: JobId, event: JobEvent) {
        let set = self
            .jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
        let Some(set) = set else {
            return;
        };

        let subscribers = std::mem::take(&mut *set.lock().await);
        for subscriber in subscribers {
            let _ = subscriber.tx.try_send(event.clone());
        }
    }

    /// Number of live subscribers of `job_id`.
    pub async fn subscriber_count(&self, job_id: JobId) -> usize {
        match self.set(job_id) {
            Some(set) => set.lock().await.len(),
            None => 0,
        }
    }

    /// Drop the subscriber set of a job evicted from memory.
    pub fn forget(&self, job_id: JobId) {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job_id);
    }
}
