//! Persistence gateway: retrying writes to the remote store with a bounded
//! cache of undelivered payloads.
//!
//! Writes for one job go through that job's lane, so a payload cached after
//! an outage is always delivered before anything newer for the same job.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use lru::LruCache;
use queue_core::{JobId, JobSnapshot, MetricPoint};
use tokio::task::JoinHandle;

use crate::config::PersistenceConfig;
use crate::remote::{RemoteStore, StoreError, StoreFuture};

/// Result of a persistence call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The store accepted the payload.
    Delivered,
    /// Delivery failed and the payload is waiting in the cache.
    Cached,
    /// The store refused the payload; it was dropped.
    Rejected(String),
}

/// Outcome of one pass over the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub delivered: usize,
    pub still_cached: usize,
    pub dropped: usize,
}

/// Data not yet accepted by the store for one job.
#[derive(Debug, Clone, Default)]
struct PendingPayload {
    snapshot: Option<JobSnapshot>,
    metrics: Option<(String, Vec<MetricPoint>)>,
}

impl PendingPayload {
    fn snapshot(snapshot: JobSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            metrics: None,
        }
    }

    fn metrics(token: String, batch: Vec<MetricPoint>) -> Self {
        Self {
            snapshot: None,
            metrics: Some((token, batch)),
        }
    }

    /// Fold a newer payload into this one.
    fn merge(&mut self, newer: PendingPayload) {
        if let Some(snapshot) = newer.snapshot
            && self
                .snapshot
                .as_ref()
                .is_none_or(|s| s.version <= snapshot.version)
        {
            self.snapshot = Some(snapshot);
        }

        if let Some((token, batch)) = newer.metrics {
            match &mut self.metrics {
                Some((existing_token, points)) => {
                    MetricPoint::merge_batch(points, &batch);
                    *existing_token = token;
                }
                None => self.metrics = Some((token, batch)),
            }
        }
    }
}

#[derive(Debug, Default)]
struct Lane {
    /// Highest snapshot version the store accepted.
    delivered_version: u64,
}

struct Inner {
    store: Arc<dyn RemoteStore>,
    config: PersistenceConfig,
    cache: Mutex<LruCache<JobId, PendingPayload>>,
    lanes: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<Lane>>>>,
}

/// Writes job snapshots and metric batches to the remote store.
///
/// Cheap to clone; clones share the cache and lanes.
#[derive(Clone)]
pub struct PersistenceGateway {
    inner: Arc<Inner>,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn RemoteStore>, config: PersistenceConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                cache: Mutex::new(LruCache::new(capacity)),
                lanes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.store
    }

    /// Persist a job snapshot in the background.
    pub fn persist_job(&self, snapshot: JobSnapshot) -> JoinHandle<Delivery> {
        let inner = self.inner.clone();
        let job_id = snapshot.id;
        tokio::spawn(async move { inner.deliver(job_id, PendingPayload::snapshot(snapshot)).await })
    }

    /// Persist a metric batch in the background.
    pub fn persist_metrics(
        &self,
        job_id: JobId,
        token: String,
        batch: Vec<MetricPoint>,
    ) -> JoinHandle<Delivery> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if batch.is_empty() {
                return Delivery::Delivered;
            }
            inner.deliver(job_id, PendingPayload::metrics(token, batch)).await
        })
    }

    /// Re-attempt every cached payload once.
    pub async fn sweep(&self) -> SweepReport {
        self.inner.sweep().await
    }

    /// Sweep the cache on a fixed interval until the gateway is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.cache_len() == 0 {
                    continue;
                }
                let report = inner.sweep().await;
                tracing::info!(
                    "Persistence sweep: {} attempted, {} delivered, {} still cached, {} dropped",
                    report.attempted,
                    report.delivered,
                    report.still_cached,
                    report.dropped
                );
            }
        })
    }

    /// Number of jobs with an undelivered payload.
    pub fn cache_len(&self) -> usize {
        self.inner.cache_len()
    }

    /// Whether `job_id` has an undelivered payload.
    pub fn is_cached(&self, job_id: JobId) -> bool {
        lock(&self.inner.cache).contains(&job_id)
    }

    /// Drop the lane of a job evicted from memory. A cached payload keeps
    /// the lane alive.
    pub fn forget(&self, job_id: JobId) {
        if !self.is_cached(job_id) {
            lock(&self.inner.lanes).remove(&job_id);
        }
    }
}

impl Inner {
    fn lane(&self, job_id: JobId) -> Arc<tokio::sync::Mutex<Lane>> {
        lock(&self.lanes).entry(job_id).or_default().clone()
    }

    fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    fn take_cached(&self, job_id: JobId) -> Option<PendingPayload> {
        lock(&self.cache).pop(&job_id)
    }

    /// Merge into the cache without refreshing the entry's age, so the
    /// oldest job is evicted first when full.
    fn cache(&self, job_id: JobId, payload: PendingPayload) {
        let mut cache = lock(&self.cache);
        if let Some(existing) = cache.peek_mut(&job_id) {
            existing.merge(payload);
            return;
        }
        if let Some((evicted, _)) = cache.push(job_id, payload)
            && evicted != job_id
        {
            tracing::warn!(
                "Persistence cache full, dropped undelivered payload of job {}",
                evicted
            );
        }
    }

    async fn deliver(&self, job_id: JobId, payload: PendingPayload) -> Delivery {
        let lane = self.lane(job_id);
        let mut lane = lane.lock().await;
        let attempts = self.config.max_attempts;

        if let Some(cached) = self.take_cached(job_id) {
            tracing::debug!("Delivering cached payload of job {} first", job_id);
            match self.send(job_id, &mut lane, cached, attempts).await {
                Ok(()) => {}
                Err((mut remaining, e)) if e.is_retryable() => {
                    remaining.merge(payload);
                    self.cache(job_id, remaining);
                    return Delivery::Cached;
                }
                Err((_, e)) => {
                    tracing::warn!("Dropping cached payload of job {}: {}", job_id, e);
                }
            }
        }

        match self.send(job_id, &mut lane, payload, attempts).await {
            Ok(()) => Delivery::Delivered,
            Err((remaining, e)) if e.is_retryable() => {
                tracing::warn!("Caching payload of job {} after failures: {}", job_id, e);
                self.cache(job_id, remaining);
                Delivery::Cached
            }
            Err((_, e)) => {
                tracing::warn!("Store rejected payload of job {}: {}", job_id, e);
                Delivery::Rejected(e.to_string())
            }
        }
    }

    async fn sweep(&self) -> SweepReport {
        let job_ids: Vec<JobId> = lock(&self.cache).iter().map(|(id, _)| *id).collect();
        let mut report = SweepReport::default();

        for job_id in job_ids {
            let lane = self.lane(job_id);
            let mut lane = lane.lock().await;
            // The entry stays in place while it is retried so a failed
            // sweep does not change the eviction order.
            let Some(payload) = lock(&self.cache).peek(&job_id).cloned() else {
                continue;
            };
            report.attempted += 1;

            match self.send(job_id, &mut lane, payload, 1).await {
                Ok(()) => {
                    self.take_cached(job_id);
                    report.delivered += 1;
                }
                Err((remaining, e)) if e.is_retryable() => {
                    if let Some(entry) = lock(&self.cache).peek_mut(&job_id) {
                        *entry = remaining;
                    }
                    report.still_cached += 1;
                }
                Err((_, e)) => {
                    tracing::warn!("Dropping cached payload of job {}: {}", job_id, e);
                    self.take_cached(job_id);
                    report.dropped += 1;
                }
            }
        }

        report
    }

    /// Send the snapshot, then the metrics. On failure returns whatever part
    /// was not delivered.
    async fn send(
        &self,
        job_id: JobId,
        lane: &mut Lane,
        payload: PendingPayload,
        attempts: u32,
    ) -> Result<(), (PendingPayload, StoreError)> {
        let PendingPayload { snapshot, metrics } = payload;

        if let Some(snapshot) = snapshot {
            if snapshot.version < lane.delivered_version {
                tracing::debug!(
                    "Skipping snapshot v{} of job {}, v{} already delivered",
                    snapshot.version,
                    job_id,
                    lane.delivered_version
                );
            } else {
                let result = self
                    .with_retry(attempts, || self.store.upsert_job(&snapshot))
                    .await;
                match result {
                    Ok(()) => lane.delivered_version = snapshot.version,
                    Err(e) => {
                        let remaining = PendingPayload {
                            snapshot: Some(snapshot),
                            metrics,
                        };
                        return Err((remaining, e));
                    }
                }
            }
        }

        if let Some((token, points)) = metrics
            && !points.is_empty()
        {
            let result = self
                .with_retry(attempts, || {
                    self.store.append_metrics(job_id, &token, &points)
                })
                .await;
            if let Err(e) = result {
                return Err((PendingPayload::metrics(token, points), e));
            }
        }

        Ok(())
    }

    /// Run `op` up to `attempts` times, backing off exponentially between
    /// retryable failures.
    async fn with_retry<'a, F>(&self, attempts: u32, op: F) -> Result<(), StoreError>
    where
        F: Fn() -> StoreFuture<'a, ()>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let backoff = self.config.base_backoff * (1u32 << attempt.min(16));
                    tracing::debug!(
                        "Store call failed (attempt {}): {}, retrying in {:?}",
                        attempt + 1,
                        e,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
