//! Remote store clients.
//!
//! The remote store keeps the durable job record and the metric history.
//! Two backends implement [`RemoteStore`]: an HTTP client and an embedded
//! SurrealDB database.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use db::repositories::{JobRepository, MetricRepository};
use db::{Database, DbError};
use queue_core::{JobId, JobSnapshot, JobStatus, MetricPoint};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Future type for store calls.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Remote store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Network failure, timeout or server error; worth retrying.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Malformed store response: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Durable storage for job snapshots and metrics.
pub trait RemoteStore: Send + Sync + 'static {
    /// Insert or replace a job snapshot.
    fn upsert_job<'a>(&'a self, snapshot: &'a JobSnapshot) -> StoreFuture<'a, ()>;

    /// Merge a batch of metric points, authenticated by the job token.
    fn append_metrics<'a>(
        &'a self,
        job_id: JobId,
        token: &'a str,
        batch: &'a [MetricPoint],
    ) -> StoreFuture<'a, ()>;

    fn get_job(&self, job_id: JobId) -> StoreFuture<'_, Option<JobSnapshot>>;

    /// Jobs whose status is one of `statuses`, oldest first.
    fn list_jobs<'a>(&'a self, statuses: &'a [JobStatus]) -> StoreFuture<'a, Vec<JobSnapshot>>;

    /// Metric history of a job ordered by step.
    fn list_metrics(&self, job_id: JobId) -> StoreFuture<'_, Vec<MetricPoint>>;
}

#[derive(Serialize)]
struct MetricBatch<'a> {
    points: &'a [MetricPoint],
}

#[derive(Deserialize)]
struct JobList {
    jobs: Vec<JobSnapshot>,
}

#[derive(Deserialize)]
struct MetricList {
    points: Vec<MetricPoint>,
}

/// Remote store reached over HTTP.
#[derive(Clone)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteStore {
    /// Create a client for `base_url` with the given request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    /// Send `X-Api-Key` with every request.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.api_key {
            Some(key) => builder.header("X-Api-Key", key),
            None => builder,
        }
    }

    async fn send(builder: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status, message))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }
}

fn classify_status(status: StatusCode, message: String) -> StoreError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StoreError::Unavailable(format!("HTTP {}: {}", status, message))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        StoreError::Unauthorized(format!("HTTP {}: {}", status, message))
    } else {
        StoreError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

fn not_found_as_rejected(response: &reqwest::Response) -> Result<(), StoreError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Err(StoreError::Rejected {
            status: StatusCode::NOT_FOUND.as_u16(),
            message: format!("{} not found", response.url().path()),
        });
    }
    Ok(())
}

impl RemoteStore for HttpRemoteStore {
    fn upsert_job<'a>(&'a self, snapshot: &'a JobSnapshot) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = format!("/jobs/{}", snapshot.id);
            let response = Self::send(self.request(reqwest::Method::PUT, &path).json(snapshot)).await?;
            not_found_as_rejected(&response)
        })
    }

    fn append_metrics<'a>(
        &'a self,
        job_id: JobId,
        token: &'a str,
        batch: &'a [MetricPoint],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let path = format!("/jobs/{}/metrics", job_id);
            let builder = self
                .request(reqwest::Method::POST, &path)
                .bearer_auth(token)
                .json(&MetricBatch { points: batch });
            let response = Self::send(builder).await?;
            not_found_as_rejected(&response)
        })
    }

    fn get_job(&self, job_id: JobId) -> StoreFuture<'_, Option<JobSnapshot>> {
        Box::pin(async move {
            let path = format!("/jobs/{}", job_id);
            let response = Self::send(self.request(reqwest::Method::GET, &path)).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            Self::decode(response).await.map(Some)
        })
    }

    fn list_jobs<'a>(&'a self, statuses: &'a [JobStatus]) -> StoreFuture<'a, Vec<JobSnapshot>> {
        Box::pin(async move {
            let filter = statuses
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let builder = self
                .request(reqwest::Method::GET, "/jobs")
                .query(&[("status", filter)]);
            let response = Self::send(builder).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let list: JobList = Self::decode(response).await?;
            Ok(list.jobs)
        })
    }

    fn list_metrics(&self, job_id: JobId) -> StoreFuture<'_, Vec<MetricPoint>> {
        Box::pin(async move {
            let path = format!("/jobs/{}/metrics", job_id);
            let response = Self::send(self.request(reqwest::Method::GET, &path)).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(Vec::new());
            }
            let list: MetricList = Self::decode(response).await?;
            Ok(list.points)
        })
    }
}

/// Remote store backed by the embedded database.
#[derive(Clone)]
pub struct EmbeddedStore {
    db: Database,
}

impl EmbeddedStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Unauthorized(msg) => StoreError::Unauthorized(msg),
            DbError::NotFound(msg) => StoreError::Rejected {
                status: 404,
                message: msg,
            },
            DbError::Serialization(e) => StoreError::Decode(e.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl RemoteStore for EmbeddedStore {
    fn upsert_job<'a>(&'a self, snapshot: &'a JobSnapshot) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            JobRepository::upsert(&self.db, snapshot).await?;
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
            MetricRepository::merge_batch(&self.db, job_id, token, batch).await?;
            Ok(())
        })
    }

    fn get_job(&self, job_id: JobId) -> StoreFuture<'_, Option<JobSnapshot>> {
        Box::pin(async move { Ok(JobRepository::get(&self.db, job_id).await?) })
    }

    fn list_jobs<'a>(&'a self, statuses: &'a [JobStatus]) -> StoreFuture<'a, Vec<JobSnapshot>> {
        Box::pin(async move { Ok(JobRepository::list_by_status(&self.db, statuses).await?) })
    }

    fn list_metrics(&self, job_id: JobId) -> StoreFuture<'_, Vec<MetricPoint>> {
        Box::pin(async move { Ok(MetricRepository::list(&self.db, job_id).await?) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, String::new()),
            StoreError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad".into()),
            StoreError::Rejected { status: 422, .. }
        ));
    }

    #[test]
    fn test_db_error_mapping() {
        let e: StoreError = DbError::Unauthorized("token".into()).into();
        assert!(matches!(e, StoreError::Unauthorized(_)));
        let e: StoreError = DbError::Query("boom".into()).into();
        assert!(e.is_retryable());
    }

    #[tokio::test]
    async fn test_embedded_store_round_trip() {
        let database = db::init(db::DbConfig::memory()).await.unwrap();
        let store = EmbeddedStore::new(database);

        let record = queue_core::JobRecord::new(queue_core::Submission::new(
            "owner",
            serde_json::json!({}),
        ));
        let snapshot = record.snapshot();
        store.upsert_job(&snapshot).await.unwrap();

        let loaded = store.get_job(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, record.id);

        let batch = [MetricPoint::new(10).with_train_loss(1.5)];
        store
            .append_metrics(record.id, &record.token, &batch)
            .await
            .unwrap();
        let err = store
            .append_metrics(record.id, "wrong", &batch)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));

        assert_eq!(store.list_metrics(record.id).await.unwrap().len(), 1);
        assert_eq!(
            store.list_jobs(&[JobStatus::Queued]).await.unwrap().len(),
            1
        );
    }
}
