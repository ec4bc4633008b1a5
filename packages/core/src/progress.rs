//! The worker's progress-file contract and metric points.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Resource usage reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram_mb: Option<f64>,
}

/// Progress fields mirrored into the job record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobProgress {
    /// 0-100.
    pub progress_percent: f64,
    pub epoch: Option<u32>,
    pub total_epochs: Option<u32>,
    pub step: u64,
    pub total_steps: Option<u64>,
    pub loss: Option<f64>,
    pub eval_loss: Option<f64>,
    pub learning_rate: Option<f64>,
    pub resources: ResourceUsage,
}

/// One point of the metrics history, keyed by training step.
///
/// Unknown metric names are kept in `extra` so the orchestrator never has to
/// know every metric a worker might emit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetricPoint {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            ..Default::default()
        }
    }

    pub fn with_train_loss(mut self, loss: f64) -> Self {
        self.train_loss = Some(loss);
        self
    }

    pub fn with_eval_loss(mut self, loss: f64) -> Self {
        self.eval_loss = Some(loss);
        self
    }

    /// Merge the non-null fields of `other` into `self`.
    pub fn merge(&mut self, other: &MetricPoint) {
        fn take(into: &mut Option<f64>, from: Option<f64>) {
            if from.is_some() {
                *into = from;
            }
        }
        take(&mut self.epoch, other.epoch);
        take(&mut self.train_loss, other.train_loss);
        take(&mut self.eval_loss, other.eval_loss);
        take(&mut self.learning_rate, other.learning_rate);
        take(&mut self.grad_norm, other.grad_norm);
        for (key, value) in &other.extra {
            if !value.is_null() {
                self.extra.insert(key.clone(), value.clone());
            }
        }
    }

    /// Merge `batch` into `history` by step, keeping `history` sorted.
    ///
    /// A point for an existing step updates that point instead of adding a
    /// second one, so resending a batch is harmless.
    pub fn merge_batch(history: &mut Vec<MetricPoint>, batch: &[MetricPoint]) {
        for point in batch {
            match history.binary_search_by_key(&point.step, |p| p.step) {
                Ok(index) => history[index].merge(point),
                Err(index) => history.insert(index, point.clone()),
            }
        }
    }

    /// The non-null fields as a flat JSON object, including `step`.
    pub fn to_patch(&self) -> Map<String, Value> {
        let mut patch = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        patch.retain(|_, value| !value.is_null());
        patch
    }
}

/// Phase reported by the worker in its progress file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Initializing,
    #[default]
    Running,
    Saving,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

/// Parsed content of a worker's `progress.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressReport {
    pub status: WorkerPhase,
    pub epoch: Option<u32>,
    pub total_epochs: Option<u32>,
    pub step: Option<u64>,
    pub total_steps: Option<u64>,
    pub progress: Option<f64>,
    pub loss: Option<f64>,
    pub eval_loss: Option<f64>,
    pub learning_rate: Option<f64>,
    pub resources: Option<ResourceUsage>,
    pub metrics_history: Vec<MetricPoint>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// What identifies a "meaningful" change between two progress reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMarker {
    pub updated_at: Option<DateTime<Utc>>,
    pub step: Option<u64>,
    pub history_len: usize,
    pub status: WorkerPhase,
}

impl ProgressReport {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn marker(&self) -> ProgressMarker {
        ProgressMarker {
            updated_at: self.updated_at,
            step: self.step,
            history_len: self.metrics_history.len(),
            status: self.status,
        }
    }

    /// Progress percentage, derived from the step counters if not reported.
    pub fn progress_percent(&self) -> Option<f64> {
        if let Some(progress) = self.progress {
            return Some(progress.clamp(0.0, 100.0));
        }
        match (self.step, self.total_steps) {
            (Some(step), Some(total)) if total > 0 => {
                Some((step as f64 / total as f64 * 100.0).min(100.0))
            }
            _ => None,
        }
    }

    /// Copy the fields the worker reported into `progress`.
    pub fn copy_into(&self, progress: &mut JobProgress) {
        if let Some(percent) = self.progress_percent() {
            progress.progress_percent = percent;
        }
        if self.epoch.is_some() {
            progress.epoch = self.epoch;
        }
        if self.total_epochs.is_some() {
            progress.total_epochs = self.total_epochs;
        }
        if let Some(step) = self.step {
            progress.step = step;
        }
        if self.total_steps.is_some() {
            progress.total_steps = self.total_steps;
        }
        if self.loss.is_some() {
            progress.loss = self.loss;
        }
        if self.eval_loss.is_some() {
            progress.eval_loss = self.eval_loss;
        }
        if self.learning_rate.is_some() {
            progress.learning_rate = self.learning_rate;
        }
        if let Some(resources) = &self.resources {
            progress.resources = resources.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merging_same_step_keeps_one_record_with_both_fields() {
        let mut history = Vec::new();
        MetricPoint::merge_batch(&mut history, &[MetricPoint::new(1000).with_train_loss(0.9)]);
        MetricPoint::merge_batch(&mut history, &[MetricPoint::new(1000).with_eval_loss(1.1)]);

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].train_loss, Some(0.9));
        assert_eq!(history[0].eval_loss, Some(1.1));
    }

    #[test]
    fn merge_batch_keeps_step_order() {
        let mut history = vec![MetricPoint::new(10), MetricPoint::new(30)];
        MetricPoint::merge_batch(&mut history, &[MetricPoint::new(20), MetricPoint::new(5)]);
        let steps: Vec<u64> = history.iter().map(|p| p.step).collect();
        assert_eq!(steps, vec![5, 10, 20, 30]);
    }

    #[test]
    fn extra_metrics_survive_and_null_does_not_erase() {
        let mut point: MetricPoint =
            serde_json::from_value(json!({ "step": 7, "bleu": 0.4 })).unwrap();
        let update: MetricPoint =
            serde_json::from_value(json!({ "step": 7, "bleu": null, "rouge": 0.2 })).unwrap();
        point.merge(&update);
        assert_eq!(point.extra.get("bleu"), Some(&json!(0.4)));
        assert_eq!(point.extra.get("rouge"), Some(&json!(0.2)));
    }

    #[test]
    fn patch_omits_missing_fields() {
        let patch = MetricPoint::new(3).with_eval_loss(0.5).to_patch();
        assert_eq!(patch.get("step"), Some(&json!(3)));
        assert_eq!(patch.get("eval_loss"), Some(&json!(0.5)));
        assert!(!patch.contains_key("train_loss"));
    }

    #[test]
    fn parses_worker_progress_file() {
        let raw = json!({
            "status": "running",
            "epoch": 1,
            "total_epochs": 3,
            "step": 50,
            "total_steps": 200,
            "loss": 1.5,
            "resources": { "gpu_memory_mb": 2048.0 },
            "metrics_history": [{ "step": 50, "train_loss": 1.5 }],
            "updated_at": "2026-01-01T00:00:00Z",
            "some_future_field": true
        });
        let report = ProgressReport::parse(raw.to_string().as_bytes()).unwrap();
        assert_eq!(report.status, WorkerPhase::Running);
        assert_eq!(report.progress_percent(), Some(25.0));

        let mut progress = JobProgress::default();
        report.copy_into(&mut progress);
        assert_eq!(progress.step, 50);
        assert_eq!(progress.loss, Some(1.5));
        assert_eq!(progress.resources.gpu_memory_mb, Some(2048.0));
    }

    #[test]
    fn unknown_phase_is_tolerated() {
        let report = ProgressReport::parse(br#"{"status":"warming_up"}"#).unwrap();
        assert_eq!(report.status, WorkerPhase::Unknown);
    }

    #[test]
    fn truncated_file_is_an_error() {
        assert!(ProgressReport::parse(br#"{"status":"run"#).is_err());
    }
}
