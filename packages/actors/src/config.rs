//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use db::DbConfig;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How the worker process is launched.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments placed before the orchestrator-supplied ones.
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new("python3").with_args(["-m", "trainer.worker"])
    }
}

/// Retry and cache settings for the persistence gateway.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Attempts per payload before it is cached.
    pub max_attempts: u32,
    /// First backoff delay; doubled on every retry.
    pub base_backoff: Duration,
    /// Maximum number of jobs with an undelivered payload.
    pub cache_capacity: usize,
    /// How often cached payloads are re-attempted.
    pub sweep_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            cache_capacity: 1000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Remote store backend.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// HTTP remote store.
    Http {
        base_url: String,
        api_key: Option<String>,
        timeout: Duration,
    },
    /// Embedded SurrealDB store.
    Embedded(DbConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Embedded(DbConfig::memory())
    }
}

/// Configuration for the orchestrator and its actors.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root for logs, outputs and configs.
    pub data_dir: PathBuf,
    pub worker: WorkerCommand,
    /// Progress file poll interval.
    pub poll_interval: Duration,
    /// A running job whose progress has not changed for this long is failed.
    pub stale_timeout: Duration,
    /// Consecutive unreadable progress files tolerated.
    pub max_parse_failures: u32,
    pub cancel_grace: Duration,
    pub pause_grace: Duration,
    /// How often the dispatcher asks for work.
    pub dispatch_interval: Duration,
    /// Bounded wait on the dispatch request.
    pub dequeue_wait: Duration,
    /// How long terminal jobs stay in memory.
    pub terminal_retention: Duration,
    /// How long logs and outputs of terminal jobs stay on disk.
    pub artifact_retention: Duration,
    pub health_interval: Duration,
    pub cleanup_interval: Duration,
    /// Maximum age of a record or progress file that recovery still trusts.
    pub recovery_threshold: Duration,
    /// URL handed to workers for metric submission.
    pub metrics_url: Option<String>,
    /// Command run after a worker is terminated to reset the accelerator.
    pub accelerator_reset: Option<Vec<String>>,
    pub persistence: PersistenceConfig,
    pub store: StoreConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            worker: WorkerCommand::default(),
            poll_interval: Duration::from_secs(2),
            stale_timeout: Duration::from_secs(30 * 60),
            max_parse_failures: 5,
            cancel_grace: Duration::from_secs(10),
            pause_grace: Duration::from_secs(120),
            dispatch_interval: Duration::from_secs(1),
            dequeue_wait: Duration::from_secs(5),
            terminal_retention: Duration::from_secs(60 * 60),
            artifact_retention: Duration::from_secs(7 * 24 * 60 * 60),
            health_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10 * 60),
            recovery_threshold: Duration::from_secs(5 * 60),
            metrics_url: None,
            accelerator_reset: None,
            persistence: PersistenceConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Create a config rooted at `data_dir` with default settings.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stale_timeout(mut self, timeout: Duration) -> Self {
        self.stale_timeout = timeout;
        self
    }

    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_grace(mut self, cancel: Duration, pause: Duration) -> Self {
        self.cancel_grace = cancel;
        self.pause_grace = pause;
        self
    }

    pub fn with_recovery_threshold(mut self, threshold: Duration) -> Self {
        self.recovery_threshold = threshold;
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Build a config from environment variables.
    ///
    /// Every setting is optional and falls back to its default:
    /// - `TUNEQ_DATA_DIR` (default: `./data`)
    /// - `TUNEQ_WORKER_PROGRAM`, `TUNEQ_WORKER_ARGS` (whitespace separated)
    /// - `TUNEQ_POLL_INTERVAL_MS`, `TUNEQ_STALE_TIMEOUT_SECS`, `TUNEQ_MAX_PARSE_FAILURES`
    /// - `TUNEQ_CANCEL_GRACE_SECS`, `TUNEQ_PAUSE_GRACE_SECS`
    /// - `TUNEQ_DISPATCH_INTERVAL_MS`, `TUNEQ_DEQUEUE_WAIT_MS`
    /// - `TUNEQ_TERMINAL_RETENTION_SECS`, `TUNEQ_ARTIFACT_RETENTION_SECS`
    /// - `TUNEQ_HEALTH_INTERVAL_SECS`, `TUNEQ_CLEANUP_INTERVAL_SECS`
    /// - `TUNEQ_RECOVERY_THRESHOLD_SECS`
    /// - `TUNEQ_METRICS_URL`, `TUNEQ_ACCELERATOR_RESET` (whitespace separated command)
    /// - `TUNEQ_PERSIST_MAX_ATTEMPTS`, `TUNEQ_PERSIST_BACKOFF_MS`,
    ///   `TUNEQ_PERSIST_CACHE_CAPACITY`, `TUNEQ_PERSIST_SWEEP_SECS`
    ///
    /// Store selection:
    /// - `TUNEQ_STORE` = `http` | `embedded` (default: `embedded`)
    /// - `TUNEQ_STORE_URL` (required for `http`), `TUNEQ_STORE_API_KEY`,
    ///   `TUNEQ_STORE_TIMEOUT_SECS` (default: 10)
    /// - `TUNEQ_DB_ENDPOINT` (embedded, default: `mem://`)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(dir) = env_string("TUNEQ_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(program) = env_string("TUNEQ_WORKER_PROGRAM") {
            cfg.worker = WorkerCommand::new(program);
        }
        if let Some(args) = env_string("TUNEQ_WORKER_ARGS") {
            cfg.worker.args = split_words(&args);
        }

        if let Some(ms) = env_parse::<u64>("TUNEQ_POLL_INTERVAL_MS")? {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_STALE_TIMEOUT_SECS")? {
            cfg.stale_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("TUNEQ_MAX_PARSE_FAILURES")? {
            cfg.max_parse_failures = n;
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_CANCEL_GRACE_SECS")? {
            cfg.cancel_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_PAUSE_GRACE_SECS")? {
            cfg.pause_grace = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("TUNEQ_DISPATCH_INTERVAL_MS")? {
            cfg.dispatch_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("TUNEQ_DEQUEUE_WAIT_MS")? {
            cfg.dequeue_wait = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_TERMINAL_RETENTION_SECS")? {
            cfg.terminal_retention = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_ARTIFACT_RETENTION_SECS")? {
            cfg.artifact_retention = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_HEALTH_INTERVAL_SECS")? {
            cfg.health_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_CLEANUP_INTERVAL_SECS")? {
            cfg.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_RECOVERY_THRESHOLD_SECS")? {
            cfg.recovery_threshold = Duration::from_secs(secs);
        }

        cfg.metrics_url = env_string("TUNEQ_METRICS_URL");
        cfg.accelerator_reset = env_string("TUNEQ_ACCELERATOR_RESET").map(|c| split_words(&c));

        if let Some(n) = env_parse::<u32>("TUNEQ_PERSIST_MAX_ATTEMPTS")? {
            cfg.persistence.max_attempts = n;
        }
        if let Some(ms) = env_parse::<u64>("TUNEQ_PERSIST_BACKOFF_MS")? {
            cfg.persistence.base_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<usize>("TUNEQ_PERSIST_CACHE_CAPACITY")? {
            cfg.persistence.cache_capacity = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("TUNEQ_PERSIST_SWEEP_SECS")? {
            cfg.persistence.sweep_interval = Duration::from_secs(secs);
        }

        cfg.store = read_store_config()?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the timers and retry loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("poll_interval", self.poll_interval),
            ("dispatch_interval", self.dispatch_interval),
            ("health_interval", self.health_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("persistence.sweep_interval", self.persistence.sweep_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.persistence.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "persistence.max_attempts must be at least 1".into(),
            ));
        }
        if self.max_parse_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_parse_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn read_store_config() -> Result<StoreConfig, ConfigError> {
    match env_string("TUNEQ_STORE").as_deref() {
        Some("http") => {
            let base_url = env_string("TUNEQ_STORE_URL").ok_or_else(|| {
                ConfigError::Invalid("TUNEQ_STORE_URL is required for the http store".into())
            })?;
            let timeout = env_parse::<u64>("TUNEQ_STORE_TIMEOUT_SECS")?.unwrap_or(10);
            Ok(StoreConfig::Http {
                base_url,
                api_key: env_string("TUNEQ_STORE_API_KEY"),
                timeout: Duration::from_secs(timeout),
            })
        }
        Some("embedded") | None => {
            let mut db = match (env_string("TUNEQ_DB_ENDPOINT"), env_string("TUNEQ_DB_PATH")) {
                (Some(endpoint), _) => DbConfig::endpoint(endpoint),
                (None, Some(path)) => DbConfig::rocksdb(path),
                (None, None) => DbConfig::memory(),
            };
            if let Some(namespace) = env_string("TUNEQ_DB_NAMESPACE") {
                db = db.with_namespace(namespace);
            }
            if let Some(database) = env_string("TUNEQ_DB_DATABASE") {
                db = db.with_database(database);
            }
            if let (Some(user), Some(pass)) =
                (env_string("TUNEQ_DB_USER"), env_string("TUNEQ_DB_PASSWORD"))
            {
                db = db.with_credentials(user, pass);
            }
            Ok(StoreConfig::Embedded(db))
        }
        Some(other) => Err(ConfigError::Invalid(format!(
            "unsupported TUNEQ_STORE={other} (expected http|embedded)"
        ))),
    }
}

fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok().and_then(non_empty)
}

fn env_parse<T>(var_name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(var_name) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("invalid value for {var_name}={v}: {e}"))),
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn split_words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.persistence.max_attempts, 3);
        assert!(cfg.cancel_grace < cfg.pause_grace);
        assert!(matches!(cfg.store, StoreConfig::Embedded(_)));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        assert!(OrchestratorConfig::default().validate().is_ok());

        let mut cfg = OrchestratorConfig::default();
        cfg.health_interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("health_interval"));

        let cfg = OrchestratorConfig::default().with_poll_interval(Duration::ZERO);
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.persistence.sweep_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.persistence.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words("  nvidia-smi  --gpu-reset "),
            vec!["nvidia-smi".to_string(), "--gpu-reset".to_string()]
        );
        assert!(split_words("   ").is_empty());
    }
}
