//! On-disk layout of job artifacts.
//!
//! ```text
//! <data_dir>/
//!   logs/<job_id>.log
//!   outputs/<job_id>/progress.json
//!   outputs/<job_id>/checkpoint-<step>/
//!   configs/<job_id>.json
//! ```

use std::io;
use std::path::{Path, PathBuf};

use queue_core::JobId;
use tokio::fs;

const PROGRESS_FILE: &str = "progress.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Root of the data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    /// Ensure the directory tree exists.
    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(self.logs_dir()).await?;
        fs::create_dir_all(self.outputs_dir()).await?;
        fs::create_dir_all(self.configs_dir()).await?;
        Ok(())
    }

    /// Paths belonging to a single job.
    pub fn job(&self, job_id: JobId) -> JobPaths {
        let output_dir = self.outputs_dir().join(job_id.to_string());
        JobPaths {
            log: self.logs_dir().join(format!("{}.log", job_id)),
            progress: output_dir.join(PROGRESS_FILE),
            config: self.configs_dir().join(format!("{}.json", job_id)),
            output_dir,
        }
    }

    /// Job IDs that have an output directory.
    pub async fn output_job_ids(&self) -> io::Result<Vec<JobId>> {
        let mut ids = Vec::new();
        let dir = self.outputs_dir();
        if !fs::try_exists(&dir).await? {
            return Ok(ids);
        }

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|s| JobId::parse(s).ok()) {
                ids.push(id);
            }
        }

        Ok(ids)
    }
}

/// Files and directories of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub log: PathBuf,
    pub output_dir: PathBuf,
    pub progress: PathBuf,
    pub config: PathBuf,
}

impl JobPaths {
    pub fn checkpoint(&self, step: u64) -> PathBuf {
        self.output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
    }

    /// Read the progress file, `None` if the worker has not written one yet.
    pub async fn read_progress(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.progress).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The checkpoint directory with the highest step number.
    ///
    /// Steps are compared numerically, so `checkpoint-1000` beats
    /// `checkpoint-900`.
    pub async fn latest_checkpoint(&self) -> io::Result<Option<PathBuf>> {
        if !fs::try_exists(&self.output_dir).await? {
            return Ok(None);
        }

        let mut best: Option<(u64, PathBuf)> = None;
        let mut entries = fs::read_dir(&self.output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(step) = name
                .to_str()
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if best.as_ref().is_none_or(|(b, _)| step > *b) {
                best = Some((step, entry.path()));
            }
        }

        Ok(best.map(|(_, path)| path))
    }

    /// Remove the log, output directory and config of this job.
    pub async fn remove_all(&self) -> io::Result<()> {
        remove_if_exists(&self.log).await?;
        remove_if_exists(&self.config).await?;
        match fs::remove_dir_all(&self.output_dir).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
